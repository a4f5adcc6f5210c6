//! # AEGIS Crypto
//!
//! Cryptographic primitives for the AEGIS peer-to-peer framework.
//!
//! This crate provides:
//! - Algorithm registry and supported-set negotiation
//! - X25519 key agreement and post-quantum KEMs (Kyber768, NTRU Prime)
//! - AEAD encryption (AES-256-GCM, ChaCha20-Poly1305)
//! - SHA-2 and BLAKE2 digests plus keyed 64-bit hashing
//! - HKDF-based session key derivation
//! - Ed25519 identity signatures
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithms |
//! |----------|------------|
//! | Key Exchange | X25519 |
//! | KEM | Kyber768, NTRU Prime sntrup857 |
//! | AEAD | AES-256-GCM, ChaCha20-Poly1305 |
//! | Hash | SHA-256, SHA-512, BLAKE2s-256, BLAKE2b-512 |
//! | KDF | HKDF over the negotiated hash |
//! | Signatures | Ed25519 |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod algorithms;
pub mod error;
pub mod exchange;
pub mod hash;
pub mod kdf;
pub mod random;
pub mod signatures;

pub use aead::SymmetricCipher;
pub use algorithms::{
    Algorithms, CompressionAlgorithm, HashAlgorithm, KemAlgorithm, KeyExchangeAlgorithm,
    SupportedAlgorithms, SymmetricAlgorithm,
};
pub use error::CryptoError;
pub use exchange::KeyPair;
pub use kdf::SessionKeys;
pub use signatures::SignatureAlgorithm;

use std::sync::RwLock;
use zeroize::Zeroize;

/// X25519 public and secret key size
pub const X25519_KEY_SIZE: usize = 32;

/// AEAD symmetric key size
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// AEAD nonce size
pub const NONCE_SIZE: usize = 12;

/// AEAD authentication tag size
pub const AUTH_TAG_SIZE: usize = 16;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

struct ProcessState {
    nonpersistent_key: [u8; 16],
}

impl Drop for ProcessState {
    fn drop(&mut self) {
        self.nonpersistent_key.zeroize();
    }
}

static PROCESS_STATE: RwLock<Option<ProcessState>> = RwLock::new(None);

/// Initialize process-lifetime cryptographic state.
///
/// Installs the random key used by [`hash::nonpersistent_hash64`]. Idempotent;
/// called implicitly on first use, exposed for deterministic setup in tests.
pub fn init() {
    let mut state = PROCESS_STATE.write().expect("crypto state lock poisoned");
    if state.is_none() {
        let mut key = [0u8; 16];
        random::fill(&mut key);
        *state = Some(ProcessState {
            nonpersistent_key: key,
        });
    }
}

/// Tear down process-lifetime cryptographic state, wiping the keys it holds.
pub fn shutdown() {
    let mut state = PROCESS_STATE.write().expect("crypto state lock poisoned");
    *state = None;
}

pub(crate) fn nonpersistent_key() -> [u8; 16] {
    {
        let state = PROCESS_STATE.read().expect("crypto state lock poisoned");
        if let Some(s) = state.as_ref() {
            return s.nonpersistent_key;
        }
    }
    init();
    PROCESS_STATE
        .read()
        .expect("crypto state lock poisoned")
        .as_ref()
        .map(|s| s.nonpersistent_key)
        .unwrap_or([0u8; 16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_idempotent() {
        init();
        init();
        let key1 = nonpersistent_key();
        let key2 = nonpersistent_key();
        assert_eq!(key1, key2);
        assert_ne!(key1, [0u8; 16]);
    }
}
