//! Session key derivation.
//!
//! The handshake combines the classical and post-quantum shared secrets (and
//! the optional global shared secret) into a master secret, then expands it
//! into directional AEAD keys and nonce bases with HKDF over the negotiated
//! hash.

use crate::algorithms::HashAlgorithm;
use crate::error::CryptoError;
use crate::hash;
use blake2::{Blake2b512, Blake2s256};
use hkdf::{Hkdf, SimpleHkdf};
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Directional keys derived from one handshake or rekey exchange
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key for sealing outbound frames
    pub tx_key: [u8; 32],
    /// Key for opening inbound frames
    pub rx_key: [u8; 32],
    /// Starting value of the outbound nonce counter
    pub tx_nonce_base: [u8; 12],
    /// Starting value the peer's outbound counter begins at
    pub rx_nonce_base: [u8; 12],
}

/// Combine shared secrets into the master secret.
///
/// `master = H(ecdh_shared ‖ kem_shared? ‖ global_shared_secret?)`. The
/// optional global secret acts as an additional authentication factor: a peer
/// without it derives different keys and fails the first authenticated frame.
#[must_use]
pub fn derive_master_secret(
    alg: HashAlgorithm,
    ecdh_shared: &[u8],
    kem_shared: Option<&[u8]>,
    global_shared_secret: Option<&[u8]>,
) -> Zeroizing<Vec<u8>> {
    let mut input = Zeroizing::new(Vec::with_capacity(
        ecdh_shared.len()
            + kem_shared.map_or(0, <[u8]>::len)
            + global_shared_secret.map_or(0, <[u8]>::len),
    ));
    input.extend_from_slice(ecdh_shared);
    if let Some(kem) = kem_shared {
        input.extend_from_slice(kem);
    }
    if let Some(global) = global_shared_secret {
        input.extend_from_slice(global);
    }
    Zeroizing::new(hash::digest(alg, &input))
}

fn expand<F>(expand_fn: F, initiator: bool) -> Result<SessionKeys, CryptoError>
where
    F: Fn(&[u8], &mut [u8]) -> Result<(), hkdf::InvalidLength>,
{
    let mut init_key = [0u8; 32];
    let mut resp_key = [0u8; 32];
    let mut init_nonce = [0u8; 12];
    let mut resp_nonce = [0u8; 12];

    expand_fn(b"aegis v1 initiator key", &mut init_key)
        .and_then(|()| expand_fn(b"aegis v1 responder key", &mut resp_key))
        .and_then(|()| expand_fn(b"aegis v1 initiator nonce", &mut init_nonce))
        .and_then(|()| expand_fn(b"aegis v1 responder nonce", &mut resp_nonce))
        .map_err(|_| CryptoError::KeyGenerationFailed)?;

    let keys = if initiator {
        SessionKeys {
            tx_key: init_key,
            rx_key: resp_key,
            tx_nonce_base: init_nonce,
            rx_nonce_base: resp_nonce,
        }
    } else {
        SessionKeys {
            tx_key: resp_key,
            rx_key: init_key,
            tx_nonce_base: resp_nonce,
            rx_nonce_base: init_nonce,
        }
    };

    init_key.zeroize();
    resp_key.zeroize();

    Ok(keys)
}

/// Expand a master secret into directional session keys.
///
/// `salt` binds the derivation to the handshake instance (both Hello nonces);
/// `initiator` selects which directional half becomes the send side, so both
/// peers derive mirrored keys.
///
/// # Errors
///
/// Returns [`CryptoError::KeyGenerationFailed`] if HKDF expansion fails.
pub fn derive_session_keys(
    alg: HashAlgorithm,
    master_secret: &[u8],
    salt: &[u8],
    initiator: bool,
) -> Result<SessionKeys, CryptoError> {
    match alg {
        HashAlgorithm::Sha256 => {
            let kdf = Hkdf::<Sha256>::new(Some(salt), master_secret);
            expand(|info, okm| kdf.expand(info, okm), initiator)
        }
        HashAlgorithm::Sha512 => {
            let kdf = Hkdf::<Sha512>::new(Some(salt), master_secret);
            expand(|info, okm| kdf.expand(info, okm), initiator)
        }
        HashAlgorithm::Blake2s256 => {
            let kdf = SimpleHkdf::<Blake2s256>::new(Some(salt), master_secret);
            expand(|info, okm| kdf.expand(info, okm), initiator)
        }
        HashAlgorithm::Blake2b512 => {
            let kdf = SimpleHkdf::<Blake2b512>::new(Some(salt), master_secret);
            expand(|info, okm| kdf.expand(info, okm), initiator)
        }
    }
}
