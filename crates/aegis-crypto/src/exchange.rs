//! Key agreement: X25519 and post-quantum KEMs.
//!
//! Keypairs are opaque byte buffers so they can sit in pregenerated pools
//! without the pool knowing the algorithm internals. Private halves are wiped
//! on drop.

use crate::algorithms::KemAlgorithm;
use crate::error::CryptoError;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// An asymmetric keypair as opaque bytes
pub struct KeyPair {
    /// Public half, sent on the wire
    pub public: Vec<u8>,
    /// Private half, wiped on drop
    pub private: Zeroizing<Vec<u8>>,
}

impl KeyPair {
    /// Generate a fresh X25519 keypair
    #[must_use]
    pub fn generate_exchange() -> Self {
        let secret = StaticSecret::random_from_rng(rand_core::OsRng);
        let public = PublicKey::from(&secret);
        Self {
            public: public.as_bytes().to_vec(),
            private: Zeroizing::new(secret.to_bytes().to_vec()),
        }
    }

    /// Generate a fresh KEM keypair
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedAlgorithm`] for [`KemAlgorithm::None`].
    pub fn generate_kem(alg: KemAlgorithm) -> Result<Self, CryptoError> {
        match alg {
            KemAlgorithm::None => Err(CryptoError::UnsupportedAlgorithm("KEM none")),
            KemAlgorithm::Kyber768 => {
                let (pk, sk) = pqcrypto_kyber::kyber768::keypair();
                Ok(Self {
                    public: pk.as_bytes().to_vec(),
                    private: Zeroizing::new(sk.as_bytes().to_vec()),
                })
            }
            KemAlgorithm::Ntrup857 => {
                let (pk, sk) = pqcrypto_ntruprime::sntrup857::keypair();
                Ok(Self {
                    public: pk.as_bytes().to_vec(),
                    private: Zeroizing::new(sk.as_bytes().to_vec()),
                })
            }
        }
    }
}

/// X25519 shared secret from our private key and the peer's public key
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] if either key is not 32 bytes.
pub fn ecdh(private: &[u8], peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let private: [u8; 32] = private
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("X25519 private key must be 32 bytes"))?;
    let peer: [u8; 32] = peer_public
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("X25519 public key must be 32 bytes"))?;

    let secret = StaticSecret::from(private);
    let shared = secret.diffie_hellman(&PublicKey::from(peer));
    Ok(Zeroizing::new(*shared.as_bytes()))
}

/// Encapsulate against a peer's KEM public key.
///
/// Returns `(ciphertext, shared_secret)`; the ciphertext goes back to the
/// keypair owner, who recovers the same secret via [`kem_decapsulate`].
///
/// # Errors
///
/// Returns [`CryptoError::KemFailed`] on malformed key material and
/// [`CryptoError::UnsupportedAlgorithm`] for [`KemAlgorithm::None`].
pub fn kem_encapsulate(
    alg: KemAlgorithm,
    peer_public: &[u8],
) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), CryptoError> {
    match alg {
        KemAlgorithm::None => Err(CryptoError::UnsupportedAlgorithm("KEM none")),
        KemAlgorithm::Kyber768 => {
            let pk = pqcrypto_kyber::kyber768::PublicKey::from_bytes(peer_public)
                .map_err(|_| CryptoError::KemFailed("malformed Kyber768 public key"))?;
            let (ss, ct) = pqcrypto_kyber::kyber768::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), Zeroizing::new(ss.as_bytes().to_vec())))
        }
        KemAlgorithm::Ntrup857 => {
            let pk = pqcrypto_ntruprime::sntrup857::PublicKey::from_bytes(peer_public)
                .map_err(|_| CryptoError::KemFailed("malformed sntrup857 public key"))?;
            let (ss, ct) = pqcrypto_ntruprime::sntrup857::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), Zeroizing::new(ss.as_bytes().to_vec())))
        }
    }
}

/// Recover the shared secret from a KEM ciphertext with our private key
///
/// # Errors
///
/// Returns [`CryptoError::KemFailed`] on malformed inputs and
/// [`CryptoError::UnsupportedAlgorithm`] for [`KemAlgorithm::None`].
pub fn kem_decapsulate(
    alg: KemAlgorithm,
    private: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    match alg {
        KemAlgorithm::None => Err(CryptoError::UnsupportedAlgorithm("KEM none")),
        KemAlgorithm::Kyber768 => {
            let sk = pqcrypto_kyber::kyber768::SecretKey::from_bytes(private)
                .map_err(|_| CryptoError::KemFailed("malformed Kyber768 private key"))?;
            let ct = pqcrypto_kyber::kyber768::Ciphertext::from_bytes(ciphertext)
                .map_err(|_| CryptoError::KemFailed("malformed Kyber768 ciphertext"))?;
            let ss = pqcrypto_kyber::kyber768::decapsulate(&ct, &sk);
            Ok(Zeroizing::new(ss.as_bytes().to_vec()))
        }
        KemAlgorithm::Ntrup857 => {
            let sk = pqcrypto_ntruprime::sntrup857::SecretKey::from_bytes(private)
                .map_err(|_| CryptoError::KemFailed("malformed sntrup857 private key"))?;
            let ct = pqcrypto_ntruprime::sntrup857::Ciphertext::from_bytes(ciphertext)
                .map_err(|_| CryptoError::KemFailed("malformed sntrup857 ciphertext"))?;
            let ss = pqcrypto_ntruprime::sntrup857::decapsulate(&ct, &sk);
            Ok(Zeroizing::new(ss.as_bytes().to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecdh_agreement() {
        let alice = KeyPair::generate_exchange();
        let bob = KeyPair::generate_exchange();

        let s1 = ecdh(&alice.private, &bob.public).unwrap();
        let s2 = ecdh(&bob.private, &alice.public).unwrap();
        assert_eq!(*s1, *s2);
    }

    #[test]
    fn test_ecdh_rejects_bad_lengths() {
        let pair = KeyPair::generate_exchange();
        assert!(ecdh(&pair.private, &[0u8; 16]).is_err());
        assert!(ecdh(&[0u8; 31], &pair.public).is_err());
    }

    #[test]
    fn test_kyber_roundtrip() {
        let pair = KeyPair::generate_kem(KemAlgorithm::Kyber768).unwrap();
        let (ct, ss1) = kem_encapsulate(KemAlgorithm::Kyber768, &pair.public).unwrap();
        let ss2 = kem_decapsulate(KemAlgorithm::Kyber768, &pair.private, &ct).unwrap();
        assert_eq!(*ss1, *ss2);
    }

    #[test]
    fn test_ntrup_roundtrip() {
        let pair = KeyPair::generate_kem(KemAlgorithm::Ntrup857).unwrap();
        let (ct, ss1) = kem_encapsulate(KemAlgorithm::Ntrup857, &pair.public).unwrap();
        let ss2 = kem_decapsulate(KemAlgorithm::Ntrup857, &pair.private, &ct).unwrap();
        assert_eq!(*ss1, *ss2);
    }

    #[test]
    fn test_kem_none_unsupported() {
        assert!(KeyPair::generate_kem(KemAlgorithm::None).is_err());
        assert!(kem_encapsulate(KemAlgorithm::None, &[]).is_err());
    }
}
