//! Long-term identity signatures.

use crate::error::CryptoError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Identity signature algorithms.
///
/// Ed448 is a recognized identity tag for interop with peers that carry such
/// identities, but no Ed448 backend is linked; signing or verifying with it
/// fails with [`CryptoError::UnsupportedAlgorithm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SignatureAlgorithm {
    /// EdDSA over edwards25519
    Ed25519 = 1,
    /// EdDSA over edwards448
    Ed448 = 2,
}

/// A long-term signing keypair
#[derive(Debug)]
pub struct SigningKeyPair {
    /// Algorithm the keypair belongs to
    pub algorithm: SignatureAlgorithm,
    /// Public half
    pub public: Vec<u8>,
    /// Private half, wiped on drop
    pub private: Zeroizing<Vec<u8>>,
}

impl SigningKeyPair {
    /// Generate a fresh signing keypair
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedAlgorithm`] for Ed448.
    pub fn generate(algorithm: SignatureAlgorithm) -> Result<Self, CryptoError> {
        match algorithm {
            SignatureAlgorithm::Ed25519 => {
                let key = SigningKey::generate(&mut rand_core::OsRng);
                Ok(Self {
                    algorithm,
                    public: key.verifying_key().to_bytes().to_vec(),
                    private: Zeroizing::new(key.to_bytes().to_vec()),
                })
            }
            SignatureAlgorithm::Ed448 => Err(CryptoError::UnsupportedAlgorithm("Ed448")),
        }
    }
}

/// Sign a message with a private key
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] for malformed key material and
/// [`CryptoError::UnsupportedAlgorithm`] for Ed448.
pub fn sign(
    algorithm: SignatureAlgorithm,
    private: &[u8],
    message: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let key_bytes: [u8; 32] = private
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Ed25519 private key must be 32 bytes"))?;
            let key = SigningKey::from_bytes(&key_bytes);
            Ok(key.sign(message).to_bytes().to_vec())
        }
        SignatureAlgorithm::Ed448 => Err(CryptoError::UnsupportedAlgorithm("Ed448")),
    }
}

/// Verify a signature over a message
///
/// # Errors
///
/// Returns [`CryptoError::SignatureInvalid`] when the signature does not
/// verify, [`CryptoError::InvalidKey`] for malformed inputs, and
/// [`CryptoError::UnsupportedAlgorithm`] for Ed448.
pub fn verify(
    algorithm: SignatureAlgorithm,
    public: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let key_bytes: [u8; 32] = public
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Ed25519 public key must be 32 bytes"))?;
            let key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| CryptoError::InvalidKey("malformed Ed25519 public key"))?;
            let sig_bytes: [u8; 64] = signature
                .try_into()
                .map_err(|_| CryptoError::SignatureInvalid)?;
            key.verify(message, &Signature::from_bytes(&sig_bytes))
                .map_err(|_| CryptoError::SignatureInvalid)
        }
        SignatureAlgorithm::Ed448 => Err(CryptoError::UnsupportedAlgorithm("Ed448")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let pair = SigningKeyPair::generate(SignatureAlgorithm::Ed25519).unwrap();
        let sig = sign(SignatureAlgorithm::Ed25519, &pair.private, b"transcript").unwrap();
        assert_eq!(sig.len(), crate::ED25519_SIGNATURE_SIZE);
        verify(SignatureAlgorithm::Ed25519, &pair.public, b"transcript", &sig).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let pair = SigningKeyPair::generate(SignatureAlgorithm::Ed25519).unwrap();
        let sig = sign(SignatureAlgorithm::Ed25519, &pair.private, b"message").unwrap();
        assert_eq!(
            verify(SignatureAlgorithm::Ed25519, &pair.public, b"other", &sig),
            Err(CryptoError::SignatureInvalid)
        );
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let pair = SigningKeyPair::generate(SignatureAlgorithm::Ed25519).unwrap();
        let other = SigningKeyPair::generate(SignatureAlgorithm::Ed25519).unwrap();
        let sig = sign(SignatureAlgorithm::Ed25519, &pair.private, b"message").unwrap();
        assert!(verify(SignatureAlgorithm::Ed25519, &other.public, b"message", &sig).is_err());
    }

    #[test]
    fn test_ed448_unsupported() {
        assert_eq!(
            SigningKeyPair::generate(SignatureAlgorithm::Ed448).unwrap_err(),
            CryptoError::UnsupportedAlgorithm("Ed448")
        );
    }
}
