//! AEAD sealing and opening.
//!
//! One cipher object per installed symmetric key; the variant is fixed by the
//! negotiated symmetric algorithm.

use crate::algorithms::SymmetricAlgorithm;
use crate::error::CryptoError;
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};

/// AEAD cipher for frame encryption
pub enum SymmetricCipher {
    /// AES-256-GCM
    Aes256Gcm(Box<Aes256Gcm>),
    /// ChaCha20-Poly1305
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl std::fmt::Debug for SymmetricCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Aes256Gcm(_) => "Aes256Gcm",
            Self::ChaCha20Poly1305(_) => "ChaCha20Poly1305",
        };
        f.debug_tuple(name).field(&"..").finish()
    }
}

impl SymmetricCipher {
    /// Create a cipher for the negotiated algorithm with a 256-bit key
    #[must_use]
    pub fn new(alg: SymmetricAlgorithm, key: &[u8; 32]) -> Self {
        match alg {
            SymmetricAlgorithm::Aes256Gcm => {
                Self::Aes256Gcm(Box::new(Aes256Gcm::new(key.into())))
            }
            SymmetricAlgorithm::ChaCha20Poly1305 => {
                Self::ChaCha20Poly1305(Box::new(ChaCha20Poly1305::new(key.into())))
            }
        }
    }

    /// The algorithm this cipher was created for
    #[must_use]
    pub fn algorithm(&self) -> SymmetricAlgorithm {
        match self {
            Self::Aes256Gcm(_) => SymmetricAlgorithm::Aes256Gcm,
            Self::ChaCha20Poly1305(_) => SymmetricAlgorithm::ChaCha20Poly1305,
        }
    }

    /// Seal plaintext; the 16-byte tag is appended to the ciphertext
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the underlying cipher
    /// rejects the input.
    pub fn seal(
        &self,
        nonce: &[u8; 12],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match self {
            Self::Aes256Gcm(c) => c.encrypt(nonce.into(), payload),
            Self::ChaCha20Poly1305(c) => c.encrypt(nonce.into(), payload),
        }
        .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open ciphertext-with-tag produced by [`SymmetricCipher::seal`]
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if authentication fails.
    pub fn open(
        &self,
        nonce: &[u8; 12],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match self {
            Self::Aes256Gcm(c) => c.decrypt(nonce.into(), payload),
            Self::ChaCha20Poly1305(c) => c.decrypt(nonce.into(), payload),
        }
        .map_err(|_| CryptoError::DecryptionFailed)
    }
}
