//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors from cryptographic operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD sealing failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD opening failed (authentication tag mismatch)
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// Key material has the wrong length or encoding
    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),

    /// Signature did not verify
    #[error("signature verification failed")]
    SignatureInvalid,

    /// Key or keypair generation failed
    #[error("key generation failed")]
    KeyGenerationFailed,

    /// KEM encapsulation or decapsulation failed
    #[error("KEM operation failed: {0}")]
    KemFailed(&'static str),

    /// No common algorithm in one of the negotiated slots
    #[error("no common {0} algorithm")]
    NoCommonAlgorithm(&'static str),

    /// The algorithm is recognized but no implementation is carried
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(&'static str),
}
