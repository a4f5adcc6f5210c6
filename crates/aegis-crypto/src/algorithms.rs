//! Algorithm registry and supported-set negotiation.
//!
//! A connection negotiates one algorithm per slot (hash, primary asymmetric,
//! secondary asymmetric, symmetric, compression) during the Hello exchange.
//! Both sides compute the same result from the two supported sets, so the
//! selection needs no extra round trip.

use crate::error::CryptoError;
use serde::{Deserialize, Serialize};

/// Digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HashAlgorithm {
    /// SHA-256
    Sha256 = 1,
    /// SHA-512
    Sha512 = 2,
    /// BLAKE2s-256
    Blake2s256 = 3,
    /// BLAKE2b-512
    Blake2b512 = 4,
}

/// Primary asymmetric algorithms (classical key agreement)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyExchangeAlgorithm {
    /// X25519 Diffie-Hellman
    EcdhX25519 = 1,
}

/// Secondary asymmetric algorithms (post-quantum KEMs)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KemAlgorithm {
    /// No secondary exchange
    None = 0,
    /// CRYSTALS-Kyber 768
    Kyber768 = 1,
    /// Streamlined NTRU Prime sntrup857
    Ntrup857 = 2,
}

/// AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SymmetricAlgorithm {
    /// AES-256 in GCM mode
    Aes256Gcm = 1,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305 = 2,
}

/// Payload compression codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    /// No compression
    None = 0,
    /// DEFLATE
    Deflate = 1,
    /// Zstandard
    Zstd = 2,
}

/// The negotiated algorithm quintuple for a connection.
///
/// Immutable once the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Algorithms {
    /// Digest used for transcripts and key derivation
    pub hash: HashAlgorithm,
    /// Classical key agreement
    pub primary_asymmetric: KeyExchangeAlgorithm,
    /// Post-quantum KEM mixed into the shared secret
    pub secondary_asymmetric: KemAlgorithm,
    /// AEAD cipher for message sealing
    pub symmetric: SymmetricAlgorithm,
    /// Payload compression
    pub compression: CompressionAlgorithm,
}

/// The locally supported algorithms, one list per slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedAlgorithms {
    /// Supported digests
    pub hashes: Vec<HashAlgorithm>,
    /// Supported classical exchanges
    pub primary_asymmetric: Vec<KeyExchangeAlgorithm>,
    /// Supported KEMs
    pub secondary_asymmetric: Vec<KemAlgorithm>,
    /// Supported AEAD ciphers
    pub symmetric: Vec<SymmetricAlgorithm>,
    /// Supported compression codecs
    pub compression: Vec<CompressionAlgorithm>,
}

impl Default for SupportedAlgorithms {
    fn default() -> Self {
        Self {
            hashes: vec![
                HashAlgorithm::Sha256,
                HashAlgorithm::Sha512,
                HashAlgorithm::Blake2s256,
                HashAlgorithm::Blake2b512,
            ],
            primary_asymmetric: vec![KeyExchangeAlgorithm::EcdhX25519],
            secondary_asymmetric: vec![
                KemAlgorithm::None,
                KemAlgorithm::Kyber768,
                KemAlgorithm::Ntrup857,
            ],
            symmetric: vec![
                SymmetricAlgorithm::Aes256Gcm,
                SymmetricAlgorithm::ChaCha20Poly1305,
            ],
            compression: vec![
                CompressionAlgorithm::None,
                CompressionAlgorithm::Deflate,
                CompressionAlgorithm::Zstd,
            ],
        }
    }
}

fn pick<T: Copy + Ord>(ours: &[T], theirs: &[T]) -> Option<T> {
    ours.iter()
        .filter(|a| theirs.contains(a))
        .copied()
        .min()
}

impl SupportedAlgorithms {
    /// Negotiate the algorithm quintuple against a remote supported set.
    ///
    /// For each slot the lowest common algorithm identifier wins, so both
    /// sides reach the same result independent of list ordering.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoCommonAlgorithm`] naming the first slot with
    /// an empty intersection.
    pub fn negotiate(&self, theirs: &SupportedAlgorithms) -> Result<Algorithms, CryptoError> {
        let hash = pick(&self.hashes, &theirs.hashes)
            .ok_or(CryptoError::NoCommonAlgorithm("hash"))?;
        let primary = pick(&self.primary_asymmetric, &theirs.primary_asymmetric)
            .ok_or(CryptoError::NoCommonAlgorithm("primary asymmetric"))?;
        let secondary = pick(&self.secondary_asymmetric, &theirs.secondary_asymmetric)
            .ok_or(CryptoError::NoCommonAlgorithm("secondary asymmetric"))?;
        let symmetric = pick(&self.symmetric, &theirs.symmetric)
            .ok_or(CryptoError::NoCommonAlgorithm("symmetric"))?;
        let compression = pick(&self.compression, &theirs.compression)
            .ok_or(CryptoError::NoCommonAlgorithm("compression"))?;

        Ok(Algorithms {
            hash,
            primary_asymmetric: primary,
            secondary_asymmetric: secondary,
            symmetric,
            compression,
        })
    }

    /// All KEM algorithms in the set that require key material
    #[must_use]
    pub fn enabled_kems(&self) -> Vec<KemAlgorithm> {
        self.secondary_asymmetric
            .iter()
            .copied()
            .filter(|k| *k != KemAlgorithm::None)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_defaults() {
        let a = SupportedAlgorithms::default();
        let b = SupportedAlgorithms::default();
        let algs = a.negotiate(&b).unwrap();
        assert_eq!(algs.hash, HashAlgorithm::Sha256);
        assert_eq!(algs.symmetric, SymmetricAlgorithm::Aes256Gcm);
        assert_eq!(algs.secondary_asymmetric, KemAlgorithm::None);
    }

    #[test]
    fn test_negotiate_symmetric_on_both_sides() {
        let mut a = SupportedAlgorithms::default();
        let mut b = SupportedAlgorithms::default();
        a.hashes = vec![HashAlgorithm::Blake2b512, HashAlgorithm::Sha512];
        b.hashes = vec![HashAlgorithm::Sha512, HashAlgorithm::Blake2b512];

        let ab = a.negotiate(&b).unwrap();
        let ba = b.negotiate(&a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.hash, HashAlgorithm::Sha512);
    }

    #[test]
    fn test_negotiate_mismatch() {
        let mut a = SupportedAlgorithms::default();
        let mut b = SupportedAlgorithms::default();
        a.symmetric = vec![SymmetricAlgorithm::Aes256Gcm];
        b.symmetric = vec![SymmetricAlgorithm::ChaCha20Poly1305];

        assert_eq!(
            a.negotiate(&b),
            Err(CryptoError::NoCommonAlgorithm("symmetric"))
        );
    }

    #[test]
    fn test_enabled_kems_skips_none() {
        let s = SupportedAlgorithms::default();
        let kems = s.enabled_kems();
        assert!(!kems.contains(&KemAlgorithm::None));
        assert_eq!(kems.len(), 2);
    }
}
