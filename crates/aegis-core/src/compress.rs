//! Payload compression codecs.
//!
//! Frames flag compressed payloads and carry the uncompressed length so the
//! receiver can bound its allocation before inflating.

use aegis_crypto::algorithms::CompressionAlgorithm;
use crate::error::{Error, Result};
use std::io::Read;

/// A payload compression codec
pub trait Codec: Send + Sync {
    /// Compress `data`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] if the codec rejects the input.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `data`, which must inflate to exactly `expected_len` bytes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] for corrupt input or a length mismatch.
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}

struct DeflateCodec;

impl Codec for DeflateCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder =
            flate2::read::DeflateEncoder::new(data, flate2::Compression::default());
        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        encoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Failed(e.to_string().into()))?;
        Ok(out)
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let decoder = flate2::read::DeflateDecoder::new(data);
        let mut out = Vec::with_capacity(expected_len);
        // Read one byte past the expected size to detect oversized streams
        decoder
            .take(expected_len as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| Error::Failed(e.to_string().into()))?;
        if out.len() != expected_len {
            return Err(Error::failed("decompressed length mismatch"));
        }
        Ok(out)
    }
}

struct ZstdCodec;

impl Codec for ZstdCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(data, 0).map_err(|e| Error::Failed(e.to_string().into()))
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = zstd::bulk::decompress(data, expected_len)
            .map_err(|e| Error::Failed(e.to_string().into()))?;
        if out.len() != expected_len {
            return Err(Error::failed("decompressed length mismatch"));
        }
        Ok(out)
    }
}

static DEFLATE: DeflateCodec = DeflateCodec;
static ZSTD: ZstdCodec = ZstdCodec;

/// The codec for a negotiated compression algorithm, if any
#[must_use]
pub fn codec(alg: CompressionAlgorithm) -> Option<&'static dyn Codec> {
    match alg {
        CompressionAlgorithm::None => None,
        CompressionAlgorithm::Deflate => Some(&DEFLATE),
        CompressionAlgorithm::Zstd => Some(&ZSTD),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        // Compressible data
        b"the quick brown fox jumps over the lazy dog "
            .repeat(64)
            .to_vec()
    }

    #[test]
    fn test_roundtrip_both_codecs() {
        let data = sample();
        for alg in [CompressionAlgorithm::Deflate, CompressionAlgorithm::Zstd] {
            let c = codec(alg).unwrap();
            let compressed = c.compress(&data).unwrap();
            assert!(compressed.len() < data.len());
            let restored = c.decompress(&compressed, data.len()).unwrap();
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn test_none_has_no_codec() {
        assert!(codec(CompressionAlgorithm::None).is_none());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let data = sample();
        for alg in [CompressionAlgorithm::Deflate, CompressionAlgorithm::Zstd] {
            let c = codec(alg).unwrap();
            let compressed = c.compress(&data).unwrap();
            assert!(c.decompress(&compressed, data.len() - 1).is_err());
            assert!(c.decompress(&compressed, data.len() + 1).is_err());
        }
    }

    #[test]
    fn test_corrupt_input_rejected() {
        let garbage = vec![0xFFu8; 64];
        assert!(codec(CompressionAlgorithm::Zstd)
            .unwrap()
            .decompress(&garbage, 128)
            .is_err());
    }

    #[test]
    fn test_empty_payload() {
        for alg in [CompressionAlgorithm::Deflate, CompressionAlgorithm::Zstd] {
            let c = codec(alg).unwrap();
            let compressed = c.compress(&[]).unwrap();
            let restored = c.decompress(&compressed, 0).unwrap();
            assert!(restored.is_empty());
        }
    }
}
