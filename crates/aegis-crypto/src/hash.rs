//! Digests and keyed 64-bit hashing.
//!
//! The keyed 64-bit hash backs identity derivation (fixed site keys) and the
//! process-lifetime non-persistent hash used for hashtable keying.

use crate::algorithms::HashAlgorithm;
use blake2::{Blake2b512, Blake2s256};
use sha2::{Digest, Sha256, Sha512};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Compute a digest with the given algorithm
#[must_use]
pub fn digest(alg: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match alg {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        HashAlgorithm::Blake2s256 => Blake2s256::digest(data).to_vec(),
        HashAlgorithm::Blake2b512 => Blake2b512::digest(data).to_vec(),
    }
}

/// Digest output size in bytes
#[must_use]
pub fn output_size(alg: HashAlgorithm) -> usize {
    match alg {
        HashAlgorithm::Sha256 | HashAlgorithm::Blake2s256 => 32,
        HashAlgorithm::Sha512 | HashAlgorithm::Blake2b512 => 64,
    }
}

/// Keyed 64-bit hash (SipHash-1-3) with an explicit 128-bit key
#[must_use]
pub fn keyed_hash64(data: &[u8], key: &[u8; 16]) -> u64 {
    let k0 = u64::from_le_bytes(key[0..8].try_into().expect("slice length"));
    let k1 = u64::from_le_bytes(key[8..16].try_into().expect("slice length"));
    let mut hasher = SipHasher13::new_with_keys(k0, k1);
    hasher.write(data);
    hasher.finish()
}

/// Keyed 64-bit hash with the process-lifetime random key.
///
/// Values are stable within one process run and never persisted.
#[must_use]
pub fn nonpersistent_hash64(data: &[u8]) -> u64 {
    let key = crate::nonpersistent_key();
    keyed_hash64(data, &key)
}
