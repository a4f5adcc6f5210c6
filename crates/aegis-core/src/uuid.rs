//! Peer and extender identities.
//!
//! An identity is a 128-bit value. Peer identities are derived from the
//! peer's long-term public signing key by hashing it with two fixed site
//! keys; a version nibble, a 3-bit type tag and a 3-bit signature-algorithm
//! tag are then overlaid. Extender identities are random.
//!
//! Verification re-derives the value from a claimed public key and compares
//! every bit outside the overlaid tag positions.

use aegis_crypto::hash::keyed_hash64;
use aegis_crypto::signatures::{SignatureAlgorithm, SigningKeyPair};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SITE_KEY_1: [u8; 16] = [33, 66, 99, 33, 66, 99, 33, 66, 99, 33, 66, 99, 33, 66, 99, 33];
const SITE_KEY_2: [u8; 16] = [99, 66, 33, 99, 66, 33, 99, 66, 33, 99, 66, 33, 99, 66, 33, 99];

const VERSION: u8 = 0b0000_1001;
const VERSION_MASK: u8 = 0b0000_1111;

const VARIANT_PEER: u8 = 0b0000_0011;
const VARIANT_EXTENDER: u8 = 0b0000_0110;
const VARIANT_MASK: u8 = 0b0000_0111;

const SIGN_ALG_ED25519: u8 = 0b0000_1000;
const SIGN_ALG_ED448: u8 = 0b0001_0000;
const SIGN_ALG_MASK: u8 = 0b0011_1000;

/// Byte holding the version nibble
const VERSION_BYTE: usize = 6;
/// Byte holding the variant and signature-algorithm tags
const TAG_BYTE: usize = 8;

/// What an identity names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidType {
    /// Not a valid identity
    Unknown,
    /// A peer (derived from a signing key)
    Peer,
    /// An extender (random)
    Extender,
}

/// A 128-bit peer or extender identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// Create a fresh peer identity together with its signing keypair
    ///
    /// # Errors
    ///
    /// Fails if keypair generation fails or the algorithm is unsupported.
    pub fn new_peer(algorithm: SignatureAlgorithm) -> Result<(Self, SigningKeyPair)> {
        let keys = SigningKeyPair::generate(algorithm)?;
        let uuid = Self::from_public_key(algorithm, &keys.public);
        Ok((uuid, keys))
    }

    /// Derive the peer identity for a long-term public signing key
    #[must_use]
    pub fn from_public_key(algorithm: SignatureAlgorithm, public_key: &[u8]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&keyed_hash64(public_key, &SITE_KEY_1).to_be_bytes());
        bytes[8..].copy_from_slice(&keyed_hash64(public_key, &SITE_KEY_2).to_be_bytes());

        let mut uuid = Self(bytes);
        uuid.set_version();
        uuid.set_variant(VARIANT_PEER);
        uuid.set_sign_algorithm(algorithm);
        uuid
    }

    /// Create a fresh random extender identity
    #[must_use]
    pub fn new_extender() -> Self {
        let mut bytes = [0u8; 16];
        aegis_crypto::random::fill(&mut bytes);

        let mut uuid = Self(bytes);
        uuid.set_version();
        uuid.set_variant(VARIANT_EXTENDER);
        uuid
    }

    /// Verify that this peer identity is derivable from `public_key`.
    ///
    /// Compares every bit except the version nibble and the type and
    /// signature-algorithm tags.
    #[must_use]
    pub fn verify(&self, public_key: &[u8]) -> bool {
        if self.uuid_type() != UuidType::Peer || public_key.is_empty() {
            return false;
        }

        let mut derived = [0u8; 16];
        derived[..8].copy_from_slice(&keyed_hash64(public_key, &SITE_KEY_1).to_be_bytes());
        derived[8..].copy_from_slice(&keyed_hash64(public_key, &SITE_KEY_2).to_be_bytes());

        for i in 0..16 {
            let mask = match i {
                VERSION_BYTE => !VERSION_MASK,
                TAG_BYTE => !(VARIANT_MASK | SIGN_ALG_MASK),
                _ => 0xFF,
            };
            if self.0[i] & mask != derived[i] & mask {
                return false;
            }
        }
        true
    }

    /// What this identity names
    #[must_use]
    pub fn uuid_type(&self) -> UuidType {
        if self.0[VERSION_BYTE] & VERSION_MASK != VERSION {
            return UuidType::Unknown;
        }
        match self.0[TAG_BYTE] & VARIANT_MASK {
            VARIANT_PEER => match self.0[TAG_BYTE] & SIGN_ALG_MASK {
                SIGN_ALG_ED25519 | SIGN_ALG_ED448 => UuidType::Peer,
                _ => UuidType::Unknown,
            },
            VARIANT_EXTENDER => UuidType::Extender,
            _ => UuidType::Unknown,
        }
    }

    /// The signature algorithm tag of a peer identity
    #[must_use]
    pub fn signature_algorithm(&self) -> Option<SignatureAlgorithm> {
        if self.uuid_type() != UuidType::Peer {
            return None;
        }
        match self.0[TAG_BYTE] & SIGN_ALG_MASK {
            SIGN_ALG_ED25519 => Some(SignatureAlgorithm::Ed25519),
            SIGN_ALG_ED448 => Some(SignatureAlgorithm::Ed448),
            _ => None,
        }
    }

    /// True when the identity carries a recognized version and type
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.uuid_type() != UuidType::Unknown
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Construct from raw bytes without validity checks
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    fn set_version(&mut self) {
        self.0[VERSION_BYTE] = (self.0[VERSION_BYTE] & !VERSION_MASK) | VERSION;
    }

    fn set_variant(&mut self, variant: u8) {
        self.0[TAG_BYTE] = (self.0[TAG_BYTE] & !VARIANT_MASK) | variant;
    }

    fn set_sign_algorithm(&mut self, algorithm: SignatureAlgorithm) {
        let tag = match algorithm {
            SignatureAlgorithm::Ed25519 => SIGN_ALG_ED25519,
            SignatureAlgorithm::Ed448 => SIGN_ALG_ED448,
        };
        self.0[TAG_BYTE] = (self.0[TAG_BYTE] & !SIGN_ALG_MASK) | tag;
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

impl FromStr for Uuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let groups: Vec<&str> = s.split('-').collect();
        if groups.len() != 5
            || groups[0].len() != 8
            || groups[1].len() != 4
            || groups[2].len() != 4
            || groups[3].len() != 4
            || groups[4].len() != 12
        {
            return Err(Error::invalid_argument("malformed UUID string"));
        }

        let hex: String = groups.concat();
        let mut bytes = [0u8; 16];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk)
                .map_err(|_| Error::invalid_argument("malformed UUID string"))?;
            bytes[i] = u8::from_str_radix(s, 16)
                .map_err(|_| Error::invalid_argument("malformed UUID string"))?;
        }

        let uuid = Self(bytes);
        if !uuid.is_valid() {
            return Err(Error::invalid_argument("UUID has unknown version or type"));
        }
        Ok(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_identity_derivation() {
        let (uuid, keys) = Uuid::new_peer(SignatureAlgorithm::Ed25519).unwrap();
        assert_eq!(uuid.uuid_type(), UuidType::Peer);
        assert_eq!(
            uuid.signature_algorithm(),
            Some(SignatureAlgorithm::Ed25519)
        );
        assert!(uuid.verify(&keys.public));

        // Same key, same identity
        let again = Uuid::from_public_key(SignatureAlgorithm::Ed25519, &keys.public);
        assert_eq!(uuid, again);
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let (uuid, _keys) = Uuid::new_peer(SignatureAlgorithm::Ed25519).unwrap();
        let (_uuid2, other) = Uuid::new_peer(SignatureAlgorithm::Ed25519).unwrap();
        assert!(!uuid.verify(&other.public));
        assert!(!uuid.verify(&[]));
    }

    #[test]
    fn test_extender_identity() {
        let a = Uuid::new_extender();
        let b = Uuid::new_extender();
        assert_eq!(a.uuid_type(), UuidType::Extender);
        assert_eq!(a.signature_algorithm(), None);
        assert_ne!(a, b);
        // Extender identities never verify as peers
        assert!(!a.verify(&[1, 2, 3]));
    }

    #[test]
    fn test_string_roundtrip() {
        let (uuid, _) = Uuid::new_peer(SignatureAlgorithm::Ed25519).unwrap();
        let s = uuid.to_string();
        assert_eq!(s.len(), 36);
        let parsed: Uuid = s.parse().unwrap();
        assert_eq!(parsed, uuid);

        let ext = Uuid::new_extender();
        let parsed: Uuid = ext.to_string().parse().unwrap();
        assert_eq!(parsed, ext);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Uuid>().is_err());
        assert!("not-a-uuid".parse::<Uuid>().is_err());
        assert!(
            "zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz"
                .parse::<Uuid>()
                .is_err()
        );
        // Well-formed hex but unknown version/type bits
        assert!(
            "00000000-0000-0000-0000-000000000000"
                .parse::<Uuid>()
                .is_err()
        );
    }

    #[test]
    fn test_invalid_version_detected() {
        let (uuid, _) = Uuid::new_peer(SignatureAlgorithm::Ed25519).unwrap();
        let mut bytes = *uuid.as_bytes();
        bytes[VERSION_BYTE] &= 0xF0; // clear version nibble
        assert_eq!(Uuid::from_bytes(bytes).uuid_type(), UuidType::Unknown);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_derived_identity_always_verifies(key in prop::collection::vec(any::<u8>(), 1..64)) {
                let uuid = Uuid::from_public_key(SignatureAlgorithm::Ed25519, &key);
                prop_assert!(uuid.verify(&key));
                prop_assert_eq!(uuid.uuid_type(), UuidType::Peer);
            }

            #[test]
            fn prop_string_roundtrip(key in prop::collection::vec(any::<u8>(), 1..64)) {
                let uuid = Uuid::from_public_key(SignatureAlgorithm::Ed25519, &key);
                let parsed: Uuid = uuid.to_string().parse().unwrap();
                prop_assert_eq!(parsed, uuid);
            }
        }
    }
}
