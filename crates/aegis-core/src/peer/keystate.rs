//! Symmetric key state.
//!
//! Each peer holds a current key set, at most one pending set installed
//! during a rekey, and the previous set which stays usable for a bounded
//! grace window to absorb in-flight frames. Outbound nonces count up from a
//! random 96-bit base; inbound frames must carry a nonce strictly above the
//! highest accepted one under the same key.

use aegis_crypto::SymmetricCipher;
use aegis_crypto::algorithms::SymmetricAlgorithm;
use aegis_crypto::kdf::SessionKeys;
use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// 96-bit nonce space
const NONCE_MAX: u128 = (1 << 96) - 1;

/// Rekey is forced once the counter gets this close to the end
const NONCE_REKEY_MARGIN: u128 = 1 << 16;

fn nonce_to_bytes(value: u128) -> [u8; 12] {
    let bytes = value.to_be_bytes();
    bytes[4..16].try_into().expect("slice length")
}

fn nonce_from_bytes(bytes: &[u8; 12]) -> u128 {
    let mut wide = [0u8; 16];
    wide[4..].copy_from_slice(bytes);
    u128::from_be_bytes(wide)
}

/// Which key set opened a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUse {
    /// The current set
    Current,
    /// The pending set (peer already committed; promoted on first use)
    Pending,
    /// The previous set within its grace window
    Previous,
}

#[derive(Debug)]
struct KeySet {
    tx_cipher: SymmetricCipher,
    rx_cipher: SymmetricCipher,
    /// Next outbound nonce value
    tx_counter: u128,
    /// Highest accepted inbound nonce under this set
    rx_highest: Option<u128>,
    installed_at: Instant,
    bytes_processed: u64,
}

impl KeySet {
    fn new(algorithm: SymmetricAlgorithm, keys: &SessionKeys) -> Self {
        Self {
            tx_cipher: SymmetricCipher::new(algorithm, &keys.tx_key),
            rx_cipher: SymmetricCipher::new(algorithm, &keys.rx_key),
            tx_counter: nonce_from_bytes(&keys.tx_nonce_base),
            rx_highest: None,
            installed_at: Instant::now(),
            bytes_processed: 0,
        }
    }

    fn accept_nonce(&mut self, value: u128) -> Result<()> {
        if let Some(highest) = self.rx_highest {
            if value <= highest {
                return Err(Error::failed("nonce replay detected"));
            }
        }
        self.rx_highest = Some(value);
        Ok(())
    }
}

#[derive(Debug)]
struct RetiredKeySet {
    set: KeySet,
    retired_at: Instant,
}

/// The symmetric key state of one peer connection
#[derive(Debug)]
pub struct PeerKeys {
    algorithm: SymmetricAlgorithm,
    current: Option<KeySet>,
    pending: Option<KeySet>,
    previous: Option<RetiredKeySet>,
}

impl PeerKeys {
    /// Create with no keys installed
    #[must_use]
    pub fn new(algorithm: SymmetricAlgorithm) -> Self {
        Self {
            algorithm,
            current: None,
            pending: None,
            previous: None,
        }
    }

    /// Install the handshake keys as the current set
    pub fn install_initial(&mut self, keys: &SessionKeys) {
        self.current = Some(KeySet::new(self.algorithm, keys));
        self.pending = None;
        self.previous = None;
    }

    /// Install a freshly derived set as pending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] if a pending set already exists.
    pub fn install_pending(&mut self, keys: &SessionKeys) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::failed("pending key already installed"));
        }
        self.pending = Some(KeySet::new(self.algorithm, keys));
        Ok(())
    }

    /// Switch sending to the pending set; the old current set is retired
    /// into the grace window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] without a pending set.
    pub fn commit_pending(&mut self) -> Result<()> {
        let pending = self
            .pending
            .take()
            .ok_or(Error::failed("no pending key to commit"))?;
        if let Some(old) = self.current.replace(pending) {
            self.previous = Some(RetiredKeySet {
                set: old,
                retired_at: Instant::now(),
            });
        }
        Ok(())
    }

    /// Whether a pending set is installed
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether any key is installed
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.current.is_some()
    }

    /// Seal plaintext under the current key, returning the nonce used and
    /// the ciphertext-with-tag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] with no installed key, when the nonce space
    /// is exhausted, or when sealing fails.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<([u8; 12], Vec<u8>)> {
        let set = self
            .current
            .as_mut()
            .ok_or(Error::failed("no key installed"))?;
        if set.tx_counter >= NONCE_MAX {
            return Err(Error::failed("nonce space exhausted"));
        }
        let nonce = nonce_to_bytes(set.tx_counter);
        let ciphertext = set.tx_cipher.seal(&nonce, &[], plaintext)?;
        set.tx_counter += 1;
        set.bytes_processed += plaintext.len() as u64;
        Ok((nonce, ciphertext))
    }

    /// Open a received record, trying current, then pending, then the
    /// previous set within `previous_grace`.
    ///
    /// A frame that opens under the pending set proves the peer committed;
    /// the pending set is promoted to current and the old current retires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] for replayed nonces and
    /// [`Error::AuthFailure`]-mapped failures when no set opens the record.
    pub fn open(
        &mut self,
        nonce: &[u8; 12],
        ciphertext: &[u8],
        previous_grace: Duration,
    ) -> Result<(Vec<u8>, KeyUse)> {
        let value = nonce_from_bytes(nonce);

        if let Some(set) = self.current.as_mut() {
            if let Ok(plaintext) = set.rx_cipher.open(nonce, &[], ciphertext) {
                set.accept_nonce(value)?;
                set.bytes_processed += plaintext.len() as u64;
                return Ok((plaintext, KeyUse::Current));
            }
        }

        if let Some(set) = self.pending.as_mut() {
            if let Ok(plaintext) = set.rx_cipher.open(nonce, &[], ciphertext) {
                set.accept_nonce(value)?;
                set.bytes_processed += plaintext.len() as u64;
                self.commit_pending()?;
                return Ok((plaintext, KeyUse::Pending));
            }
        }

        if let Some(retired) = self.previous.as_mut() {
            if retired.retired_at.elapsed() <= previous_grace {
                if let Ok(plaintext) = retired.set.rx_cipher.open(nonce, &[], ciphertext) {
                    retired.set.accept_nonce(value)?;
                    return Ok((plaintext, KeyUse::Previous));
                }
            }
        }

        Err(Error::AuthFailure)
    }

    /// Drop the previous set once its grace window has passed
    pub fn expire_previous(&mut self, previous_grace: Duration) {
        if let Some(retired) = &self.previous {
            if retired.retired_at.elapsed() > previous_grace {
                self.previous = None;
            }
        }
    }

    /// Bytes sealed and opened under the current set
    #[must_use]
    pub fn bytes_processed(&self) -> u64 {
        self.current.as_ref().map_or(0, |s| s.bytes_processed)
    }

    /// Age of the current set
    #[must_use]
    pub fn current_key_age(&self) -> Duration {
        self.current
            .as_ref()
            .map_or(Duration::ZERO, |s| s.installed_at.elapsed())
    }

    /// Whether the outbound counter is close enough to the end of the nonce
    /// space that a rekey must happen before further frames
    #[must_use]
    pub fn nonce_exhaustion_imminent(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| s.tx_counter >= NONCE_MAX - NONCE_REKEY_MARGIN)
    }

    #[cfg(test)]
    pub(crate) fn force_tx_counter(&mut self, value: u128) {
        if let Some(set) = self.current.as_mut() {
            set.tx_counter = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_crypto::algorithms::HashAlgorithm;
    use aegis_crypto::kdf;

    const GRACE: Duration = Duration::from_secs(60);

    fn key_pair() -> (PeerKeys, PeerKeys) {
        let master = kdf::derive_master_secret(HashAlgorithm::Sha256, &[9u8; 32], None, None);
        let alice_keys =
            kdf::derive_session_keys(HashAlgorithm::Sha256, &master, b"salt", true).unwrap();
        let bob_keys =
            kdf::derive_session_keys(HashAlgorithm::Sha256, &master, b"salt", false).unwrap();

        let mut alice = PeerKeys::new(SymmetricAlgorithm::ChaCha20Poly1305);
        let mut bob = PeerKeys::new(SymmetricAlgorithm::ChaCha20Poly1305);
        alice.install_initial(&alice_keys);
        bob.install_initial(&bob_keys);
        (alice, bob)
    }

    fn rekeyed_pair(alice: &mut PeerKeys, bob: &mut PeerKeys) {
        let master = kdf::derive_master_secret(HashAlgorithm::Sha256, &[7u8; 32], None, None);
        let alice_keys =
            kdf::derive_session_keys(HashAlgorithm::Sha256, &master, b"rekey", true).unwrap();
        let bob_keys =
            kdf::derive_session_keys(HashAlgorithm::Sha256, &master, b"rekey", false).unwrap();
        alice.install_pending(&alice_keys).unwrap();
        bob.install_pending(&bob_keys).unwrap();
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (mut alice, mut bob) = key_pair();
        let (nonce, ct) = alice.seal(b"hello").unwrap();
        let (pt, used) = bob.open(&nonce, &ct, GRACE).unwrap();
        assert_eq!(pt, b"hello");
        assert_eq!(used, KeyUse::Current);
    }

    #[test]
    fn test_nonces_monotonic() {
        let (mut alice, _) = key_pair();
        let (n1, _) = alice.seal(b"a").unwrap();
        let (n2, _) = alice.seal(b"b").unwrap();
        assert_eq!(nonce_from_bytes(&n2), nonce_from_bytes(&n1) + 1);
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = key_pair();
        let (nonce, ct) = alice.seal(b"once").unwrap();
        bob.open(&nonce, &ct, GRACE).unwrap();
        // Same record again: same nonce, rejected
        assert!(bob.open(&nonce, &ct, GRACE).is_err());
    }

    #[test]
    fn test_stale_nonce_rejected() {
        let (mut alice, mut bob) = key_pair();
        let (n1, c1) = alice.seal(b"first").unwrap();
        let (n2, c2) = alice.seal(b"second").unwrap();
        bob.open(&n2, &c2, GRACE).unwrap();
        // Earlier nonce arrives after a later one was accepted
        assert!(bob.open(&n1, &c1, GRACE).is_err());
    }

    #[test]
    fn test_rekey_commit_switches_keys() {
        let (mut alice, mut bob) = key_pair();
        let (n, c) = alice.seal(b"pre-rekey").unwrap();
        bob.open(&n, &c, GRACE).unwrap();

        rekeyed_pair(&mut alice, &mut bob);
        assert!(alice.has_pending());

        // Alice commits and sends under the new key; Bob's pending set opens
        // it and is promoted
        alice.commit_pending().unwrap();
        assert!(!alice.has_pending());
        let (n, c) = alice.seal(b"post-rekey").unwrap();
        let (pt, used) = bob.open(&n, &c, GRACE).unwrap();
        assert_eq!(pt, b"post-rekey");
        assert_eq!(used, KeyUse::Pending);
        assert!(!bob.has_pending());
    }

    #[test]
    fn test_previous_key_valid_within_grace() {
        let (mut alice, mut bob) = key_pair();
        // Frame sealed under the old key before Alice commits
        let (old_nonce, old_ct) = alice.seal(b"in flight").unwrap();

        rekeyed_pair(&mut alice, &mut bob);
        alice.commit_pending().unwrap();
        let (new_nonce, new_ct) = alice.seal(b"fresh").unwrap();

        // Bob sees the new-key frame first (promotes pending), then the
        // in-flight old-key frame arrives and opens under the previous set
        bob.open(&new_nonce, &new_ct, GRACE).unwrap();
        let (pt, used) = bob.open(&old_nonce, &old_ct, GRACE).unwrap();
        assert_eq!(pt, b"in flight");
        assert_eq!(used, KeyUse::Previous);
    }

    #[test]
    fn test_previous_key_expires() {
        let (mut alice, mut bob) = key_pair();
        let (old_nonce, old_ct) = alice.seal(b"too late").unwrap();

        rekeyed_pair(&mut alice, &mut bob);
        alice.commit_pending().unwrap();
        let (n, c) = alice.seal(b"fresh").unwrap();
        bob.open(&n, &c, GRACE).unwrap();

        // Grace window of zero: previous set unusable
        assert!(bob.open(&old_nonce, &old_ct, Duration::ZERO).is_err());
        bob.expire_previous(Duration::ZERO);
        assert!(bob.open(&old_nonce, &old_ct, GRACE).is_err());
    }

    #[test]
    fn test_single_pending_invariant() {
        let (mut alice, mut bob) = key_pair();
        rekeyed_pair(&mut alice, &mut bob);
        let master = kdf::derive_master_secret(HashAlgorithm::Sha256, &[1u8; 32], None, None);
        let keys = kdf::derive_session_keys(HashAlgorithm::Sha256, &master, b"x", true).unwrap();
        assert!(alice.install_pending(&keys).is_err());
    }

    #[test]
    fn test_nonce_exhaustion_forces_rekey_before_overflow() {
        let (mut alice, _) = key_pair();
        assert!(!alice.nonce_exhaustion_imminent());

        alice.force_tx_counter(NONCE_MAX - NONCE_REKEY_MARGIN);
        assert!(alice.nonce_exhaustion_imminent());

        // Sealing still works inside the margin, right up to the hard stop
        alice.force_tx_counter(NONCE_MAX - 1);
        assert!(alice.seal(b"last one").is_ok());
        assert!(alice.seal(b"overflow").is_err());
    }

    #[test]
    fn test_bytes_processed_counted() {
        let (mut alice, mut bob) = key_pair();
        let (n, c) = alice.seal(&[0u8; 100]).unwrap();
        assert_eq!(alice.bytes_processed(), 100);
        bob.open(&n, &c, GRACE).unwrap();
        assert_eq!(bob.bytes_processed(), 100);
    }

    #[test]
    fn test_garbage_fails_open() {
        let (_, mut bob) = key_pair();
        assert!(bob.open(&[0u8; 12], &[0u8; 64], GRACE).is_err());
    }
}
