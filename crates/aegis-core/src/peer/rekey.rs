//! Periodic key updates.
//!
//! Triggered by elapsed time (with jitter between the configured minimum and
//! maximum intervals), by bytes processed under the current key, or by the
//! outbound nonce counter approaching the end of its space.
//!
//! Exchange: the initiator sends `Request` with a fresh public key under the
//! current key; the responder replies with its own and installs the derived
//! set as pending; the initiator installs, commits and sends `Commit`, the
//! first frame sealed under the new key. The responder's pending set is
//! promoted the moment that frame opens. The previous key stays usable for a
//! bounded grace window, then is wiped.

use aegis_crypto::algorithms::HashAlgorithm;
use aegis_crypto::exchange::{self, KeyPair};
use aegis_crypto::kdf::{self, SessionKeys};
use crate::config::KeyUpdateSettings;
use crate::error::{Error, Result};
use crate::peer::keystate::PeerKeys;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const REKEY_SALT: &[u8] = b"aegis rekey v1";

/// Messages carried inside `Rekey` frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RekeyMessage {
    /// Initiator's fresh public key
    Request {
        /// X25519 public key
        public_key: Vec<u8>,
    },
    /// Responder's fresh public key
    Response {
        /// X25519 public key
        public_key: Vec<u8>,
    },
    /// Sent under the new key; sending switches over from here on
    Commit,
}

/// Derive the session keys for one rekey exchange.
///
/// `initiated_by_us` keeps the directional halves mirrored between the two
/// sides, exactly as in the handshake.
///
/// # Errors
///
/// Propagates key agreement and derivation failures.
pub fn derive_rekey_keys(
    hash: HashAlgorithm,
    our_private: &[u8],
    their_public: &[u8],
    initiated_by_us: bool,
    global_shared_secret: Option<&[u8]>,
) -> Result<SessionKeys> {
    let shared = exchange::ecdh(our_private, their_public)?;
    let master = kdf::derive_master_secret(hash, &shared[..], None, global_shared_secret);
    kdf::derive_session_keys(hash, &master, REKEY_SALT, initiated_by_us).map_err(Error::from)
}

struct InProgress {
    started: Instant,
    keypair: Option<KeyPair>,
}

/// Per-peer rekey trigger evaluation and exchange bookkeeping
pub struct RekeyScheduler {
    settings: KeyUpdateSettings,
    next_deadline: Instant,
    in_progress: Option<InProgress>,
}

impl RekeyScheduler {
    /// Create with the first jittered deadline scheduled from now
    #[must_use]
    pub fn new(settings: KeyUpdateSettings) -> Self {
        let next_deadline = Self::pick_deadline(&settings);
        Self {
            settings,
            next_deadline,
            in_progress: None,
        }
    }

    fn pick_deadline(settings: &KeyUpdateSettings) -> Instant {
        let window = settings
            .max_interval
            .saturating_sub(settings.min_interval);
        Instant::now() + settings.min_interval + aegis_crypto::random::delay(window)
    }

    /// Whether a rekey should start now
    #[must_use]
    pub fn should_rekey(&self, keys: &PeerKeys) -> bool {
        if self.in_progress.is_some() || !keys.is_ready() || keys.has_pending() {
            return false;
        }
        if keys.nonce_exhaustion_imminent() {
            return true;
        }
        if keys.bytes_processed() >= self.settings.require_after_num_processed_bytes {
            return true;
        }
        Instant::now() >= self.next_deadline
    }

    /// Record that we initiated an exchange with `keypair`
    pub fn begin(&mut self, keypair: KeyPair) {
        self.in_progress = Some(InProgress {
            started: Instant::now(),
            keypair: Some(keypair),
        });
    }

    /// Record that the peer initiated an exchange
    pub fn begin_responder(&mut self) {
        self.in_progress = Some(InProgress {
            started: Instant::now(),
            keypair: None,
        });
    }

    /// Take back the keypair stored by [`RekeyScheduler::begin`]
    pub fn take_keypair(&mut self) -> Option<KeyPair> {
        self.in_progress.as_mut().and_then(|p| p.keypair.take())
    }

    /// Whether an exchange is in flight
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.in_progress.is_some()
    }

    /// Whether the in-flight exchange blew its deadline
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.in_progress
            .as_ref()
            .is_some_and(|p| p.started.elapsed() > self.settings.max_duration)
    }

    /// Mark the exchange complete and schedule the next deadline
    pub fn complete(&mut self) {
        self.in_progress = None;
        self.next_deadline = Self::pick_deadline(&self.settings);
    }

    /// How long the previous key stays usable after a commit
    #[must_use]
    pub fn previous_key_grace(&self) -> Duration {
        self.settings.max_duration
    }
}
