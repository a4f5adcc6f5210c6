//! Peer records, registry and the per-peer pipeline.
//!
//! Applications only ever see [`PeerLuid`] handles; the registry owns every
//! [`PeerRecord`] and hands out short-lived borrows through
//! [`PeerRegistry::with_peer`]. Records linger for a grace delay after
//! closing so late lookups still resolve, then are garbage collected.

pub mod connection;
pub mod handshake;
pub mod keystate;
pub mod pipeline;
pub mod rekey;
pub mod state;

pub use state::PeerStatus;

use aegis_crypto::algorithms::Algorithms;
use aegis_transport::Endpoint;
use crate::error::{DisconnectReason, Error, Result};
use crate::frame::Frame;
use crate::uuid::Uuid;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Locally-unique peer handle; the only identifier surfaced to applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerLuid(u64);

impl PeerLuid {
    /// Construct from a raw value (tests and logs)
    #[must_use]
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// The raw value
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerLuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer:{}", self.0)
    }
}

/// Who initiated the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    /// Accepted by a listener
    Inbound,
    /// Opened by us
    Outbound,
}

/// Outbound send priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPriority {
    /// Queued behind earlier sends, subject to the queue cap
    Normal,
    /// Bypasses the queue cap
    Expedited,
}

/// Commands into a peer's pipeline task
pub enum PeerCommand {
    /// Seal and send a frame
    Send {
        /// The frame
        frame: Frame,
        /// Queue discipline
        priority: SendPriority,
        /// Completion signal for callers that wait
        done: Option<oneshot::Sender<Result<()>>>,
    },
    /// Close the connection
    Disconnect {
        /// Why
        reason: DisconnectReason,
    },
}

/// Per-extender traffic counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtenderCounters {
    /// Bytes sent to this extender's counterpart
    pub bytes_sent: u64,
    /// Bytes received for this extender
    pub bytes_received: u64,
}

/// Everything the node tracks about one peer
pub struct PeerRecord {
    /// Handle
    pub luid: PeerLuid,
    /// Connection state
    pub status: PeerStatus,
    /// Who initiated
    pub direction: PeerDirection,
    /// Remote endpoint
    pub remote_endpoint: Endpoint,
    /// Local endpoint
    pub local_endpoint: Endpoint,
    /// Verified remote identity, set after the handshake
    pub peer_uuid: Option<Uuid>,
    /// Negotiated quintuple, immutable once set
    pub algorithms: Option<Algorithms>,
    /// Extenders the remote advertises
    pub peer_extenders: Vec<Uuid>,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Traffic split per extender
    pub extender_counters: HashMap<Uuid, ExtenderCounters>,
    /// Last frame in either direction
    pub last_activity: Instant,
    /// Relay port when this peer is reached through a relay chain
    pub relay_port: Option<u64>,
    /// Accumulated reputation delta caused by this peer
    pub reputation_delta: i32,
    /// Why the peer closed, once it has
    pub disconnect_reason: Option<DisconnectReason>,
    /// When the record entered `Closed`
    pub closed_at: Option<Instant>,
    /// Channel into the pipeline task
    pub command_tx: Option<mpsc::Sender<PeerCommand>>,
}

impl PeerRecord {
    /// Fresh record for a transport that just connected
    #[must_use]
    pub fn new(
        luid: PeerLuid,
        direction: PeerDirection,
        local_endpoint: Endpoint,
        remote_endpoint: Endpoint,
    ) -> Self {
        Self {
            luid,
            status: PeerStatus::Initial,
            direction,
            remote_endpoint,
            local_endpoint,
            peer_uuid: None,
            algorithms: None,
            peer_extenders: Vec::new(),
            bytes_sent: 0,
            bytes_received: 0,
            extender_counters: HashMap::new(),
            last_activity: Instant::now(),
            relay_port: None,
            reputation_delta: 0,
            disconnect_reason: None,
            closed_at: None,
            command_tx: None,
        }
    }

    /// Move to a new status if the transition is legal
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] for an illegal transition.
    pub fn set_status(&mut self, status: PeerStatus) -> Result<()> {
        if !self.status.can_transition(status) {
            return Err(Error::failed("illegal peer state transition"));
        }
        self.status = status;
        if status == PeerStatus::Closed {
            self.closed_at = Some(Instant::now());
            self.command_tx = None;
        }
        Ok(())
    }

    /// Whether the peer is reached through a relay
    #[must_use]
    pub fn is_relayed(&self) -> bool {
        self.relay_port.is_some()
    }
}

/// How long closed records stay resolvable
const CLOSED_RECORD_GRACE: Duration = Duration::from_secs(30);

/// Owner of every peer record
#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<PeerLuid, PeerRecord>,
    next_luid: AtomicU64,
}

impl PeerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next handle
    #[must_use]
    pub fn new_luid(&self) -> PeerLuid {
        PeerLuid(self.next_luid.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Insert a record under its handle
    pub fn insert(&self, record: PeerRecord) {
        self.peers.insert(record.luid, record);
    }

    /// Borrow a record read-only
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerNotFound`] for an unknown handle.
    pub fn with_peer<R>(&self, luid: PeerLuid, f: impl FnOnce(&PeerRecord) -> R) -> Result<R> {
        self.peers
            .get(&luid)
            .map(|record| f(&record))
            .ok_or(Error::PeerNotFound)
    }

    /// Borrow a record mutably
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerNotFound`] for an unknown handle.
    pub fn with_peer_mut<R>(
        &self,
        luid: PeerLuid,
        f: impl FnOnce(&mut PeerRecord) -> R,
    ) -> Result<R> {
        self.peers
            .get_mut(&luid)
            .map(|mut record| f(&mut record))
            .ok_or(Error::PeerNotFound)
    }

    /// Handles of all live (non-closed) peers
    #[must_use]
    pub fn connected_luids(&self) -> Vec<PeerLuid> {
        self.peers
            .iter()
            .filter(|r| r.status.is_connected())
            .map(|r| r.luid)
            .collect()
    }

    /// Find a connected peer by its verified identity
    #[must_use]
    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<PeerLuid> {
        self.peers
            .iter()
            .find(|r| r.peer_uuid.as_ref() == Some(uuid) && r.status.is_connected())
            .map(|r| r.luid)
    }

    /// Number of records, including closed ones awaiting collection
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no records exist
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop closed records past their grace delay
    pub fn collect_closed(&self) {
        self.peers.retain(|_, record| {
            record
                .closed_at
                .is_none_or(|at| at.elapsed() <= CLOSED_RECORD_GRACE)
        });
    }

    /// Drop a record immediately
    pub fn remove(&self, luid: PeerLuid) {
        self.peers.remove(&luid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(registry: &PeerRegistry) -> PeerLuid {
        let luid = registry.new_luid();
        registry.insert(PeerRecord::new(
            luid,
            PeerDirection::Outbound,
            "tcp://127.0.0.1:1000".parse().unwrap(),
            "tcp://127.0.0.1:2000".parse().unwrap(),
        ));
        luid
    }

    #[test]
    fn test_luids_unique_and_stable() {
        let registry = PeerRegistry::new();
        let a = record(&registry);
        let b = record(&registry);
        assert_ne!(a, b);

        registry
            .with_peer(a, |p| assert_eq!(p.luid, a))
            .unwrap();
    }

    #[test]
    fn test_unknown_luid() {
        let registry = PeerRegistry::new();
        assert_eq!(
            registry.with_peer(PeerLuid::from_raw(99), |_| ()),
            Err(Error::PeerNotFound)
        );
    }

    #[test]
    fn test_status_transitions_enforced() {
        let registry = PeerRegistry::new();
        let luid = record(&registry);

        registry
            .with_peer_mut(luid, |p| {
                assert!(p.set_status(PeerStatus::Ready).is_err());
                p.set_status(PeerStatus::HandshakeKeyExchange).unwrap();
                p.set_status(PeerStatus::HandshakeAuth).unwrap();
                p.set_status(PeerStatus::Ready).unwrap();
            })
            .unwrap();
    }

    #[test]
    fn test_closed_records_linger_then_collect() {
        let registry = PeerRegistry::new();
        let luid = record(&registry);
        registry
            .with_peer_mut(luid, |p| p.set_status(PeerStatus::Closed).unwrap())
            .unwrap();

        // Still resolvable within the grace delay
        registry.collect_closed();
        assert!(registry.with_peer(luid, |_| ()).is_ok());

        // Force expiry
        registry
            .with_peer_mut(luid, |p| {
                p.closed_at = Some(Instant::now() - CLOSED_RECORD_GRACE - Duration::from_secs(1));
            })
            .unwrap();
        registry.collect_closed();
        assert_eq!(registry.with_peer(luid, |_| ()), Err(Error::PeerNotFound));
    }

    #[test]
    fn test_find_by_uuid() {
        let registry = PeerRegistry::new();
        let luid = record(&registry);
        let uuid = Uuid::new_extender();

        assert!(registry.find_by_uuid(&uuid).is_none());
        registry
            .with_peer_mut(luid, |p| {
                p.peer_uuid = Some(uuid);
                p.set_status(PeerStatus::HandshakeKeyExchange).unwrap();
                p.set_status(PeerStatus::HandshakeAuth).unwrap();
                p.set_status(PeerStatus::Ready).unwrap();
            })
            .unwrap();
        assert_eq!(registry.find_by_uuid(&uuid), Some(luid));
    }

    #[test]
    fn test_quintuple_immutable_by_convention() {
        let registry = PeerRegistry::new();
        let luid = record(&registry);
        let algorithms = {
            let defaults = aegis_crypto::algorithms::SupportedAlgorithms::default();
            defaults.negotiate(&defaults).unwrap()
        };
        registry
            .with_peer_mut(luid, |p| {
                assert!(p.algorithms.is_none());
                p.algorithms = Some(algorithms);
            })
            .unwrap();
        registry
            .with_peer(luid, |p| assert_eq!(p.algorithms, Some(algorithms)))
            .unwrap();
    }
}
