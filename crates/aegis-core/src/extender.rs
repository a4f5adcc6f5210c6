//! Application extenders.
//!
//! An extender is an application-supplied module named by a 128-bit
//! identity. It exchanges opaque bytes with its counterpart on remote peers
//! and receives lifecycle plus peer events. Registration stores a trait
//! object; peers learn the running set through the handshake advertisement
//! and later `ExtenderUpdate` frames.

use crate::error::{Error, Result};
use crate::peer::PeerLuid;
use crate::uuid::Uuid;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// What happened to a peer, from an extender's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEventKind {
    /// Handshake completed
    Connected,
    /// Connection closed
    Disconnected,
    /// Peer suspended (UDP inactivity)
    Suspended,
    /// Peer resumed
    Resumed,
}

/// A peer event delivered to extenders
#[derive(Debug, Clone)]
pub struct PeerEvent {
    /// Which peer
    pub luid: PeerLuid,
    /// What happened
    pub kind: PeerEventKind,
    /// The peer's verified identity, when known
    pub peer_uuid: Option<Uuid>,
}

/// An application module exchanging messages with its remote counterpart
#[async_trait]
pub trait Extender: Send + Sync {
    /// The extender's identity
    fn uuid(&self) -> Uuid;

    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Called when the local instance starts
    async fn on_startup(&self) {}

    /// Called once all extenders have started
    async fn on_post_startup(&self) {}

    /// Called before the local instance begins shutting down
    async fn on_pre_shutdown(&self) {}

    /// Called when the local instance has shut down
    async fn on_shutdown(&self) {}

    /// Peer lifecycle notification
    async fn on_peer_event(&self, _event: PeerEvent) {}

    /// A message from the remote counterpart; return false when the message
    /// was not handled (counts against the peer's reputation)
    async fn on_peer_message(&self, luid: PeerLuid, data: Vec<u8>) -> bool;
}

/// How long removal times are remembered at most
const REMOVED_RETENTION: Duration = Duration::from_secs(600);

/// Outcome of dispatching one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The extender accepted the message
    Handled,
    /// The extender refused the message
    Unhandled,
    /// No such extender is running
    Unknown,
}

/// The set of registered extenders
#[derive(Default)]
pub struct ExtenderRegistry {
    extenders: DashMap<Uuid, Arc<dyn Extender>>,
    /// Removal times, for the post-removal grace window
    removed: Mutex<HashMap<Uuid, Instant>>,
}

impl ExtenderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extender
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a duplicate identity or one
    /// that is not an extender identity.
    pub fn add(&self, extender: Arc<dyn Extender>) -> Result<()> {
        let uuid = extender.uuid();
        if uuid.uuid_type() != crate::uuid::UuidType::Extender {
            return Err(Error::invalid_argument("not an extender identity"));
        }
        if self.extenders.contains_key(&uuid) {
            return Err(Error::invalid_argument("extender already registered"));
        }
        tracing::info!(extender = %uuid, name = extender.name(), "extender registered");
        self.extenders.insert(uuid, extender);
        Ok(())
    }

    /// Remove an extender; its identity enters the grace window
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressNotFound`] when the identity is not registered.
    pub fn remove(&self, uuid: &Uuid) -> Result<Arc<dyn Extender>> {
        let (_, extender) = self
            .extenders
            .remove(uuid)
            .ok_or(Error::AddressNotFound)?;
        self.removed
            .lock()
            .expect("removed map lock poisoned")
            .insert(*uuid, Instant::now());
        Ok(extender)
    }

    /// Look up a running extender
    #[must_use]
    pub fn get(&self, uuid: &Uuid) -> Option<Arc<dyn Extender>> {
        self.extenders.get(uuid).map(|e| Arc::clone(&e))
    }

    /// Sorted unique identities of all running extenders
    #[must_use]
    pub fn running_uuids(&self) -> Vec<Uuid> {
        let mut uuids: Vec<Uuid> = self.extenders.iter().map(|e| *e.key()).collect();
        uuids.sort_unstable();
        uuids
    }

    /// Whether `uuid` was removed within the last `grace`
    #[must_use]
    pub fn recently_removed(&self, uuid: &Uuid, grace: Duration) -> bool {
        let mut removed = self.removed.lock().expect("removed map lock poisoned");
        removed.retain(|_, at| at.elapsed() <= REMOVED_RETENTION);
        removed
            .get(uuid)
            .is_some_and(|at| at.elapsed() <= grace)
    }

    /// Deliver one inbound message
    pub async fn dispatch_message(
        &self,
        uuid: &Uuid,
        luid: PeerLuid,
        data: Vec<u8>,
    ) -> DispatchOutcome {
        let Some(extender) = self.get(uuid) else {
            return DispatchOutcome::Unknown;
        };
        if extender.on_peer_message(luid, data).await {
            DispatchOutcome::Handled
        } else {
            DispatchOutcome::Unhandled
        }
    }

    /// Deliver a peer event to every running extender
    pub async fn dispatch_event(&self, event: &PeerEvent) {
        let extenders: Vec<Arc<dyn Extender>> =
            self.extenders.iter().map(|e| Arc::clone(&e)).collect();
        for extender in extenders {
            extender.on_peer_event(event.clone()).await;
        }
    }

    /// Run a lifecycle phase across every running extender
    pub async fn startup_all(&self) {
        let extenders: Vec<Arc<dyn Extender>> =
            self.extenders.iter().map(|e| Arc::clone(&e)).collect();
        for extender in &extenders {
            extender.on_startup().await;
        }
        for extender in &extenders {
            extender.on_post_startup().await;
        }
    }

    /// Run the shutdown phases across every running extender
    pub async fn shutdown_all(&self) {
        let extenders: Vec<Arc<dyn Extender>> =
            self.extenders.iter().map(|e| Arc::clone(&e)).collect();
        for extender in &extenders {
            extender.on_pre_shutdown().await;
        }
        for extender in &extenders {
            extender.on_shutdown().await;
        }
    }

    /// Number of running extenders
    #[must_use]
    pub fn len(&self) -> usize {
        self.extenders.len()
    }

    /// True when none are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extenders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExtender {
        uuid: Uuid,
        messages: AtomicUsize,
        accept: bool,
    }

    impl CountingExtender {
        fn new(accept: bool) -> Self {
            Self {
                uuid: Uuid::new_extender(),
                messages: AtomicUsize::new(0),
                accept,
            }
        }
    }

    #[async_trait]
    impl Extender for CountingExtender {
        fn uuid(&self) -> Uuid {
            self.uuid
        }

        fn name(&self) -> &str {
            "counting"
        }

        async fn on_peer_message(&self, _luid: PeerLuid, _data: Vec<u8>) -> bool {
            self.messages.fetch_add(1, Ordering::SeqCst);
            self.accept
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let registry = ExtenderRegistry::new();
        let extender = Arc::new(CountingExtender::new(true));
        let uuid = extender.uuid();
        registry.add(extender.clone()).unwrap();

        let outcome = registry
            .dispatch_message(&uuid, PeerLuid::from_raw(1), b"hi".to_vec())
            .await;
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(extender.messages.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = ExtenderRegistry::new();
        let extender = Arc::new(CountingExtender::new(true));
        registry.add(extender.clone()).unwrap();
        assert!(registry.add(extender).is_err());
    }

    #[tokio::test]
    async fn test_peer_identity_rejected_as_extender() {
        struct Misnamed(Uuid);

        #[async_trait]
        impl Extender for Misnamed {
            fn uuid(&self) -> Uuid {
                self.0
            }
            fn name(&self) -> &str {
                "misnamed"
            }
            async fn on_peer_message(&self, _luid: PeerLuid, _data: Vec<u8>) -> bool {
                true
            }
        }

        let registry = ExtenderRegistry::new();
        let (peer_uuid, _) =
            Uuid::new_peer(aegis_crypto::signatures::SignatureAlgorithm::Ed25519).unwrap();
        assert!(registry.add(Arc::new(Misnamed(peer_uuid))).is_err());
    }

    #[tokio::test]
    async fn test_unhandled_and_unknown() {
        let registry = ExtenderRegistry::new();
        let rejecting = Arc::new(CountingExtender::new(false));
        let uuid = rejecting.uuid();
        registry.add(rejecting).unwrap();

        assert_eq!(
            registry
                .dispatch_message(&uuid, PeerLuid::from_raw(1), vec![])
                .await,
            DispatchOutcome::Unhandled
        );
        assert_eq!(
            registry
                .dispatch_message(&Uuid::new_extender(), PeerLuid::from_raw(1), vec![])
                .await,
            DispatchOutcome::Unknown
        );
    }

    #[tokio::test]
    async fn test_removal_grace_window() {
        let registry = ExtenderRegistry::new();
        let extender = Arc::new(CountingExtender::new(true));
        let uuid = extender.uuid();
        registry.add(extender).unwrap();

        registry.remove(&uuid).unwrap();
        assert!(registry.recently_removed(&uuid, Duration::from_secs(60)));
        assert!(!registry.recently_removed(&uuid, Duration::ZERO));
        assert!(!registry.recently_removed(&Uuid::new_extender(), Duration::from_secs(60)));

        assert!(registry.remove(&uuid).is_err());
    }

    #[tokio::test]
    async fn test_running_uuids_sorted() {
        let registry = ExtenderRegistry::new();
        for _ in 0..5 {
            registry
                .add(Arc::new(CountingExtender::new(true)))
                .unwrap();
        }
        let uuids = registry.running_uuids();
        assert_eq!(uuids.len(), 5);
        let mut sorted = uuids.clone();
        sorted.sort_unstable();
        assert_eq!(uuids, sorted);
    }
}
