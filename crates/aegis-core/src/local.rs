//! The local instance.
//!
//! [`Local`] owns every subsystem: access control, pregenerated key pools,
//! the peer registry and pipelines, the relay engine, listeners, extenders
//! and public endpoint tracking. Applications hold peer LUIDs and talk to
//! the world through [`Local::connect_to`], [`Local::send_to`] and their
//! registered extenders.

use aegis_crypto::signatures::{SignatureAlgorithm, SigningKeyPair};
use aegis_transport::{Address, Connector, Endpoint, Transport, TransportListener};
use crate::access::{AccessManager, AttemptKind, CheckType, ReputationUpdate};
use crate::config::Settings;
use crate::endpoints::{EndpointVerifier, PublicEndpoints, RejectingVerifier};
use crate::error::{DisconnectReason, Error, Result};
use crate::extender::{Extender, ExtenderRegistry, PeerEvent, PeerEventKind};
use crate::frame::{Frame, FrameType};
use crate::keymgr::{AsymmetricAlgorithm, KeyManager};
use crate::listener::{AcceptedTransport, ListenerManager};
use crate::peer::connection::Connection;
use crate::peer::handshake::{self, HandshakeConfig};
use crate::peer::pipeline::{
    COMMAND_QUEUE_DEPTH, PeerPipeline, PipelineConfig, PipelineHooks,
};
use crate::peer::{
    PeerCommand, PeerDirection, PeerLuid, PeerRecord, PeerRegistry, PeerStatus, SendPriority,
};
use crate::relay::{self, RelayControlMessage, RelayLink, RelayManager, RelayStatus};
use crate::uuid::Uuid;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Largest application message per send call
pub const MAX_MESSAGE_SIZE: usize = 60 * 1024;

/// Housekeeping cadence of the maintenance task
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Depth of a relay origin's inbound byte queue
const RELAY_QUEUE_DEPTH: usize = 64;

fn relay_control_frame(message: &RelayControlMessage) -> Result<Frame> {
    let payload =
        bincode::serialize(message).map_err(|e| Error::Failed(e.to_string().into()))?;
    Ok(Frame::new(FrameType::RelayControl, payload))
}

/// Cheap handle extenders use to reply to peers
#[derive(Clone)]
pub struct PeerSender {
    registry: Arc<PeerRegistry>,
}

impl PeerSender {
    /// Queue `data` for the extender's counterpart on `luid`
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerNotFound`] when the peer is gone.
    pub async fn send_to(&self, extender: Uuid, luid: PeerLuid, data: Vec<u8>) -> Result<()> {
        let tx = self
            .registry
            .with_peer(luid, |record| record.command_tx.clone())?
            .ok_or(Error::PeerNotFound)?;
        tx.send(PeerCommand::Send {
            frame: Frame::for_extender(extender, data),
            priority: SendPriority::Normal,
            done: None,
        })
        .await
        .map_err(|_| Error::PeerNotFound)
    }
}

struct Shared {
    settings: Settings,
    identity_uuid: Uuid,
    signing: Arc<SigningKeyPair>,
    access: Arc<AccessManager>,
    registry: Arc<PeerRegistry>,
    relays: Arc<RelayManager>,
    extenders: Arc<ExtenderRegistry>,
    keymgr: Arc<KeyManager>,
    endpoints: Arc<PublicEndpoints>,
    connector: Option<Arc<dyn Connector>>,
    allowed_peers: Arc<StdRwLock<Vec<Uuid>>>,
    listener_mgr: ListenerManager,
    shutdown_tx: watch::Sender<bool>,
    /// relay_port → inbound bytes for relayed sessions we originated
    relay_origins: DashMap<u64, mpsc::Sender<Vec<u8>>>,
    /// relay_port → the gateway peer carrying that origin
    origin_gateways: DashMap<u64, PeerLuid>,
    /// relay_port → bytes toward the raw final leg (we are last hop)
    relay_bridges: DashMap<u64, mpsc::Sender<Vec<u8>>>,
    /// relay_port → waiter for the Opened/Close answer
    pending_opens: DashMap<u64, oneshot::Sender<Result<()>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn spawn(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("task list lock poisoned").push(task);
    }

    fn handshake_config(
        &self,
        require_authentication: bool,
        outbound: bool,
        observed_peer_endpoint: Option<Endpoint>,
    ) -> HandshakeConfig {
        HandshakeConfig {
            local_uuid: self.identity_uuid,
            signing_public: self.signing.public.clone(),
            signing_private: self.signing.private.to_vec(),
            signature_algorithm: self.signing.algorithm,
            supported: self.settings.supported_algorithms.clone(),
            global_shared_secret: self.settings.global_shared_secret.clone(),
            local_extenders: self.extenders.running_uuids(),
            require_authentication,
            allowed_peers: self
                .allowed_peers
                .read()
                .expect("allowed peers lock poisoned")
                .clone(),
            max_handshake_delay: if outbound {
                self.settings.general.max_handshake_delay
            } else {
                Duration::ZERO
            },
            max_num_decoy_messages: self.settings.udp.max_num_decoy_messages,
            max_decoy_message_interval: self.settings.udp.max_decoy_message_interval,
            observed_peer_endpoint,
        }
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            message: self.settings.message.clone(),
            key_update: self.settings.key_update.clone(),
            noise: self.settings.noise.clone(),
            general: self.settings.general.clone(),
            global_shared_secret: self.settings.global_shared_secret.clone(),
        }
    }

    async fn handshake_and_spawn(
        self: &Arc<Self>,
        transport: Box<dyn Transport>,
        direction: PeerDirection,
        require_authentication: bool,
        relay_port: Option<u64>,
    ) -> Result<PeerLuid> {
        let local_endpoint = transport.local_endpoint();
        let remote_endpoint = transport.peer_endpoint();
        let addr = remote_endpoint.address();

        let luid = self.registry.new_luid();
        let mut record = PeerRecord::new(luid, direction, local_endpoint, remote_endpoint);
        record.relay_port = relay_port;
        let _ = record.set_status(PeerStatus::HandshakeKeyExchange);
        self.registry.insert(record);

        let outbound = direction == PeerDirection::Outbound;
        // Observed endpoints through relays say nothing about real sources
        let observed = (relay_port.is_none()).then_some(remote_endpoint);
        let cfg = self.handshake_config(require_authentication, outbound, observed);
        let deadline = self.settings.general.max_handshake_duration + cfg.max_handshake_delay;

        let mut conn = Connection::new(transport);
        let outcome = match tokio::time::timeout(
            deadline,
            handshake::run(&mut conn, outbound, &cfg, &self.keymgr),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                conn.close().await;
                if err == Error::AuthFailure {
                    self.access
                        .update_reputation(addr, ReputationUpdate::DeteriorateSevere)
                        .await;
                }
                let reason = match &err {
                    Error::AuthFailure | Error::AlgorithmMismatch => DisconnectReason::AuthFailure,
                    Error::Disconnected(reason) => *reason,
                    _ => DisconnectReason::ProtocolViolation,
                };
                let _ = self.registry.with_peer_mut(luid, |record| {
                    record.disconnect_reason = Some(reason);
                    let _ = record.set_status(PeerStatus::Closed);
                });
                return Err(err);
            }
            Err(_) => {
                conn.close().await;
                let _ = self.registry.with_peer_mut(luid, |record| {
                    record.disconnect_reason = Some(DisconnectReason::Timeout);
                    let _ = record.set_status(PeerStatus::Closed);
                });
                return Err(Error::timeout("handshake"));
            }
        };

        let peer_uuid = outcome.peer_uuid;

        // Feed what the peer observed as our source endpoint into public
        // endpoint discovery
        if relay_port.is_none() {
            if let (Some(reported), Some(reporter)) =
                (outcome.reported_local_endpoint, addr.as_ip())
            {
                let _ = self
                    .endpoints
                    .report(reported, reporter, require_authentication)
                    .await;
            }
        }

        let _ = self.registry.with_peer_mut(luid, |record| {
            record.peer_uuid = Some(outcome.peer_uuid);
            record.algorithms = Some(outcome.algorithms);
            record.peer_extenders = outcome.peer_extenders.clone();
            let _ = record.set_status(PeerStatus::HandshakeAuth);
            let _ = record.set_status(PeerStatus::Ready);
        });
        self.access.connected(addr).await;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let _ = self.registry.with_peer_mut(luid, |record| {
            record.command_tx = Some(command_tx);
        });

        let pipeline = PeerPipeline::new(
            luid,
            addr,
            direction,
            outcome,
            self.pipeline_config(),
            Arc::clone(&self.registry),
            Arc::clone(&self.keymgr),
            Arc::new(SharedHooks(Arc::clone(self))),
        );
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.spawn(tokio::spawn(pipeline.run(conn, command_rx, shutdown_rx)));

        tracing::info!(peer = %luid, identity = %peer_uuid, %remote_endpoint, "peer connected");
        self.extenders
            .dispatch_event(&PeerEvent {
                luid,
                kind: PeerEventKind::Connected,
                peer_uuid: Some(peer_uuid),
            })
            .await;

        Ok(luid)
    }

    async fn send_frame_to(&self, luid: PeerLuid, frame: Frame) -> Result<()> {
        let tx = self
            .registry
            .with_peer(luid, |record| record.command_tx.clone())?
            .ok_or(Error::PeerNotFound)?;
        tx.send(PeerCommand::Send {
            frame,
            priority: SendPriority::Normal,
            done: None,
        })
        .await
        .map_err(|_| Error::PeerNotFound)
    }

    async fn send_relay_control(&self, luid: PeerLuid, message: &RelayControlMessage) {
        if let Ok(frame) = relay_control_frame(message) {
            let _ = self.send_frame_to(luid, frame).await;
        }
    }

    fn peer_address(&self, luid: PeerLuid) -> Option<Address> {
        self.registry
            .with_peer(luid, |record| record.remote_endpoint.address())
            .ok()
    }

    async fn penalize(&self, luid: PeerLuid, update: ReputationUpdate) {
        if let Some(addr) = self.peer_address(luid) {
            self.access.update_reputation(addr, update).await;
        }
        let _ = self.registry.with_peer_mut(luid, |record| {
            record.reputation_delta += update as i16 as i32;
        });
    }

    /// First directly connected peer usable as a relay gateway
    async fn pick_gateway(
        &self,
        exclude: Option<PeerLuid>,
        destination: &Endpoint,
    ) -> Result<PeerLuid> {
        if self.relays.is_excluded(&destination.address()) {
            return Err(Error::RelayExcluded);
        }
        for luid in self.registry.connected_luids() {
            if Some(luid) == exclude {
                continue;
            }
            let Ok((addr, relayed)) = self.registry.with_peer(luid, |record| {
                (record.remote_endpoint.address(), record.is_relayed())
            }) else {
                continue;
            };
            if relayed || self.relays.is_excluded(&addr) {
                continue;
            }
            if self.access.check(&addr, CheckType::All).await {
                return Ok(luid);
            }
        }
        Err(Error::PeerNotFound)
    }

    /// Bridge a relay port to a raw transport leg (we are the last hop)
    fn spawn_bridge(
        self: &Arc<Self>,
        relay_port: u64,
        upstream: PeerLuid,
        raw: Box<dyn Transport>,
        mut bridge_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        let shared = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    data = bridge_rx.recv() => match data {
                        None => break,
                        Some(data) => {
                            if raw.send(&data).await.is_err() {
                                break;
                            }
                        }
                    },
                    received = raw.recv(&mut buf) => match received {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let frame = Frame::new(
                                FrameType::RelayData,
                                relay::encode_relay_data(relay_port, &buf[..n]),
                            );
                            if shared.send_frame_to(upstream, frame).await.is_err() {
                                break;
                            }
                        }
                    },
                }
            }
            raw.close().await;
            shared.relay_bridges.remove(&relay_port);
            if shared.relays.close(relay_port).is_some() {
                shared
                    .send_relay_control(upstream, &RelayControlMessage::Close { relay_port })
                    .await;
            }
        });
        self.spawn(task);
    }

    async fn handle_relay_open(
        self: &Arc<Self>,
        from: PeerLuid,
        relay_port: u64,
        endpoint: Endpoint,
        hops_remaining: u8,
    ) {
        let Some(via) = self.peer_address(from) else {
            return;
        };

        let admitted = self
            .relays
            .validate_open(relay_port, &endpoint, hops_remaining, &via)
            .is_ok()
            && self.access.admit(&via, AttemptKind::Relay).await.is_ok();
        if !admitted {
            tracing::debug!(relay_port, %endpoint, "relay open refused");
            self.send_relay_control(from, &RelayControlMessage::Close { relay_port })
                .await;
            return;
        }

        if hops_remaining == 1 {
            // Final hop: open the direct leg and bridge it
            let Some(connector) = self.connector.clone() else {
                self.send_relay_control(from, &RelayControlMessage::Close { relay_port })
                    .await;
                return;
            };
            let connected = tokio::time::timeout(
                self.settings.relay_security.connect_timeout,
                connector.connect(endpoint),
            )
            .await;
            match connected {
                Ok(Ok(raw)) => {
                    let (bridge_tx, bridge_rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
                    self.relay_bridges.insert(relay_port, bridge_tx);
                    self.relays.insert(RelayLink {
                        relay_port,
                        hops_remaining,
                        upstream: from,
                        downstream: None,
                        endpoint,
                        status: RelayStatus::Open,
                        created_at: std::time::Instant::now(),
                        last_activity: std::time::Instant::now(),
                        suspended_at: None,
                    });
                    self.spawn_bridge(relay_port, from, raw, bridge_rx);
                    self.send_relay_control(from, &RelayControlMessage::Opened { relay_port })
                        .await;
                }
                _ => {
                    tracing::debug!(relay_port, %endpoint, "relay final leg failed");
                    self.send_relay_control(from, &RelayControlMessage::Close { relay_port })
                        .await;
                }
            }
            return;
        }

        // Intermediate hop: forward toward the next gateway
        match self.pick_gateway(Some(from), &endpoint).await {
            Ok(next) => {
                self.relays.insert(RelayLink {
                    relay_port,
                    hops_remaining,
                    upstream: from,
                    downstream: Some(next),
                    endpoint,
                    status: RelayStatus::Connecting,
                    created_at: std::time::Instant::now(),
                    last_activity: std::time::Instant::now(),
                    suspended_at: None,
                });
                self.send_relay_control(
                    next,
                    &RelayControlMessage::Open {
                        relay_port,
                        endpoint,
                        hops_remaining: hops_remaining - 1,
                    },
                )
                .await;
            }
            Err(err) => {
                tracing::debug!(relay_port, %err, "no gateway for relay hop");
                self.send_relay_control(from, &RelayControlMessage::Close { relay_port })
                    .await;
            }
        }
    }

    async fn handle_relay_closed(&self, from: PeerLuid, relay_port: u64) {
        if let Some((_, waiter)) = self.pending_opens.remove(&relay_port) {
            let _ = waiter.send(Err(Error::Failed("relay open refused".into())));
        }
        if self.relay_origins.remove(&relay_port).is_some() {
            // The relayed session's transport sees EOF once the sender drops
            self.origin_gateways.remove(&relay_port);
        }
        self.relay_bridges.remove(&relay_port);
        if let Some(link) = self.relays.close(relay_port) {
            let other = if link.upstream == from {
                link.downstream
            } else {
                Some(link.upstream)
            };
            if let Some(other) = other {
                self.send_relay_control(other, &RelayControlMessage::Close { relay_port })
                    .await;
            }
        }
    }
}

/// Adapter installing `Shared` as the pipeline hook target
struct SharedHooks(Arc<Shared>);

#[async_trait]
impl PipelineHooks for SharedHooks {
    async fn on_message(&self, luid: PeerLuid, extender: Option<Uuid>, data: Vec<u8>) {
        self.0.on_message(luid, extender, data).await;
    }

    async fn on_relay_control(&self, luid: PeerLuid, message: RelayControlMessage) {
        self.0.on_relay_control(luid, message).await;
    }

    async fn on_relay_data(&self, luid: PeerLuid, relay_port: u64, data: Vec<u8>) {
        self.0.on_relay_data(luid, relay_port, data).await;
    }

    async fn on_extender_update(&self, luid: PeerLuid, extenders: Vec<Uuid>) {
        self.0.on_extender_update(luid, extenders).await;
    }

    async fn on_suspend_changed(&self, luid: PeerLuid, suspended: bool) {
        self.0.on_suspend_changed(luid, suspended).await;
    }

    async fn on_disconnected(&self, luid: PeerLuid, reason: DisconnectReason) {
        self.0.on_disconnected(luid, reason).await;
    }

    async fn on_reputation(&self, addr: Address, update: ReputationUpdate) {
        self.0.access.update_reputation(addr, update).await;
    }
}

impl Shared {
    async fn on_message(&self, luid: PeerLuid, extender: Option<Uuid>, data: Vec<u8>) {
        let Some(extender) = extender else {
            self.penalize(luid, ReputationUpdate::DeteriorateMinimal).await;
            return;
        };
        use crate::extender::DispatchOutcome;
        match self.extenders.dispatch_message(&extender, luid, data).await {
            DispatchOutcome::Handled => {}
            DispatchOutcome::Unhandled => {
                self.penalize(luid, ReputationUpdate::DeteriorateMinimal).await;
            }
            DispatchOutcome::Unknown => {
                let grace = self.settings.message.extender_grace_period;
                if !self.extenders.recently_removed(&extender, grace) {
                    self.penalize(luid, ReputationUpdate::DeteriorateMinimal).await;
                }
            }
        }
    }

    async fn on_relay_control(self: &Arc<Self>, luid: PeerLuid, message: RelayControlMessage) {
        if self.registry.with_peer(luid, |_| ()).is_err() {
            return;
        }
        match message {
            RelayControlMessage::Open {
                relay_port,
                endpoint,
                hops_remaining,
            } => {
                self.handle_relay_open(luid, relay_port, endpoint, hops_remaining)
                    .await;
            }
            RelayControlMessage::Opened { relay_port } => {
                if let Some((_, waiter)) = self.pending_opens.remove(&relay_port) {
                    let _ = waiter.send(Ok(()));
                    return;
                }
                if let Some(link) = self.relays.get(relay_port) {
                    if link.downstream == Some(luid) {
                        self.relays.set_downstream(relay_port, luid).ok();
                        self.send_relay_control(
                            link.upstream,
                            &RelayControlMessage::Opened { relay_port },
                        )
                        .await;
                    }
                }
            }
            RelayControlMessage::Close { relay_port } => {
                self.handle_relay_closed(luid, relay_port).await;
            }
            RelayControlMessage::Suspend { relay_port } => {
                self.relays.suspend(relay_port);
                if let Some(link) = self.relays.get(relay_port) {
                    let other = if link.upstream == luid {
                        link.downstream
                    } else {
                        Some(link.upstream)
                    };
                    if let Some(other) = other {
                        self.send_relay_control(
                            other,
                            &RelayControlMessage::Suspend { relay_port },
                        )
                        .await;
                    }
                }
            }
            RelayControlMessage::Resume { relay_port } => {
                self.relays.resume(relay_port);
                if let Some(link) = self.relays.get(relay_port) {
                    let other = if link.upstream == luid {
                        link.downstream
                    } else {
                        Some(link.upstream)
                    };
                    if let Some(other) = other {
                        self.send_relay_control(
                            other,
                            &RelayControlMessage::Resume { relay_port },
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn on_relay_data(&self, luid: PeerLuid, relay_port: u64, data: Vec<u8>) {
        // A session we originated through a gateway
        let origin = self.relay_origins.get(&relay_port).map(|tx| tx.clone());
        if let Some(tx) = origin {
            let _ = tx.send(data).await;
            return;
        }

        // We are the last hop: push toward the raw leg
        let bridge = self.relay_bridges.get(&relay_port).map(|tx| tx.clone());
        if let Some(tx) = bridge {
            let _ = tx.send(data).await;
            return;
        }

        // Plain forwarding between two peers
        match self.relays.forward_target(relay_port, luid) {
            Ok(Some(next)) => {
                let frame = Frame::new(
                    FrameType::RelayData,
                    relay::encode_relay_data(relay_port, &data),
                );
                let _ = self.send_frame_to(next, frame).await;
            }
            Ok(None) => {} // grace window or suspended: discard silently
            Err(_) => {
                self.penalize(luid, ReputationUpdate::DeteriorateMinimal).await;
            }
        }
    }

    async fn on_extender_update(&self, _luid: PeerLuid, _extenders: Vec<Uuid>) {}

    /// A suspended peer suspends every relay link running through it
    async fn on_suspend_changed(&self, luid: PeerLuid, suspended: bool) {
        for port in self.relays.links_for_peer(luid) {
            if suspended {
                self.relays.suspend(port);
            } else {
                self.relays.resume(port);
            }
            if let Some(link) = self.relays.get(port) {
                let other = if link.upstream == luid {
                    link.downstream
                } else {
                    Some(link.upstream)
                };
                if let Some(other) = other {
                    let message = if suspended {
                        RelayControlMessage::Suspend { relay_port: port }
                    } else {
                        RelayControlMessage::Resume { relay_port: port }
                    };
                    self.send_relay_control(other, &message).await;
                }
            }
        }

        let peer_uuid = self
            .registry
            .with_peer(luid, |record| record.peer_uuid)
            .ok()
            .flatten();
        self.extenders
            .dispatch_event(&PeerEvent {
                luid,
                kind: if suspended {
                    PeerEventKind::Suspended
                } else {
                    PeerEventKind::Resumed
                },
                peer_uuid,
            })
            .await;
    }

    async fn on_disconnected(&self, luid: PeerLuid, _reason: DisconnectReason) {
        let info = self
            .registry
            .with_peer(luid, |record| {
                (record.remote_endpoint.address(), record.relay_port, record.peer_uuid)
            })
            .ok();
        let Some((addr, relay_port, peer_uuid)) = info else {
            return;
        };
        self.access.disconnected(&addr).await;

        // Links forwarded through this peer go down with it
        for port in self.relays.links_for_peer(luid) {
            self.handle_relay_closed(luid, port).await;
        }

        // Origins whose gateway this peer was: drop them, their relayed
        // sessions see EOF
        let dead: Vec<u64> = self
            .origin_gateways
            .iter()
            .filter(|entry| *entry.value() == luid)
            .map(|entry| *entry.key())
            .collect();
        for port in dead {
            self.origin_gateways.remove(&port);
            self.relay_origins.remove(&port);
            if let Some((_, waiter)) = self.pending_opens.remove(&port) {
                let _ = waiter.send(Err(Error::Disconnected(DisconnectReason::RelayDown)));
            }
        }

        // If this peer itself was relayed, tell the gateway to drop the port
        if let Some(port) = relay_port {
            self.relay_origins.remove(&port);
            if let Some((_, gateway)) = self.origin_gateways.remove(&port) {
                self.send_relay_control(gateway, &RelayControlMessage::Close { relay_port: port })
                    .await;
            }
        }

        self.extenders
            .dispatch_event(&PeerEvent {
                luid,
                kind: PeerEventKind::Disconnected,
                peer_uuid,
            })
            .await;
    }
}

/// Snapshot of one peer's public details
#[derive(Debug, Clone)]
pub struct PeerDetails {
    /// Handle
    pub luid: PeerLuid,
    /// Connection state
    pub status: PeerStatus,
    /// Verified identity
    pub peer_uuid: Option<Uuid>,
    /// Remote endpoint
    pub remote_endpoint: Endpoint,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Whether the peer is reached through a relay
    pub is_relayed: bool,
    /// Why the peer closed, once closed
    pub disconnect_reason: Option<DisconnectReason>,
}

/// The local AEGIS instance
pub struct Local {
    settings: Settings,
    identity_uuid: Uuid,
    signing: Arc<SigningKeyPair>,
    connector: Option<Arc<dyn Connector>>,
    verifier: Arc<dyn EndpointVerifier>,
    extenders: Arc<ExtenderRegistry>,
    allowed_peers: Arc<StdRwLock<Vec<Uuid>>>,
    shared: Mutex<Option<Arc<Shared>>>,
    running: AtomicBool,
}

impl Local {
    /// Create an instance with a fresh Ed25519 identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for settings that fail validation.
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let (identity_uuid, signing) = Uuid::new_peer(SignatureAlgorithm::Ed25519)?;
        Ok(Self {
            settings,
            identity_uuid,
            signing: Arc::new(signing),
            connector: None,
            verifier: Arc::new(RejectingVerifier),
            extenders: Arc::new(ExtenderRegistry::new()),
            allowed_peers: Arc::new(StdRwLock::new(Vec::new())),
            shared: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Our identity
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.identity_uuid
    }

    /// Our long-term public signing key
    #[must_use]
    pub fn public_key(&self) -> Vec<u8> {
        self.signing.public.clone()
    }

    /// Install the outbound dialer
    pub fn set_connector(&mut self, connector: Arc<dyn Connector>) {
        self.connector = Some(connector);
    }

    /// Install the public-endpoint probe backend
    pub fn set_endpoint_verifier(&mut self, verifier: Arc<dyn EndpointVerifier>) {
        self.verifier = verifier;
    }

    /// Pre-register a peer identity for authenticated mode
    pub fn add_allowed_peer(&self, uuid: Uuid) {
        self.allowed_peers
            .write()
            .expect("allowed peers lock poisoned")
            .push(uuid);
    }

    /// Register an extender; connected peers learn about it immediately
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    pub async fn register_extender(&self, extender: Arc<dyn Extender>) -> Result<()> {
        self.extenders.add(extender)?;
        self.broadcast_extender_update().await;
        Ok(())
    }

    /// Remove an extender; its identity stays tolerated for the grace period
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    pub async fn unregister_extender(&self, uuid: &Uuid) -> Result<()> {
        self.extenders.remove(uuid)?;
        self.broadcast_extender_update().await;
        Ok(())
    }

    async fn broadcast_extender_update(&self) {
        let Some(shared) = self.shared.lock().await.clone() else {
            return;
        };
        let Ok(payload) = bincode::serialize(&shared.extenders.running_uuids()) else {
            return;
        };
        for luid in shared.registry.connected_luids() {
            let _ = shared
                .send_frame_to(luid, Frame::new(FrameType::ExtenderUpdate, payload.clone()))
                .await;
        }
    }

    /// Whether the instance is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn shared(&self) -> Result<Arc<Shared>> {
        self.shared.lock().await.clone().ok_or(Error::NotRunning)
    }

    /// Start the instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] when already running.
    pub async fn startup(&self) -> Result<()> {
        let mut slot = self.shared.lock().await;
        if slot.is_some() {
            return Err(Error::failed("already running"));
        }
        aegis_crypto::init();

        let mut pool_algorithms = vec![AsymmetricAlgorithm::X25519];
        for kem in self.settings.supported_algorithms.enabled_kems() {
            if let Some(alg) = AsymmetricAlgorithm::from_kem(kem) {
                pool_algorithms.push(alg);
            }
        }
        let workers = std::thread::available_parallelism()
            .map_or(2, std::num::NonZeroUsize::get)
            .min(4);
        let keymgr = Arc::new(KeyManager::new(
            &pool_algorithms,
            self.settings.num_pregenerated_keys_per_algorithm,
            workers,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let access = Arc::new(AccessManager::new(self.settings.clone()));
        let (listener_mgr, mut accepted_rx) =
            ListenerManager::new(Arc::clone(&access), shutdown_rx.clone());

        let shared = Arc::new(Shared {
            settings: self.settings.clone(),
            identity_uuid: self.identity_uuid,
            signing: Arc::clone(&self.signing),
            access,
            registry: Arc::new(PeerRegistry::new()),
            relays: Arc::new(RelayManager::new(
                self.settings.relays.clone(),
                self.settings.relay_security.clone(),
            )),
            extenders: Arc::clone(&self.extenders),
            keymgr,
            endpoints: Arc::new(PublicEndpoints::new(Arc::clone(&self.verifier), false)),
            connector: self.connector.clone(),
            allowed_peers: Arc::clone(&self.allowed_peers),
            listener_mgr,
            shutdown_tx,
            relay_origins: DashMap::new(),
            origin_gateways: DashMap::new(),
            relay_bridges: DashMap::new(),
            pending_opens: DashMap::new(),
            tasks: StdMutex::new(Vec::new()),
        });

        // Inbound handshake dispatcher
        {
            let shared_task = Arc::clone(&shared);
            let mut shutdown = shutdown_rx.clone();
            shared.spawn(tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = shutdown.changed() => break,
                        accepted = accepted_rx.recv() => match accepted {
                            Some(accepted) => accepted,
                            None => break,
                        },
                    };
                    let AcceptedTransport {
                        transport,
                        require_authentication,
                    } = accepted;
                    let shared_hs = Arc::clone(&shared_task);
                    let require_authentication =
                        require_authentication || shared_hs.settings.require_authentication;
                    tokio::spawn(async move {
                        let _ = shared_hs
                            .handshake_and_spawn(
                                transport,
                                PeerDirection::Inbound,
                                require_authentication,
                                None,
                            )
                            .await;
                    });
                }
            }));
        }

        // Endpoint verification worker
        {
            let endpoints = Arc::clone(&shared.endpoints);
            let shutdown = shutdown_rx.clone();
            shared.spawn(tokio::spawn(async move {
                endpoints.run_verifier(shutdown).await;
            }));
        }

        // Maintenance: relay deadlines, closed record collection
        {
            let registry = Arc::clone(&shared.registry);
            let relays = Arc::clone(&shared.relays);
            let mut shutdown = shutdown_rx;
            shared.spawn(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(MAINTENANCE_INTERVAL) => {
                            registry.collect_closed();
                            let _ = relays.tick();
                        }
                    }
                }
            }));
        }

        self.extenders.startup_all().await;
        *slot = Some(shared);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(identity = %self.identity_uuid, "local instance started");
        Ok(())
    }

    /// Stop the instance: peers get Shutdown frames, workers drain, pools
    /// stop refilling.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] when not running.
    pub async fn shutdown(&self) -> Result<()> {
        let shared = {
            let mut slot = self.shared.lock().await;
            slot.take().ok_or(Error::NotRunning)?
        };
        self.running.store(false, Ordering::SeqCst);

        self.extenders.shutdown_all().await;
        let _ = shared.shutdown_tx.send(true);
        shared.keymgr.shutdown().await;
        shared.listener_mgr.join().await;

        let tasks = {
            let mut guard = shared.tasks.lock().expect("task list lock poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(identity = %self.identity_uuid, "local instance stopped");
        Ok(())
    }

    /// Start accepting on `listener`
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] when not running.
    pub async fn add_listener(
        &self,
        listener: Box<dyn TransportListener>,
        require_authentication: bool,
    ) -> Result<()> {
        let shared = self.shared().await?;
        shared.listener_mgr.add_listener(
            listener,
            require_authentication,
            self.settings.udp.connect_cookie_requirement_threshold,
            self.settings.udp.cookie_expiration_interval,
        );
        Ok(())
    }

    /// Open a direct connection to `endpoint` and run the handshake.
    ///
    /// # Errors
    ///
    /// - [`Error::NotRunning`] / [`Error::InvalidArgument`] for state errors
    /// - [`Error::AccessDenied`] when admission refuses the address
    /// - [`Error::Timeout`] when connect or handshake blow their deadlines
    pub async fn connect_to(&self, endpoint: Endpoint) -> Result<PeerLuid> {
        let shared = self.shared().await?;
        let connector = shared
            .connector
            .clone()
            .ok_or(Error::invalid_argument("no connector installed"))?;

        shared
            .access
            .admit(&endpoint.address(), AttemptKind::Connection)
            .await?;

        let transport = tokio::time::timeout(
            self.settings.general.connect_timeout,
            connector.connect(endpoint),
        )
        .await
        .map_err(|_| Error::timeout("connect"))?
        .map_err(|e| Error::Failed(e.to_string().into()))?;

        shared
            .handshake_and_spawn(
                transport,
                PeerDirection::Outbound,
                self.settings.require_authentication,
                None,
            )
            .await
    }

    /// Open a connection to `endpoint` through a relay chain of `hops` hops,
    /// optionally via a specific `gateway` peer.
    ///
    /// # Errors
    ///
    /// - [`Error::RelayExcluded`] when the destination is excluded
    /// - [`Error::PeerNotFound`] when no eligible gateway exists
    /// - [`Error::Timeout`] when the chain does not confirm in time
    pub async fn connect_to_via_relay(
        &self,
        endpoint: Endpoint,
        hops: u8,
        gateway: Option<PeerLuid>,
    ) -> Result<PeerLuid> {
        // A single hop is just the direct link
        if hops <= 1 {
            return self.connect_to(endpoint).await;
        }
        let shared = self.shared().await?;
        shared
            .access
            .admit(&endpoint.address(), AttemptKind::Relay)
            .await?;

        let gateway = match gateway {
            Some(luid) => {
                shared.registry.with_peer(luid, |record| {
                    if !record.status.is_connected() {
                        return Err(Error::PeerNotFound);
                    }
                    Ok(luid)
                })??
            }
            None => shared.pick_gateway(None, &endpoint).await?,
        };

        let relay_port = shared.relays.new_relay_port();
        let (origin_tx, origin_rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
        shared.relay_origins.insert(relay_port, origin_tx);
        shared.origin_gateways.insert(relay_port, gateway);
        let (opened_tx, opened_rx) = oneshot::channel();
        shared.pending_opens.insert(relay_port, opened_tx);

        let open = RelayControlMessage::Open {
            relay_port,
            endpoint,
            hops_remaining: hops - 1,
        };
        if let Err(err) = shared
            .send_frame_to(gateway, relay_control_frame(&open)?)
            .await
        {
            shared.relay_origins.remove(&relay_port);
            shared.origin_gateways.remove(&relay_port);
            shared.pending_opens.remove(&relay_port);
            return Err(err);
        }

        let opened = tokio::time::timeout(
            self.settings.relay_security.connect_timeout,
            opened_rx,
        )
        .await;
        match opened {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                shared.relay_origins.remove(&relay_port);
                shared.origin_gateways.remove(&relay_port);
                return Err(err);
            }
            _ => {
                shared.relay_origins.remove(&relay_port);
                shared.origin_gateways.remove(&relay_port);
                shared.pending_opens.remove(&relay_port);
                return Err(Error::timeout("relay open"));
            }
        }

        let gateway_tx = shared
            .registry
            .with_peer(gateway, |record| record.command_tx.clone())?
            .ok_or(Error::PeerNotFound)?;
        let local_endpoint = shared
            .registry
            .with_peer(gateway, |record| record.local_endpoint)?;

        let transport = RelayTransport {
            relay_port,
            local: local_endpoint,
            peer: endpoint,
            gateway: gateway_tx,
            rx: Mutex::new(RelayRecvState {
                rx: origin_rx,
                pending: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        };

        shared
            .handshake_and_spawn(
                Box::new(transport),
                PeerDirection::Outbound,
                self.settings.require_authentication,
                Some(relay_port),
            )
            .await
    }

    /// Queue `data` for `extender`'s counterpart on `luid`.
    ///
    /// Normal priority fails fast with [`Error::NoMoreSlots`] when the
    /// peer's queue is full; expedited sends wait for room. The call
    /// resolves once the frame hit the transport, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::PeerNotFound`], [`Error::NoMoreSlots`], [`Error::Timeout`],
    /// [`Error::InvalidArgument`] for oversized messages.
    pub async fn send_to(
        &self,
        extender: Uuid,
        luid: PeerLuid,
        data: Vec<u8>,
        priority: SendPriority,
        timeout: Duration,
    ) -> Result<()> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::invalid_argument("message too large"));
        }
        let shared = self.shared().await?;
        let tx = shared
            .registry
            .with_peer(luid, |record| record.command_tx.clone())?
            .ok_or(Error::PeerNotFound)?;

        let (done_tx, done_rx) = oneshot::channel();
        let command = PeerCommand::Send {
            frame: Frame::for_extender(extender, data),
            priority,
            done: Some(done_tx),
        };

        match priority {
            SendPriority::Normal => tx.try_send(command).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => Error::NoMoreSlots,
                mpsc::error::TrySendError::Closed(_) => Error::PeerNotFound,
            })?,
            SendPriority::Expedited => tx
                .send(command)
                .await
                .map_err(|_| Error::PeerNotFound)?,
        }

        tokio::time::timeout(timeout, done_rx)
            .await
            .map_err(|_| Error::timeout("send"))?
            .map_err(|_| Error::Disconnected(DisconnectReason::TransportError))?
    }

    /// Close the connection to `luid` and wait for the record to close.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerNotFound`] for an unknown handle.
    pub async fn disconnect_from(&self, luid: PeerLuid) -> Result<()> {
        let shared = self.shared().await?;
        let tx = shared
            .registry
            .with_peer(luid, |record| record.command_tx.clone())?;
        if let Some(tx) = tx {
            let _ = tx
                .send(PeerCommand::Disconnect {
                    reason: DisconnectReason::Shutdown,
                })
                .await;
        }

        // Wait briefly for the pipeline to wind down
        for _ in 0..100 {
            let closed = shared
                .registry
                .with_peer(luid, |record| record.status == PeerStatus::Closed)
                .unwrap_or(true);
            if closed {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Snapshot the public details of a peer
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerNotFound`] for an unknown handle.
    pub async fn peer_details(&self, luid: PeerLuid) -> Result<PeerDetails> {
        let shared = self.shared().await?;
        shared.registry.with_peer(luid, |record| PeerDetails {
            luid: record.luid,
            status: record.status,
            peer_uuid: record.peer_uuid,
            remote_endpoint: record.remote_endpoint,
            bytes_sent: record.bytes_sent,
            bytes_received: record.bytes_received,
            is_relayed: record.is_relayed(),
            disconnect_reason: record.disconnect_reason,
        })
    }

    /// Handle for extenders to queue replies with
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] when not running.
    pub async fn peer_sender(&self) -> Result<PeerSender> {
        let shared = self.shared().await?;
        Ok(PeerSender {
            registry: Arc::clone(&shared.registry),
        })
    }

    /// The access control layer
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] when not running.
    pub async fn access(&self) -> Result<Arc<AccessManager>> {
        Ok(Arc::clone(&self.shared().await?.access))
    }

    /// The public endpoint table
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] when not running.
    pub async fn public_endpoints(&self) -> Result<Arc<PublicEndpoints>> {
        Ok(Arc::clone(&self.shared().await?.endpoints))
    }
}

struct RelayRecvState {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// A virtual transport tunnelling through a relay gateway
struct RelayTransport {
    relay_port: u64,
    local: Endpoint,
    peer: Endpoint,
    gateway: mpsc::Sender<PeerCommand>,
    rx: Mutex<RelayRecvState>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send(&self, buf: &[u8]) -> aegis_transport::TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(aegis_transport::TransportError::Closed);
        }
        let frame = Frame::new(
            FrameType::RelayData,
            relay::encode_relay_data(self.relay_port, buf),
        );
        self.gateway
            .send(PeerCommand::Send {
                frame,
                priority: SendPriority::Normal,
                done: None,
            })
            .await
            .map_err(|_| aegis_transport::TransportError::Closed)
    }

    async fn recv(&self, buf: &mut [u8]) -> aegis_transport::TransportResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(aegis_transport::TransportError::Closed);
        }
        let mut state = self.rx.lock().await;
        if state.pending.is_empty() {
            match state.rx.recv().await {
                Some(data) => state.pending = data,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(state.pending.len());
        buf[..n].copy_from_slice(&state.pending[..n]);
        state.pending.drain(..n);
        Ok(n)
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    fn peer_endpoint(&self) -> Endpoint {
        self.peer
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
