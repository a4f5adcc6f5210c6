//! The per-peer pipeline task.
//!
//! One task owns each connected peer end-to-end: it seals and sends queued
//! frames, opens and dispatches inbound records, evaluates rekey triggers,
//! emits noise, and watches the suspend deadlines. Because a single task
//! owns the key state, per-peer frame ordering holds and no data frame can
//! straddle a key install.

use aegis_crypto::kdf::SessionKeys;
use aegis_transport::{Address, Transport};
use crate::access::ReputationUpdate;
use crate::config::{GeneralSecuritySettings, KeyUpdateSettings, MessageSettings, NoiseSettings};
use crate::error::{DisconnectReason, Error, Result};
use crate::frame::{Frame, FrameCodec, FrameType, WireRecord};
use crate::keymgr::{AsymmetricAlgorithm, KeyManager};
use crate::noise::NoiseGenerator;
use crate::peer::connection::Connection;
use crate::peer::handshake::HandshakeOutcome;
use crate::peer::keystate::PeerKeys;
use crate::peer::rekey::{self, RekeyMessage, RekeyScheduler};
use crate::peer::{PeerCommand, PeerDirection, PeerLuid, PeerRegistry, PeerStatus};
use crate::relay::RelayControlMessage;
use crate::uuid::Uuid;
use aegis_crypto::algorithms::Algorithms;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Protocol violations tolerated before the peer is closed
const MAX_VIOLATIONS: u32 = 5;

/// Pipeline housekeeping cadence
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Depth of the per-peer command queue
pub const COMMAND_QUEUE_DEPTH: usize = 256;

/// What the pipeline reports up into the node
#[async_trait]
pub trait PipelineHooks: Send + Sync {
    /// A data frame arrived
    async fn on_message(&self, luid: PeerLuid, extender: Option<Uuid>, data: Vec<u8>);
    /// A relay control message arrived
    async fn on_relay_control(&self, luid: PeerLuid, message: RelayControlMessage);
    /// A relayed payload arrived
    async fn on_relay_data(&self, luid: PeerLuid, relay_port: u64, data: Vec<u8>);
    /// The peer updated its advertised extender set
    async fn on_extender_update(&self, luid: PeerLuid, extenders: Vec<Uuid>);
    /// The peer entered or left the suspended state
    async fn on_suspend_changed(&self, luid: PeerLuid, suspended: bool);
    /// The pipeline ended
    async fn on_disconnected(&self, luid: PeerLuid, reason: DisconnectReason);
    /// The peer's behavior changed its address reputation
    async fn on_reputation(&self, addr: Address, update: ReputationUpdate);
}

/// Settings slice the pipeline needs
#[derive(Clone)]
pub struct PipelineConfig {
    /// Framing knobs
    pub message: MessageSettings,
    /// Rekey policy
    pub key_update: KeyUpdateSettings,
    /// Noise policy
    pub noise: NoiseSettings,
    /// Lifetime and suspend policy
    pub general: GeneralSecuritySettings,
    /// Mixed into rekey derivations
    pub global_shared_secret: Option<Vec<u8>>,
}

/// The state a pipeline task drives
pub struct PeerPipeline {
    luid: PeerLuid,
    remote_addr: Address,
    direction: PeerDirection,
    algorithms: Algorithms,
    keys: PeerKeys,
    codec: FrameCodec,
    rekey: RekeyScheduler,
    noise: NoiseGenerator,
    config: PipelineConfig,
    registry: Arc<PeerRegistry>,
    keymgr: Arc<KeyManager>,
    hooks: Arc<dyn PipelineHooks>,
    violations: u32,
    last_activity: Instant,
    suspended_since: Option<Instant>,
}

impl PeerPipeline {
    /// Build a pipeline from a completed handshake
    #[must_use]
    pub fn new(
        luid: PeerLuid,
        remote_addr: Address,
        direction: PeerDirection,
        outcome: HandshakeOutcome,
        config: PipelineConfig,
        registry: Arc<PeerRegistry>,
        keymgr: Arc<KeyManager>,
        hooks: Arc<dyn PipelineHooks>,
    ) -> Self {
        let codec = FrameCodec {
            compression: outcome.algorithms.compression,
            min_prefix: config.message.min_random_data_prefix_size,
            max_prefix: config.message.max_random_data_prefix_size,
            min_padding: config.message.min_internal_random_data_size,
            max_padding: config.message.max_internal_random_data_size,
        };
        Self {
            luid,
            remote_addr,
            direction,
            algorithms: outcome.algorithms,
            keys: outcome.keys,
            codec,
            rekey: RekeyScheduler::new(config.key_update.clone()),
            noise: NoiseGenerator::new(config.noise.clone()),
            config,
            registry,
            keymgr,
            hooks,
            violations: 0,
            last_activity: Instant::now(),
            suspended_since: None,
        }
    }

    /// Drive the peer until it disconnects
    pub async fn run(
        mut self,
        mut conn: Connection,
        mut commands: mpsc::Receiver<PeerCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let transport = conn.sender();
        let suspendable = transport.is_suspendable();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    None => break DisconnectReason::Shutdown,
                    Some(PeerCommand::Send { frame, priority: _, done }) => {
                        let result = self.send_frame(&transport, &frame).await;
                        let failed = result.is_err();
                        if let Some(done) = done {
                            let _ = done.send(result);
                        }
                        if failed {
                            break DisconnectReason::TransportError;
                        }
                    }
                    Some(PeerCommand::Disconnect { reason }) => {
                        let _ = self
                            .send_frame(&transport, &Frame::new(FrameType::Shutdown, Vec::new()))
                            .await;
                        break reason;
                    }
                },
                record = conn.recv_wire_record() => match record {
                    Err(_) => break DisconnectReason::TransportError,
                    Ok(record) => {
                        if let Some(reason) = self.handle_record(&transport, record).await {
                            break reason;
                        }
                    }
                },
                _ = tick.tick() => {
                    if let Some(reason) = self.on_tick(&transport, suspendable).await {
                        break reason;
                    }
                }
                _ = shutdown.changed() => {
                    let _ = self
                        .send_frame(&transport, &Frame::new(FrameType::Shutdown, Vec::new()))
                        .await;
                    break DisconnectReason::Shutdown;
                }
            }
        };

        conn.close().await;
        let _ = self.registry.with_peer_mut(self.luid, |record| {
            record.disconnect_reason = Some(reason);
            let _ = record.set_status(PeerStatus::Closed);
        });
        tracing::info!(peer = %self.luid, %reason, "peer disconnected");
        self.hooks.on_disconnected(self.luid, reason).await;
    }

    async fn send_frame(&mut self, transport: &Arc<dyn Transport>, frame: &Frame) -> Result<()> {
        let plaintext = self.codec.encode_plaintext(frame)?;
        let (nonce, ciphertext) = self.keys.seal(&plaintext)?;
        let record = self.codec.wrap_record(&nonce, &ciphertext)?;
        transport.send(&record).await.map_err(Error::from)?;

        self.last_activity = Instant::now();
        let _ = self.registry.with_peer_mut(self.luid, |record| {
            record.bytes_sent += frame.payload.len() as u64;
            record.last_activity = Instant::now();
            if let Some(extender) = &frame.extender {
                record
                    .extender_counters
                    .entry(*extender)
                    .or_default()
                    .bytes_sent += frame.payload.len() as u64;
            }
        });
        Ok(())
    }

    /// Record a violation; closes the peer once the threshold is reached
    async fn violation(&mut self, update: ReputationUpdate) -> Option<DisconnectReason> {
        self.hooks.on_reputation(self.remote_addr, update).await;
        let _ = self.registry.with_peer_mut(self.luid, |record| {
            record.reputation_delta += update as i16 as i32;
        });
        self.violations += 1;
        if self.violations >= MAX_VIOLATIONS {
            tracing::warn!(peer = %self.luid, "violation threshold reached");
            Some(DisconnectReason::ProtocolViolation)
        } else {
            None
        }
    }

    async fn resume_if_suspended(&mut self) {
        if self.suspended_since.take().is_some() {
            let _ = self
                .registry
                .with_peer_mut(self.luid, |record| record.set_status(PeerStatus::Ready));
            self.hooks.on_suspend_changed(self.luid, false).await;
        }
    }

    async fn handle_record(
        &mut self,
        transport: &Arc<dyn Transport>,
        record: WireRecord,
    ) -> Option<DisconnectReason> {
        let grace = self.rekey.previous_key_grace();
        let plaintext = match self.keys.open(&record.nonce, &record.ciphertext, grace) {
            Ok((plaintext, _)) => plaintext,
            Err(_) => {
                // MAC failure or replay
                self.hooks
                    .on_reputation(self.remote_addr, ReputationUpdate::DeteriorateSevere)
                    .await;
                return Some(DisconnectReason::AuthFailure);
            }
        };

        let frame = match self.codec.decode_plaintext(&plaintext) {
            Ok(frame) => frame,
            Err(_) => return self.violation(ReputationUpdate::DeteriorateModerate).await,
        };

        if frame.age() > self.config.message.age_tolerance {
            tracing::debug!(peer = %self.luid, "frame outside age tolerance");
            return self.violation(ReputationUpdate::DeteriorateModerate).await;
        }

        self.last_activity = Instant::now();
        self.resume_if_suspended().await;
        let _ = self.registry.with_peer_mut(self.luid, |record| {
            record.bytes_received += frame.payload.len() as u64;
            record.last_activity = Instant::now();
            if let Some(extender) = &frame.extender {
                record
                    .extender_counters
                    .entry(*extender)
                    .or_default()
                    .bytes_received += frame.payload.len() as u64;
            }
        });

        match frame.frame_type {
            FrameType::Data => {
                self.hooks
                    .on_message(self.luid, frame.extender, frame.payload)
                    .await;
                None
            }
            FrameType::Ping => {
                let payload = aegis_crypto::random::bytes(self.noise.payload_size());
                let pong = Frame::new(FrameType::Pong, payload);
                if self.send_frame(transport, &pong).await.is_err() {
                    return Some(DisconnectReason::TransportError);
                }
                None
            }
            FrameType::Pong => None,
            FrameType::Rekey => self.handle_rekey(transport, &frame.payload).await,
            FrameType::ExtenderUpdate => {
                let Ok(mut extenders) = bincode::deserialize::<Vec<Uuid>>(&frame.payload) else {
                    return self.violation(ReputationUpdate::DeteriorateModerate).await;
                };
                extenders.sort_unstable();
                extenders.dedup();
                let _ = self.registry.with_peer_mut(self.luid, |record| {
                    record.peer_extenders = extenders.clone();
                });
                self.hooks.on_extender_update(self.luid, extenders).await;
                None
            }
            FrameType::Shutdown => Some(DisconnectReason::Shutdown),
            FrameType::RelayData => {
                let Ok((relay_port, inner)) = crate::relay::decode_relay_data(&frame.payload)
                else {
                    return self.violation(ReputationUpdate::DeteriorateModerate).await;
                };
                self.hooks
                    .on_relay_data(self.luid, relay_port, inner.to_vec())
                    .await;
                None
            }
            FrameType::RelayControl => {
                let Ok(message) = bincode::deserialize::<RelayControlMessage>(&frame.payload)
                else {
                    return self.violation(ReputationUpdate::DeteriorateModerate).await;
                };
                self.hooks.on_relay_control(self.luid, message).await;
                None
            }
        }
    }

    async fn handle_rekey(
        &mut self,
        transport: &Arc<dyn Transport>,
        payload: &[u8],
    ) -> Option<DisconnectReason> {
        let Ok(message) = bincode::deserialize::<RekeyMessage>(payload) else {
            return self.violation(ReputationUpdate::DeteriorateModerate).await;
        };

        match message {
            RekeyMessage::Request { public_key } => {
                // Crossed initiations: yield to the peer's exchange
                if self.rekey.in_progress() {
                    let _ = self.rekey.take_keypair();
                    self.rekey.complete();
                }
                if self.keys.has_pending() {
                    return self.violation(ReputationUpdate::DeteriorateModerate).await;
                }
                let pair = match self.keymgr.get_keys(AsymmetricAlgorithm::X25519).await {
                    Ok(pair) => pair,
                    Err(_) => return Some(DisconnectReason::RekeyTimeout),
                };
                let session = match self.derive(&pair.private, &public_key, false) {
                    Ok(session) => session,
                    Err(_) => {
                        return self.violation(ReputationUpdate::DeteriorateModerate).await;
                    }
                };
                if self.keys.install_pending(&session).is_err() {
                    return self.violation(ReputationUpdate::DeteriorateModerate).await;
                }
                self.rekey.begin_responder();
                self.set_status(PeerStatus::Rekeying);

                let response = RekeyMessage::Response {
                    public_key: pair.public,
                };
                if self.send_rekey(transport, &response).await.is_err() {
                    return Some(DisconnectReason::TransportError);
                }
                None
            }
            RekeyMessage::Response { public_key } => {
                let Some(pair) = self.rekey.take_keypair() else {
                    return self.violation(ReputationUpdate::DeteriorateModerate).await;
                };
                let session = match self.derive(&pair.private, &public_key, true) {
                    Ok(session) => session,
                    Err(_) => {
                        return self.violation(ReputationUpdate::DeteriorateModerate).await;
                    }
                };
                if self.keys.install_pending(&session).is_err()
                    || self.keys.commit_pending().is_err()
                {
                    return self.violation(ReputationUpdate::DeteriorateModerate).await;
                }
                // First frame under the new key
                if self.send_rekey(transport, &RekeyMessage::Commit).await.is_err() {
                    return Some(DisconnectReason::TransportError);
                }
                self.rekey.complete();
                self.set_status(PeerStatus::Ready);
                tracing::debug!(peer = %self.luid, "rekey complete (initiator)");
                None
            }
            RekeyMessage::Commit => {
                // Opening the Commit frame already promoted our pending set
                self.rekey.complete();
                self.set_status(PeerStatus::Ready);
                tracing::debug!(peer = %self.luid, "rekey complete (responder)");
                None
            }
        }
    }

    fn derive(
        &self,
        our_private: &[u8],
        their_public: &[u8],
        initiated_by_us: bool,
    ) -> Result<SessionKeys> {
        rekey::derive_rekey_keys(
            self.algorithms.hash,
            our_private,
            their_public,
            initiated_by_us,
            self.config.global_shared_secret.as_deref(),
        )
    }

    async fn send_rekey(
        &mut self,
        transport: &Arc<dyn Transport>,
        message: &RekeyMessage,
    ) -> Result<()> {
        let payload =
            bincode::serialize(message).map_err(|e| Error::Failed(e.to_string().into()))?;
        self.send_frame(transport, &Frame::new(FrameType::Rekey, payload))
            .await
    }

    fn set_status(&self, status: PeerStatus) {
        let _ = self
            .registry
            .with_peer_mut(self.luid, |record| record.set_status(status));
    }

    async fn on_tick(
        &mut self,
        transport: &Arc<dyn Transport>,
        suspendable: bool,
    ) -> Option<DisconnectReason> {
        self.keys.expire_previous(self.rekey.previous_key_grace());

        if self.rekey.timed_out() {
            return Some(DisconnectReason::RekeyTimeout);
        }

        // The connection's initiator drives periodic rekeys; the accepting
        // side only forces one when its own nonce space runs out
        let rekey_due = match self.direction {
            PeerDirection::Outbound => self.rekey.should_rekey(&self.keys),
            PeerDirection::Inbound => {
                !self.rekey.in_progress()
                    && !self.keys.has_pending()
                    && self.keys.nonce_exhaustion_imminent()
            }
        };
        if rekey_due {
            let pair = match self.keymgr.get_keys(AsymmetricAlgorithm::X25519).await {
                Ok(pair) => pair,
                Err(_) => return Some(DisconnectReason::RekeyTimeout),
            };
            let request = RekeyMessage::Request {
                public_key: pair.public.clone(),
            };
            self.rekey.begin(pair);
            self.set_status(PeerStatus::Rekeying);
            tracing::debug!(peer = %self.luid, "initiating rekey");
            if self.send_rekey(transport, &request).await.is_err() {
                return Some(DisconnectReason::TransportError);
            }
        }

        let suspended = self.suspended_since.is_some();
        if self.noise.take_due(suspended) {
            let payload = aegis_crypto::random::bytes(self.noise.payload_size());
            if self
                .send_frame(transport, &Frame::new(FrameType::Ping, payload))
                .await
                .is_err()
            {
                return Some(DisconnectReason::TransportError);
            }
        }

        if suspendable {
            let idle = self.last_activity.elapsed();
            match self.suspended_since {
                None if idle > self.config.general.suspend_timeout => {
                    tracing::debug!(peer = %self.luid, "suspending inactive peer");
                    self.suspended_since = Some(Instant::now());
                    self.set_status(PeerStatus::Suspended);
                    self.hooks.on_suspend_changed(self.luid, true).await;
                }
                Some(since) if since.elapsed() > self.config.general.max_suspend_duration => {
                    return Some(DisconnectReason::Timeout);
                }
                _ => {}
            }
        }

        None
    }
}
