//! Relay engine.
//!
//! A relay link binds a session-unique random `relay_port` to the pair of
//! peers it forwards between. Frames are re-emitted opaquely; the payload is
//! end-to-end encrypted between the relay origin and the final endpoint by a
//! handshake run through the chain. Admission of every hop goes through the
//! access manager; excluded networks are never bridged into.

use aegis_transport::{Address, Endpoint};
use crate::config::{RelaySecuritySettings, RelaySettings};
use crate::error::{Error, Result};
use crate::peer::PeerLuid;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Maximum accepted `hops_remaining` in a relay request
pub const MAX_RELAY_HOPS: u8 = 8;

/// Relay link management messages, carried in `RelayControl` frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayControlMessage {
    /// Open a link toward `endpoint`
    Open {
        /// Session-unique relay port
        relay_port: u64,
        /// Final destination
        endpoint: Endpoint,
        /// Hops left after this one; zero means this node connects directly
        hops_remaining: u8,
    },
    /// The chain reached the final endpoint
    Opened {
        /// Port of the established link
        relay_port: u64,
    },
    /// Tear the link down (also signals open failure)
    Close {
        /// Port of the affected link
        relay_port: u64,
    },
    /// Upstream or downstream peer went inactive
    Suspend {
        /// Port of the affected link
        relay_port: u64,
    },
    /// The suspended link is live again
    Resume {
        /// Port of the affected link
        relay_port: u64,
    },
}

/// Prefix a relayed payload with its relay port
#[must_use]
pub fn encode_relay_data(relay_port: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&relay_port.to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Split a relayed payload into its relay port and inner bytes
///
/// # Errors
///
/// Returns [`Error::Failed`] for truncated payloads.
pub fn decode_relay_data(payload: &[u8]) -> Result<(u64, &[u8])> {
    if payload.len() < 8 {
        return Err(Error::failed("relay data truncated"));
    }
    let port = u64::from_be_bytes(payload[..8].try_into().expect("slice length"));
    Ok((port, &payload[8..]))
}

/// Link lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// Open requested, chain not yet confirmed
    Connecting,
    /// Forwarding
    Open,
    /// Frames dropped while an endpoint is inactive
    Suspended,
}

/// One forwarding entry
#[derive(Debug, Clone)]
pub struct RelayLink {
    /// Session-unique port
    pub relay_port: u64,
    /// Hops left toward the final endpoint when this node joined
    pub hops_remaining: u8,
    /// Peer toward the relay origin
    pub upstream: PeerLuid,
    /// Peer toward the final endpoint, once connected
    pub downstream: Option<PeerLuid>,
    /// Final destination of the chain
    pub endpoint: Endpoint,
    /// Lifecycle state
    pub status: RelayStatus,
    /// When the link was created
    pub created_at: Instant,
    /// Last forwarded frame
    pub last_activity: Instant,
    /// When the link was suspended, if it is
    pub suspended_at: Option<Instant>,
}

/// The relay forwarding table and its admission policy
pub struct RelayManager {
    settings: RelaySettings,
    security: RelaySecuritySettings,
    links: DashMap<u64, RelayLink>,
    /// Recently closed ports with their close time, for the grace window
    closed: Mutex<HashMap<u64, Instant>>,
}

impl RelayManager {
    /// Create with the configured admission policy
    #[must_use]
    pub fn new(settings: RelaySettings, security: RelaySecuritySettings) -> Self {
        Self {
            settings,
            security,
            links: DashMap::new(),
            closed: Mutex::new(HashMap::new()),
        }
    }

    /// Whether relaying is enabled at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.settings.enable
    }

    /// Whether `addr` falls in a CIDR block relays must not bridge into
    #[must_use]
    pub fn is_excluded(&self, addr: &Address) -> bool {
        match addr {
            Address::Ip(IpAddr::V4(ip)) => self
                .settings
                .ipv4_excluded_networks_cidr
                .iter()
                .any(|net| net.contains(ip)),
            Address::Ip(IpAddr::V6(ip)) => self
                .settings
                .ipv6_excluded_networks_cidr
                .iter()
                .any(|net| net.contains(ip)),
            Address::Bth(_) => false,
        }
    }

    /// Pick a relay port that is free at this node
    #[must_use]
    pub fn new_relay_port(&self) -> u64 {
        loop {
            let port = aegis_crypto::random::nonzero_u64();
            if !self.links.contains_key(&port) {
                return port;
            }
        }
    }

    /// Validate an inbound `Open` request arriving from `via`.
    ///
    /// # Errors
    ///
    /// - [`Error::Failed`] when relaying is disabled
    /// - [`Error::RelayLoop`] for hop-count violations or a port already in
    ///   use at this node
    /// - [`Error::RelayExcluded`] when the final endpoint or the requesting
    ///   peer lies in an excluded network
    pub fn validate_open(
        &self,
        relay_port: u64,
        endpoint: &Endpoint,
        hops_remaining: u8,
        via: &Address,
    ) -> Result<()> {
        if !self.settings.enable {
            return Err(Error::failed("relaying disabled"));
        }
        // Zero remaining hops at a node that is not the final endpoint means
        // the chain can never terminate
        if hops_remaining == 0 || hops_remaining > MAX_RELAY_HOPS {
            return Err(Error::RelayLoop);
        }
        if self.links.contains_key(&relay_port) {
            return Err(Error::RelayLoop);
        }
        if self.is_excluded(&endpoint.address()) || self.is_excluded(via) {
            return Err(Error::RelayExcluded);
        }
        Ok(())
    }

    /// Insert a link for an accepted `Open`
    pub fn insert(&self, link: RelayLink) {
        self.links.insert(link.relay_port, link);
    }

    /// Attach the downstream peer once the next hop is connected
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerNotFound`] for an unknown port.
    pub fn set_downstream(&self, relay_port: u64, downstream: PeerLuid) -> Result<()> {
        let mut link = self.links.get_mut(&relay_port).ok_or(Error::PeerNotFound)?;
        link.downstream = Some(downstream);
        link.status = RelayStatus::Open;
        Ok(())
    }

    /// Look up a link
    #[must_use]
    pub fn get(&self, relay_port: u64) -> Option<RelayLink> {
        self.links.get(&relay_port).map(|l| l.clone())
    }

    /// Where to forward a relayed frame arriving on `relay_port` from `from`.
    ///
    /// Returns `Ok(None)` when the frame must be silently discarded (link in
    /// its post-close grace window, or suspended).
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerNotFound`] for a port this node never knew (a
    /// protocol violation at the caller's discretion).
    pub fn forward_target(&self, relay_port: u64, from: PeerLuid) -> Result<Option<PeerLuid>> {
        if let Some(mut link) = self.links.get_mut(&relay_port) {
            if link.status == RelayStatus::Suspended {
                return Ok(None);
            }
            link.last_activity = Instant::now();
            if link.upstream == from {
                return Ok(link.downstream);
            }
            if link.downstream == Some(from) {
                return Ok(Some(link.upstream));
            }
            // A third peer using a known port is a violation
            return Err(Error::PeerNotFound);
        }

        let closed = self.closed.lock().expect("closed map lock poisoned");
        if let Some(closed_at) = closed.get(&relay_port) {
            if closed_at.elapsed() <= self.security.grace_period {
                return Ok(None);
            }
        }
        Err(Error::PeerNotFound)
    }

    /// Close a link; its port enters the grace window
    pub fn close(&self, relay_port: u64) -> Option<RelayLink> {
        let removed = self.links.remove(&relay_port).map(|(_, link)| link);
        if removed.is_some() {
            self.closed
                .lock()
                .expect("closed map lock poisoned")
                .insert(relay_port, Instant::now());
            tracing::debug!(relay_port, "relay link closed");
        }
        removed
    }

    /// Suspend a link whose endpooint reported inactivity
    pub fn suspend(&self, relay_port: u64) {
        if let Some(mut link) = self.links.get_mut(&relay_port) {
            if link.status != RelayStatus::Suspended {
                link.status = RelayStatus::Suspended;
                link.suspended_at = Some(Instant::now());
            }
        }
    }

    /// Resume a suspended link
    pub fn resume(&self, relay_port: u64) {
        if let Some(mut link) = self.links.get_mut(&relay_port) {
            if link.status == RelayStatus::Suspended {
                link.status = RelayStatus::Open;
                link.suspended_at = None;
            }
        }
    }

    /// All links touching a peer
    #[must_use]
    pub fn links_for_peer(&self, luid: PeerLuid) -> Vec<u64> {
        self.links
            .iter()
            .filter(|entry| entry.upstream == luid || entry.downstream == Some(luid))
            .map(|entry| entry.relay_port)
            .collect()
    }

    /// Drop suspended links past their deadline and expire the grace map.
    /// Returns the ports torn down.
    pub fn tick(&self) -> Vec<u64> {
        let torn_down: Vec<u64> = self
            .links
            .iter()
            .filter(|entry| {
                entry
                    .suspended_at
                    .is_some_and(|at| at.elapsed() > self.security.max_suspend_duration)
            })
            .map(|entry| entry.relay_port)
            .collect();
        for port in &torn_down {
            self.close(*port);
        }

        self.closed
            .lock()
            .expect("closed map lock poisoned")
            .retain(|_, at| at.elapsed() <= self.security.grace_period);

        torn_down
    }

    /// Number of live links
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_settings() -> RelaySettings {
        RelaySettings {
            enable: true,
            ipv4_excluded_networks_cidr: vec!["192.168.0.0/16".parse().unwrap()],
            ipv6_excluded_networks_cidr: vec!["fc00::/7".parse().unwrap()],
        }
    }

    fn manager() -> RelayManager {
        RelayManager::new(enabled_settings(), RelaySecuritySettings::default())
    }

    fn link(port: u64, upstream: PeerLuid, downstream: Option<PeerLuid>) -> RelayLink {
        RelayLink {
            relay_port: port,
            hops_remaining: 1,
            upstream,
            downstream,
            endpoint: "tcp://1.2.3.4:9000".parse().unwrap(),
            status: if downstream.is_some() {
                RelayStatus::Open
            } else {
                RelayStatus::Connecting
            },
            created_at: Instant::now(),
            last_activity: Instant::now(),
            suspended_at: None,
        }
    }

    fn addr(s: &str) -> Address {
        Address::Ip(s.parse().unwrap())
    }

    #[test]
    fn test_relay_data_roundtrip() {
        let encoded = encode_relay_data(0xDEAD_BEEF, b"opaque");
        let (port, inner) = decode_relay_data(&encoded).unwrap();
        assert_eq!(port, 0xDEAD_BEEF);
        assert_eq!(inner, b"opaque");

        assert!(decode_relay_data(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_validate_open_policies() {
        let mgr = manager();
        let ep: Endpoint = "tcp://1.2.3.4:9000".parse().unwrap();

        mgr.validate_open(7, &ep, 2, &addr("10.0.0.1")).unwrap();

        // Hop count violations
        assert_eq!(
            mgr.validate_open(7, &ep, MAX_RELAY_HOPS + 1, &addr("10.0.0.1")),
            Err(Error::RelayLoop)
        );
        assert_eq!(
            mgr.validate_open(7, &ep, 0, &addr("10.0.0.1")),
            Err(Error::RelayLoop)
        );

        // Excluded final endpoint
        let excluded: Endpoint = "tcp://192.168.1.1:9000".parse().unwrap();
        assert_eq!(
            mgr.validate_open(7, &excluded, 2, &addr("10.0.0.1")),
            Err(Error::RelayExcluded)
        );

        // Excluded requesting peer
        assert_eq!(
            mgr.validate_open(7, &ep, 2, &addr("192.168.1.1")),
            Err(Error::RelayExcluded)
        );

        // Port already in use
        mgr.insert(link(7, PeerLuid::from_raw(1), Some(PeerLuid::from_raw(2))));
        assert_eq!(
            mgr.validate_open(7, &ep, 2, &addr("10.0.0.1")),
            Err(Error::RelayLoop)
        );
    }

    #[test]
    fn test_disabled_refuses_open() {
        let mgr = RelayManager::new(RelaySettings::default(), RelaySecuritySettings::default());
        let ep: Endpoint = "tcp://1.2.3.4:9000".parse().unwrap();
        assert!(mgr.validate_open(1, &ep, 1, &addr("10.0.0.1")).is_err());
    }

    #[test]
    fn test_forwarding_both_directions() {
        let mgr = manager();
        let up = PeerLuid::from_raw(1);
        let down = PeerLuid::from_raw(2);
        mgr.insert(link(42, up, Some(down)));

        assert_eq!(mgr.forward_target(42, up).unwrap(), Some(down));
        assert_eq!(mgr.forward_target(42, down).unwrap(), Some(up));

        // A peer that is not part of the link
        assert!(mgr.forward_target(42, PeerLuid::from_raw(9)).is_err());
        // A port never seen
        assert!(mgr.forward_target(99, up).is_err());
    }

    #[test]
    fn test_grace_period_accepts_and_discards() {
        let mgr = manager();
        let up = PeerLuid::from_raw(1);
        mgr.insert(link(42, up, Some(PeerLuid::from_raw(2))));

        mgr.close(42);
        // Within grace: silently discarded
        assert_eq!(mgr.forward_target(42, up).unwrap(), None);
        assert_eq!(mgr.link_count(), 0);
    }

    #[test]
    fn test_grace_period_expires() {
        let security = RelaySecuritySettings {
            grace_period: Duration::from_millis(10),
            ..Default::default()
        };
        let mgr = RelayManager::new(enabled_settings(), security);
        let up = PeerLuid::from_raw(1);
        mgr.insert(link(42, up, Some(PeerLuid::from_raw(2))));
        mgr.close(42);

        std::thread::sleep(Duration::from_millis(20));
        assert!(mgr.forward_target(42, up).is_err());
        mgr.tick();
    }

    #[test]
    fn test_suspend_drops_then_teardown() {
        let security = RelaySecuritySettings {
            max_suspend_duration: Duration::from_millis(10),
            ..Default::default()
        };
        let mgr = RelayManager::new(enabled_settings(), security);
        let up = PeerLuid::from_raw(1);
        mgr.insert(link(42, up, Some(PeerLuid::from_raw(2))));

        mgr.suspend(42);
        assert_eq!(mgr.forward_target(42, up).unwrap(), None);

        std::thread::sleep(Duration::from_millis(20));
        let torn_down = mgr.tick();
        assert_eq!(torn_down, vec![42]);
        assert_eq!(mgr.link_count(), 0);
    }

    #[test]
    fn test_resume_restores_forwarding() {
        let mgr = manager();
        let up = PeerLuid::from_raw(1);
        let down = PeerLuid::from_raw(2);
        mgr.insert(link(42, up, Some(down)));

        mgr.suspend(42);
        mgr.resume(42);
        assert_eq!(mgr.forward_target(42, up).unwrap(), Some(down));
    }

    #[test]
    fn test_links_for_peer() {
        let mgr = manager();
        let a = PeerLuid::from_raw(1);
        let b = PeerLuid::from_raw(2);
        let c = PeerLuid::from_raw(3);
        mgr.insert(link(1, a, Some(b)));
        mgr.insert(link(2, b, Some(c)));
        mgr.insert(link(3, a, Some(c)));

        let mut ports = mgr.links_for_peer(a);
        ports.sort_unstable();
        assert_eq!(ports, vec![1, 3]);
        assert_eq!(mgr.links_for_peer(b).len(), 2);
    }

    #[test]
    fn test_new_relay_port_unique() {
        let mgr = manager();
        let port = mgr.new_relay_port();
        assert_ne!(port, 0);
        mgr.insert(link(port, PeerLuid::from_raw(1), None));
        assert_ne!(mgr.new_relay_port(), port);
    }
}
