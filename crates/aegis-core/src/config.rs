//! Startup configuration.
//!
//! One [`Settings`] tree covers every recognized option. Settings are
//! validated once at startup; a tree that fails validation refuses to start
//! rather than running with partial effect.

use aegis_crypto::algorithms::SupportedAlgorithms;
use crate::error::{Error, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-protocol inbound listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerProtocolSettings {
    /// Whether this listener family is enabled
    pub enable: bool,
    /// Ports (or RFCOMM channels) to listen on
    pub ports: Vec<u16>,
    /// Reject peers whose identity is not pre-registered
    pub require_authentication: bool,
    /// Whether the service is advertised to discovery (Bluetooth SDP)
    pub discoverable: bool,
}

impl Default for ListenerProtocolSettings {
    fn default() -> Self {
        Self {
            enable: false,
            ports: vec![999],
            require_authentication: false,
            discoverable: false,
        }
    }
}

/// Inbound listener configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// TCP listeners
    pub tcp: ListenerProtocolSettings,
    /// UDP listeners
    pub udp: ListenerProtocolSettings,
    /// Bluetooth RFCOMM listeners
    pub bth: ListenerProtocolSettings,
    /// Request port bindings that support NAT hole punching
    pub enable_nat_traversal: bool,
}

/// Relay engine admission configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Whether this node forwards relay traffic
    pub enable: bool,
    /// IPv4 networks relays must not bridge into
    pub ipv4_excluded_networks_cidr: Vec<Ipv4Net>,
    /// IPv6 networks relays must not bridge into
    pub ipv6_excluded_networks_cidr: Vec<Ipv6Net>,
}

/// Message framing knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSettings {
    /// Maximum allowed |frame timestamp - local clock|
    pub age_tolerance: Duration,
    /// Minimum random data prefix per frame
    pub min_random_data_prefix_size: usize,
    /// Maximum random data prefix per frame
    pub max_random_data_prefix_size: usize,
    /// Minimum internal random padding per frame
    pub min_internal_random_data_size: usize,
    /// Maximum internal random padding per frame
    pub max_internal_random_data_size: usize,
    /// How long frames for a just-removed extender are tolerated
    pub extender_grace_period: Duration,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            age_tolerance: Duration::from_secs(600),
            min_random_data_prefix_size: 0,
            max_random_data_prefix_size: 64,
            min_internal_random_data_size: 0,
            max_internal_random_data_size: 64,
            extender_grace_period: Duration::from_secs(60),
        }
    }
}

/// Rekey policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUpdateSettings {
    /// Earliest a periodic rekey may fire
    pub min_interval: Duration,
    /// Latest a periodic rekey must fire
    pub max_interval: Duration,
    /// Deadline for completing one rekey exchange
    pub max_duration: Duration,
    /// Bytes processed under one key that force a rekey
    pub require_after_num_processed_bytes: u64,
}

impl Default for KeyUpdateSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(300),
            max_interval: Duration::from_secs(1200),
            max_duration: Duration::from_secs(240),
            require_after_num_processed_bytes: 4_200_000_000,
        }
    }
}

/// Noise traffic configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseSettings {
    /// Whether noise frames are emitted at all
    pub enabled: bool,
    /// Length of one noise scheduling interval
    pub time_interval: Duration,
    /// Minimum noise frames per interval
    pub min_messages_per_interval: usize,
    /// Maximum noise frames per interval
    pub max_messages_per_interval: usize,
    /// Minimum random payload size
    pub min_message_size: usize,
    /// Maximum random payload size
    pub max_message_size: usize,
}

impl Default for NoiseSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            time_interval: Duration::from_secs(10),
            min_messages_per_interval: 0,
            max_messages_per_interval: 30,
            min_message_size: 0,
            max_message_size: 512,
        }
    }
}

/// Connection attempt rate limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAttemptSettings {
    /// Attempts allowed per interval before reputation deteriorates
    pub max_per_interval: usize,
    /// Length of the sliding window
    pub interval: Duration,
}

impl Default for ConnectionAttemptSettings {
    fn default() -> Self {
        Self {
            max_per_interval: 2,
            interval: Duration::from_secs(10),
        }
    }
}

/// Peer lifetime and rate limit settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralSecuritySettings {
    /// Outbound connect timeout
    pub connect_timeout: Duration,
    /// Upper bound of the random pre-handshake delay
    pub max_handshake_delay: Duration,
    /// Deadline for completing the handshake
    pub max_handshake_duration: Duration,
    /// Inactivity before a suspendable peer is suspended
    pub suspend_timeout: Duration,
    /// How long a peer may stay suspended before it is closed
    pub max_suspend_duration: Duration,
    /// Address connection-attempt rate limit
    pub ip_connection_attempts: ConnectionAttemptSettings,
    /// Elapsed time per +20 reputation improvement
    pub ip_reputation_improvement_interval: Duration,
}

impl Default for GeneralSecuritySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            max_handshake_delay: Duration::ZERO,
            max_handshake_duration: Duration::from_secs(30),
            suspend_timeout: Duration::from_secs(60),
            max_suspend_duration: Duration::from_secs(600),
            ip_connection_attempts: ConnectionAttemptSettings::default(),
            ip_reputation_improvement_interval: Duration::from_secs(600),
        }
    }
}

/// Relay-specific security settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySecuritySettings {
    /// Deadline for opening a relay link
    pub connect_timeout: Duration,
    /// Accept-and-discard window after a relay closes
    pub grace_period: Duration,
    /// How long a suspended relay survives before teardown
    pub max_suspend_duration: Duration,
    /// Relay attempt rate limit
    pub connection_attempts: ConnectionAttemptSettings,
}

impl Default for RelaySecuritySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(60),
            max_suspend_duration: Duration::from_secs(60),
            connection_attempts: ConnectionAttemptSettings {
                max_per_interval: 10,
                interval: Duration::from_secs(10),
            },
        }
    }
}

/// UDP transport and handshake decoy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpSecuritySettings {
    /// Inbound connects per interval above which cookies are required
    pub connect_cookie_requirement_threshold: usize,
    /// Lifetime of one cookie key
    pub cookie_expiration_interval: Duration,
    /// Upper bound of the random MTU discovery start delay
    pub max_mtu_discovery_delay: Duration,
    /// Decoy frames either side may emit during the handshake
    pub max_num_decoy_messages: usize,
    /// Upper bound of the random gap between decoy frames
    pub max_decoy_message_interval: Duration,
}

impl Default for UdpSecuritySettings {
    fn default() -> Self {
        Self {
            connect_cookie_requirement_threshold: 10,
            cookie_expiration_interval: Duration::from_secs(120),
            max_mtu_discovery_delay: Duration::ZERO,
            max_num_decoy_messages: 0,
            max_decoy_message_interval: Duration::ZERO,
        }
    }
}

/// The complete startup configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Reject peers whose identity is not pre-registered
    pub require_authentication: bool,
    /// Optional pre-shared secret mixed into every handshake KDF
    pub global_shared_secret: Option<Vec<u8>>,
    /// Algorithms offered during the Hello exchange
    pub supported_algorithms: SupportedAlgorithms,
    /// Pregenerated keypair pool depth per asymmetric algorithm
    pub num_pregenerated_keys_per_algorithm: usize,
    /// Inbound listeners
    pub listeners: ListenerSettings,
    /// Relay engine admission
    pub relays: RelaySettings,
    /// Message framing knobs
    pub message: MessageSettings,
    /// Rekey policy
    pub key_update: KeyUpdateSettings,
    /// Noise traffic
    pub noise: NoiseSettings,
    /// Peer lifetime and rate limits
    pub general: GeneralSecuritySettings,
    /// Relay-specific limits
    pub relay_security: RelaySecuritySettings,
    /// UDP transport and decoys
    pub udp: UdpSecuritySettings,
}

impl Settings {
    /// Validate the whole tree; called once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.message.min_random_data_prefix_size > self.message.max_random_data_prefix_size {
            return Err(Error::invalid_argument(
                "message.min_random_data_prefix_size exceeds maximum",
            ));
        }
        if self.message.max_random_data_prefix_size > u8::MAX as usize {
            return Err(Error::invalid_argument(
                "message.max_random_data_prefix_size exceeds 255",
            ));
        }
        if self.message.min_internal_random_data_size > self.message.max_internal_random_data_size
        {
            return Err(Error::invalid_argument(
                "message.min_internal_random_data_size exceeds maximum",
            ));
        }
        if self.key_update.min_interval > self.key_update.max_interval {
            return Err(Error::invalid_argument(
                "key_update.min_interval exceeds max_interval",
            ));
        }
        if self.key_update.max_duration.is_zero() {
            return Err(Error::invalid_argument("key_update.max_duration is zero"));
        }
        if self.key_update.require_after_num_processed_bytes == 0 {
            return Err(Error::invalid_argument(
                "key_update.require_after_num_processed_bytes is zero",
            ));
        }
        if self.noise.min_messages_per_interval > self.noise.max_messages_per_interval {
            return Err(Error::invalid_argument(
                "noise.min_messages_per_interval exceeds maximum",
            ));
        }
        if self.noise.min_message_size > self.noise.max_message_size {
            return Err(Error::invalid_argument(
                "noise.min_message_size exceeds maximum",
            ));
        }
        if self.noise.enabled && self.noise.time_interval.is_zero() {
            return Err(Error::invalid_argument("noise.time_interval is zero"));
        }
        if self.general.max_handshake_duration.is_zero() {
            return Err(Error::invalid_argument(
                "general.max_handshake_duration is zero",
            ));
        }
        if self.general.ip_connection_attempts.interval.is_zero() {
            return Err(Error::invalid_argument(
                "general.ip_connection_attempts.interval is zero",
            ));
        }
        if self.general.ip_reputation_improvement_interval.is_zero() {
            return Err(Error::invalid_argument(
                "general.ip_reputation_improvement_interval is zero",
            ));
        }
        if self.supported_algorithms.hashes.is_empty()
            || self.supported_algorithms.primary_asymmetric.is_empty()
            || self.supported_algorithms.secondary_asymmetric.is_empty()
            || self.supported_algorithms.symmetric.is_empty()
            || self.supported_algorithms.compression.is_empty()
        {
            return Err(Error::invalid_argument(
                "supported_algorithms has an empty slot",
            ));
        }
        Ok(())
    }

    /// Serialize to JSON
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] if serialization fails.
    pub fn save(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Failed(e.to_string().into()))
    }

    /// Deserialize from JSON and validate
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for malformed JSON or a tree that
    /// fails validation.
    pub fn load(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(e.to_string().into()))?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut cfg = Settings::default();
        cfg.require_authentication = true;
        cfg.global_shared_secret = Some(b"group secret".to_vec());
        cfg.num_pregenerated_keys_per_algorithm = 10;
        cfg.listeners.tcp.enable = true;
        cfg.listeners.tcp.ports = vec![999, 9999];
        cfg.relays.enable = true;
        cfg.relays
            .ipv4_excluded_networks_cidr
            .push("192.168.0.0/16".parse().unwrap());
        cfg.relays
            .ipv6_excluded_networks_cidr
            .push("fc00::/7".parse().unwrap());
        cfg.noise.enabled = true;
        cfg.noise.max_messages_per_interval = 50;
        cfg.udp.max_num_decoy_messages = 8;

        let json = cfg.save().unwrap();
        let loaded = Settings::load(&json).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(Settings::load("{ not json").is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_ranges() {
        let mut cfg = Settings::default();
        cfg.message.min_random_data_prefix_size = 100;
        cfg.message.max_random_data_prefix_size = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = Settings::default();
        cfg.key_update.min_interval = Duration::from_secs(100);
        cfg.key_update.max_interval = Duration::from_secs(10);
        assert!(cfg.validate().is_err());

        let mut cfg = Settings::default();
        cfg.noise.min_message_size = 10;
        cfg.noise.max_message_size = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_prefix() {
        let mut cfg = Settings::default();
        cfg.message.max_random_data_prefix_size = 300;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_algorithm_slot() {
        let mut cfg = Settings::default();
        cfg.supported_algorithms.symmetric.clear();
        assert!(cfg.validate().is_err());
    }
}
