//! Error types for core operations.
//!
//! Every operation returns either success-with-value or one of these kinds
//! plus a human-readable description. The kinds map one-to-one onto the
//! result codes surfaced to applications.

use std::borrow::Cow;
use thiserror::Error;

/// Why a peer connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local or remote requested shutdown
    Shutdown,
    /// An operation or the handshake timed out
    Timeout,
    /// Cryptographic or identity verification failure
    AuthFailure,
    /// Rekey did not complete within its deadline
    RekeyTimeout,
    /// Repeated protocol violations
    ProtocolViolation,
    /// The underlying transport failed
    TransportError,
    /// A relay this peer depended on went away
    RelayDown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Shutdown => "shutdown",
            Self::Timeout => "timeout",
            Self::AuthFailure => "authentication failure",
            Self::RekeyTimeout => "rekey timeout",
            Self::ProtocolViolation => "protocol violation",
            Self::TransportError => "transport error",
            Self::RelayDown => "relay down",
        };
        write!(f, "{s}")
    }
}

/// Errors surfaced by core operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Generic failure
    #[error("operation failed: {0}")]
    Failed(Cow<'static, str>),

    /// Operation timed out
    #[error("operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Identity or signature verification failed
    #[error("authentication failed")]
    AuthFailure,

    /// No common algorithm during Hello negotiation
    #[error("algorithm mismatch")]
    AlgorithmMismatch,

    /// Access control refused the address
    #[error("access denied")]
    AccessDenied,

    /// Address not present in the queried table
    #[error("address not found")]
    AddressNotFound,

    /// No peer with the given LUID
    #[error("peer not found")]
    PeerNotFound,

    /// The local instance is not running
    #[error("not running")]
    NotRunning,

    /// Malformed argument or configuration
    #[error("invalid argument: {0}")]
    InvalidArgument(Cow<'static, str>),

    /// Relay request would loop back into an already used hop
    #[error("relay loop detected")]
    RelayLoop,

    /// Relay endpoint lies inside an excluded network
    #[error("relay endpoint excluded")]
    RelayExcluded,

    /// A capacity limit (subnet cap, queue cap, pool) is exhausted
    #[error("no more slots")]
    NoMoreSlots,

    /// The peer connection was closed
    #[error("disconnected: {0}")]
    Disconnected(DisconnectReason),
}

impl Error {
    /// Generic failure with static context (zero allocation)
    #[must_use]
    pub const fn failed(context: &'static str) -> Self {
        Error::Failed(Cow::Borrowed(context))
    }

    /// Timeout with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        Error::Timeout(Cow::Borrowed(context))
    }

    /// Invalid argument with static context (zero allocation)
    #[must_use]
    pub const fn invalid_argument(context: &'static str) -> Self {
        Error::InvalidArgument(Cow::Borrowed(context))
    }

    /// True if retrying later may succeed without intervention
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::NoMoreSlots | Error::NotRunning
        )
    }

    /// True if the failure will repeat without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::AuthFailure
                | Error::AlgorithmMismatch
                | Error::AccessDenied
                | Error::InvalidArgument(_)
                | Error::RelayLoop
                | Error::RelayExcluded
        )
    }
}

impl From<aegis_crypto::CryptoError> for Error {
    fn from(err: aegis_crypto::CryptoError) -> Self {
        match err {
            aegis_crypto::CryptoError::NoCommonAlgorithm(_) => Error::AlgorithmMismatch,
            aegis_crypto::CryptoError::SignatureInvalid
            | aegis_crypto::CryptoError::DecryptionFailed => Error::AuthFailure,
            other => Error::Failed(Cow::Owned(other.to_string())),
        }
    }
}

impl From<aegis_transport::TransportError> for Error {
    fn from(err: aegis_transport::TransportError) -> Self {
        match err {
            aegis_transport::TransportError::Closed => {
                Error::Disconnected(DisconnectReason::TransportError)
            }
            other => Error::Failed(Cow::Owned(other.to_string())),
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::timeout("connect").is_transient());
        assert!(Error::NoMoreSlots.is_transient());
        assert!(Error::AuthFailure.is_permanent());
        assert!(Error::RelayLoop.is_permanent());
        assert!(!Error::AuthFailure.is_transient());
        assert!(!Error::timeout("connect").is_permanent());
    }

    #[test]
    fn test_crypto_error_mapping() {
        let err: Error = aegis_crypto::CryptoError::NoCommonAlgorithm("hash").into();
        assert_eq!(err, Error::AlgorithmMismatch);

        let err: Error = aegis_crypto::CryptoError::SignatureInvalid.into();
        assert_eq!(err, Error::AuthFailure);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Disconnected(DisconnectReason::RekeyTimeout).to_string(),
            "disconnected: rekey timeout"
        );
        assert!(Error::timeout("handshake").to_string().contains("handshake"));
    }
}
