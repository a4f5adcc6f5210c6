//! Transport trait abstraction.
//!
//! The peer pipeline is written against these traits so TCP, UDP (with its
//! own reliability layer) and Bluetooth RFCOMM backends are interchangeable.
//! Implementations deliver whole outbound buffers or fail; framing above this
//! layer never depends on datagram boundaries.

use crate::endpoint::Endpoint;
use async_trait::async_trait;
use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("transport is closed")]
    Closed,

    /// Peer endpoint unreachable or refused
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Outbound buffer full and the caller asked not to wait
    #[error("transport would block")]
    WouldBlock,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A connected, bidirectional transport to one remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a complete buffer to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport was shut down,
    /// or an I/O error from the backend.
    async fn send(&self, buf: &[u8]) -> TransportResult<()>;

    /// Receive bytes from the peer into `buf`, returning the count.
    ///
    /// Returns `Ok(0)` when the peer has closed its sending side.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport was shut down,
    /// or an I/O error from the backend.
    async fn recv(&self, buf: &mut [u8]) -> TransportResult<usize>;

    /// The local endpoint of this transport
    fn local_endpoint(&self) -> Endpoint;

    /// The remote endpoint of this transport
    fn peer_endpoint(&self) -> Endpoint;

    /// Whether this transport supports the suspend/resume cycle.
    ///
    /// UDP-backed transports report true; inactivity then suspends the peer
    /// instead of closing it.
    fn is_suspendable(&self) -> bool {
        false
    }

    /// Close the transport; subsequent operations return [`TransportError::Closed`].
    async fn close(&self);

    /// Whether the transport has been closed
    fn is_closed(&self) -> bool;
}

/// An outbound dialer producing connected transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] when the endpoint is
    /// unreachable or refuses.
    async fn connect(&self, endpoint: Endpoint) -> TransportResult<Box<dyn Transport>>;
}

/// An inbound listener producing connected transports.
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Wait for the next inbound connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the listener was shut down.
    async fn accept(&self) -> TransportResult<Box<dyn Transport>>;

    /// The endpoint this listener is bound to
    fn local_endpoint(&self) -> Endpoint;

    /// Stop accepting; pending and future `accept` calls return
    /// [`TransportError::Closed`].
    async fn close(&self);
}
