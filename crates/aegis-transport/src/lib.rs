//! # AEGIS Transport
//!
//! Transport abstraction for the AEGIS peer-to-peer framework.
//!
//! This crate provides:
//! - The [`Endpoint`] and [`Address`] model covering TCP, UDP and Bluetooth
//!   RFCOMM peers
//! - The [`Transport`] and [`TransportListener`] traits the peer pipeline is
//!   written against
//! - An in-memory duplex transport used by the test suites
//!
//! Concrete OS socket backends live outside this workspace; anything that can
//! move framed bytes between two endpoints can implement [`Transport`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod endpoint;
pub mod memory;
pub mod transport;

pub use endpoint::{Address, Endpoint, IpProtocol};
pub use memory::{MemoryConnector, MemoryDialer, MemoryListener, MemoryNetwork, MemoryTransport};
pub use transport::{Connector, Transport, TransportError, TransportListener, TransportResult};
