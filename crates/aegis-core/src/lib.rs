//! # AEGIS Core
//!
//! Core protocol implementation for the AEGIS peer-to-peer framework.
//!
//! This crate provides:
//! - **Local instance**: lifecycle, configuration, orchestration ([`Local`])
//! - **Peer state machine and handshake**: identity negotiation, algorithm
//!   selection, key agreement with optional post-quantum KEMs
//! - **Framing pipeline**: AEAD-sealed frames with compression, random
//!   prefixes and padding
//! - **Rekey state machine**: periodic and volume-triggered key updates
//! - **Relay engine**: source-routed multi-hop forwarding
//! - **Access manager**: address filters, reputation, subnet caps
//! - **Noise generator**: traffic-analysis-resistant dummy traffic
//! - **Public endpoint discovery**: reported endpoints with data and hop
//!   verification
//!
//! ## Quick Start
//!
//! ```no_run
//! use aegis_core::{Local, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let local = Local::new(Settings::default())?;
//!     local.startup().await?;
//!
//!     // Register extenders, add listeners, connect to peers ...
//!
//!     local.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    Local (orchestration)                   │
//! │  listeners · connector · extenders · public endpoints      │
//! ├────────────────────────────────────────────────────────────┤
//! │   AccessManager   │   KeyManager    │     RelayManager     │
//! ├────────────────────────────────────────────────────────────┤
//! │             Peer pipeline (one task per peer)              │
//! │   handshake · key state · rekey · noise · dispatch         │
//! ├────────────────────────────────────────────────────────────┤
//! │                  Frames (sealed records)                   │
//! └────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod access;
pub mod compress;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod extender;
pub mod frame;
pub mod keymgr;
pub mod listener;
pub mod local;
pub mod noise;
pub mod peer;
pub mod rate_limit;
pub mod relay;
pub mod stats;
pub mod uuid;

pub use access::{AccessManager, AccessType, CheckType, ReputationUpdate};
pub use config::Settings;
pub use error::{DisconnectReason, Error, Result};
pub use extender::{Extender, PeerEvent, PeerEventKind};
pub use frame::{Frame, FrameType};
pub use local::{Local, MAX_MESSAGE_SIZE, PeerDetails, PeerSender};
pub use peer::{PeerDirection, PeerLuid, PeerStatus, SendPriority};
pub use uuid::{Uuid, UuidType};

/// Protocol version offered in the Hello exchange
pub const PROTOCOL_VERSION: u32 = 1;
