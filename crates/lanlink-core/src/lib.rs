//! # Lanlink Core Library
//!
//! `lanlink-core` provides the core functionality for Lanlink, a reliable
//! messaging and file transfer system layered on top of plain UDP.
//!
//! UDP gives no delivery, ordering, or integrity guarantees; this crate
//! rebuilds the ones it needs at the application layer:
//!
//! - **Peer discovery**: periodic `HEARTBEAT` gossip with liveness eviction
//! - **Reliable messaging**: at-least-once delivery via ACK + timed
//!   retransmission
//! - **File transfer**: stop-and-wait chunked transfers with per-chunk
//!   acknowledgment and whole-file SHA-256 verification
//!
//! ## Modules
//!
//! - [`config`] - Device configuration
//! - [`delivery`] - Pending-delivery tracking for reliable sends
//! - [`device`] - The device orchestrator and its background loops
//! - [`peers`] - Known-peer directory with liveness eviction
//! - [`protocol`] - Text wire protocol (encode/decode)
//! - [`transfer`] - File transfer state and integrity checking
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanlink_core::config::DeviceConfig;
//! use lanlink_core::device::Device;
//!
//! let device = Device::bind(DeviceConfig::new("alice", 5001)).await?;
//! device.start();
//!
//! // Once a peer has been discovered via heartbeats:
//! device.send_message("bob", "hello over UDP").await?;
//! device.send_file("bob", "./report.pdf").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod delivery;
pub mod device;
pub mod error;
pub mod peers;
pub mod protocol;
pub mod transfer;

pub use error::{Error, Result};

use std::time::Duration;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port devices bind to when none is configured
pub const DEFAULT_PORT: u16 = 5000;

/// File chunk size in bytes (protocol constant)
pub const CHUNK_SIZE: usize = 512;

/// Interval between heartbeat rounds
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A peer with no heartbeat for longer than this is considered gone
pub const LIVENESS_THRESHOLD: Duration = Duration::from_secs(10);

/// Age after which an unacknowledged send is retransmitted
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(2);

/// Polling interval of the retry loop
pub const RETRY_TICK: Duration = Duration::from_millis(100);

/// How many `RETRY_TICK`-sized polls the chunk sender waits for an ACK
/// before retransmitting and moving on
pub const CHUNK_ACK_ATTEMPTS: u32 = 20;
