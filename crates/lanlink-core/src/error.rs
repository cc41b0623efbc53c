//! Error types for Lanlink.
//!
//! This module provides a unified error type for all Lanlink operations,
//! with specific error variants for different failure modes. Delivery
//! timeouts are deliberately absent: an unacknowledged send is retried
//! forever by the background retry loop and never surfaces as an error.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Lanlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Lanlink.
#[derive(Error, Debug)]
pub enum Error {
    /// Target peer is unknown or was evicted for inactivity
    #[error("peer '{0}' not found")]
    PeerNotFound(String),

    /// Local file to send does not exist or is not a regular file
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Malformed inbound frame or undecodable chunk payload
    #[error("failed to decode frame: {0}")]
    Decode(String),

    /// Assembled file hash disagrees with the hash declared by the sender
    #[error("integrity mismatch: expected {expected}, computed {computed}")]
    IntegrityMismatch {
        /// Digest carried in the END message
        expected: String,
        /// Digest computed over the assembled bytes
        computed: String,
    },

    /// An outbound transfer is already active (single-slot policy)
    #[error("an outbound file transfer is already in progress")]
    TransferInProgress,

    /// No completed inbound transfer with the given identifier
    #[error("transfer '{0}' not found or has no received data")]
    TransferNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
