//! File transfer state and integrity checking.
//!
//! A transfer moves a file in fixed 512-byte chunks, each base64-encoded
//! into a `CHUNK` frame and individually acknowledged. The sender finishes
//! with an `END` frame carrying the SHA-256 of the whole file; the
//! receiver reassembles its stored chunks, digests them, and answers with
//! a final ACK or a NACK.
//!
//! This module holds the per-direction state records and the pure pieces
//! (chunk math, digests, payload encoding); the driving logic lives in
//! [`device`](crate::device).

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};
use crate::protocol::end_delivery_id;
use crate::{CHUNK_SIZE, RETRY_TIMEOUT};

/// Number of chunks a file of `size` bytes splits into.
#[must_use]
pub fn total_chunks(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Lowercase hex SHA-256 of a byte slice.
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Lowercase hex SHA-256 of a file, read start to end.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn file_digest(path: &std::path::Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Encode chunk bytes for the wire.
#[must_use]
pub fn encode_chunk_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a chunk payload from the wire.
///
/// # Errors
///
/// Returns [`Error::Decode`] when the payload is not valid base64.
pub fn decode_chunk_payload(payload: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(payload)
        .map_err(|e| Error::Decode(format!("chunk payload: {e}")))
}

/// A chunk sent but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    /// Exact wire bytes of the `CHUNK` frame last sent
    pub payload: Vec<u8>,
    /// When the frame was last put on the wire
    pub last_sent: Instant,
}

/// State of the single outbound transfer slot.
#[derive(Debug)]
pub struct OutboundTransfer {
    /// Transfer identifier (doubles as the offer's delivery identifier)
    pub id: String,
    /// Source file path
    pub path: PathBuf,
    /// Total file size in bytes
    pub size: u64,
    /// Destination peer name
    pub peer: String,
    /// Destination address resolved at send time
    pub dest: SocketAddr,
    /// Chunks awaiting acknowledgment, keyed by sequence number
    pub pending_chunks: HashMap<u64, PendingChunk>,
    /// Whether the initial offer has been acknowledged
    pub acknowledged: bool,
    /// Total chunk count for the file
    pub total_chunks: u64,
}

impl OutboundTransfer {
    /// Create the state for a fresh offer.
    #[must_use]
    pub fn new(id: String, path: PathBuf, size: u64, peer: String, dest: SocketAddr) -> Self {
        let total = total_chunks(size);
        Self {
            id,
            path,
            size,
            peer,
            dest,
            pending_chunks: HashMap::new(),
            acknowledged: false,
            total_chunks: total,
        }
    }

    /// Delivery identifier of this transfer's END message.
    #[must_use]
    pub fn end_id(&self) -> String {
        end_delivery_id(&self.id)
    }

    /// Record a chunk that was just sent.
    pub fn register_chunk(&mut self, seq: u64, payload: Vec<u8>, now: Instant) {
        self.pending_chunks
            .insert(seq, PendingChunk { payload, last_sent: now });
    }

    /// Complete the oldest pending chunk. Chunk ACKs carry only the
    /// transfer identifier, and stop-and-wait keeps the in-flight window
    /// at one, so the lowest pending sequence is the acknowledged one.
    ///
    /// A duplicate ACK (the receiver re-acknowledges a retransmitted
    /// chunk) that lands after the next chunk is registered pops that
    /// chunk early; if its datagram is then lost, nothing re-sends it and
    /// the transfer fails at the final digest check instead.
    pub fn ack_oldest_chunk(&mut self) -> Option<u64> {
        let seq = self.pending_chunks.keys().min().copied()?;
        self.pending_chunks.remove(&seq);
        Some(seq)
    }

    /// Whether the chunk is still awaiting acknowledgment.
    #[must_use]
    pub fn is_chunk_pending(&self, seq: u64) -> bool {
        self.pending_chunks.contains_key(&seq)
    }

    /// Collect every pending chunk older than the retry timeout,
    /// refreshing its timestamp to `now`.
    pub fn take_due_chunks(&mut self, now: Instant) -> Vec<(u64, Vec<u8>)> {
        let mut due = Vec::new();
        for (seq, chunk) in &mut self.pending_chunks {
            if now.saturating_duration_since(chunk.last_sent) > RETRY_TIMEOUT {
                chunk.last_sent = now;
                due.push((*seq, chunk.payload.clone()));
            }
        }
        due
    }
}

/// Outcome of storing an inbound chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// First arrival; payload stored and acknowledged
    Stored,
    /// Sequence already held; payload ignored but acknowledged again
    Duplicate,
    /// Sequence is at or past the declared chunk count; dropped entirely
    OutOfRange,
}

/// Receiving-side status of an inbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundStatus {
    /// Chunks may still arrive
    Receiving,
    /// END verified; assembled bytes saved
    Complete,
    /// END digest mismatched; partial assembly discarded
    Rejected,
}

/// State of one inbound transfer, keyed by transfer identifier on the
/// device. Never evicted automatically: a sender that disappears
/// mid-transfer leaves its record behind for the life of the process.
#[derive(Debug)]
pub struct InboundTransfer {
    /// Transfer identifier
    pub id: String,
    /// File name declared in the offer
    pub filename: String,
    /// File size declared in the offer
    pub size: u64,
    /// Expected chunk count derived from the declared size
    pub total_chunks: u64,
    /// Received chunk payloads; immutable once stored
    chunks: BTreeMap<u64, Vec<u8>>,
    /// Current status
    pub status: InboundStatus,
}

impl InboundTransfer {
    /// Create the state for a fresh offer.
    #[must_use]
    pub fn new(id: String, filename: String, size: u64) -> Self {
        let total = total_chunks(size);
        Self {
            id,
            filename,
            size,
            total_chunks: total,
            chunks: BTreeMap::new(),
            status: InboundStatus::Receiving,
        }
    }

    /// Store a decoded chunk. Duplicates are ignored, not overwritten;
    /// sequences past the declared count are rejected outright.
    pub fn store_chunk(&mut self, seq: u64, bytes: Vec<u8>) -> ChunkOutcome {
        if seq >= self.total_chunks {
            return ChunkOutcome::OutOfRange;
        }
        if self.chunks.contains_key(&seq) {
            return ChunkOutcome::Duplicate;
        }
        self.chunks.insert(seq, bytes);
        ChunkOutcome::Stored
    }

    /// Number of distinct chunks received so far.
    #[must_use]
    pub fn received_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate all stored chunks in ascending sequence order. Gaps
    /// from chunks that never arrived are skipped, not errors; the digest
    /// comparison catches the shortfall. Capacity comes from the bytes
    /// actually received, never from the peer-declared size.
    #[must_use]
    pub fn assemble(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.chunks.values().map(Vec::len).sum());
        for chunk in self.chunks.values() {
            bytes.extend_from_slice(chunk);
        }
        bytes
    }

    /// Assemble the stored chunks and check them against the digest
    /// declared in the `END` frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityMismatch`] when the computed digest
    /// differs from the declared one.
    pub fn verify(&self, declared: &str) -> Result<Vec<u8>> {
        let assembled = self.assemble();
        let computed = digest_bytes(&assembled);
        if computed == declared {
            Ok(assembled)
        } else {
            Err(Error::IntegrityMismatch {
                expected: declared.to_string(),
                computed,
            })
        }
    }

    /// Discard the partial assembly after an integrity failure.
    pub fn reject(&mut self) {
        self.chunks.clear();
        self.status = InboundStatus::Rejected;
    }
}
