//! Text wire protocol for Lanlink.
//!
//! Every datagram carries one UTF-8 text frame: a leading keyword followed
//! by space-delimited fields. Seven frame kinds exist:
//!
//! | Frame | Format |
//! |-------|--------|
//! | Heartbeat | `HEARTBEAT <name>` |
//! | Talk | `TALK <id> <text...>` |
//! | Ack | `ACK <id>` |
//! | Nack | `NACK <id> <reason...>` |
//! | File offer | `FILE <id> <filename> <size>` |
//! | Chunk | `CHUNK <id> <seq> <base64-payload>` |
//! | End | `END <id> <hex-digest>` |
//!
//! Encoding is stateless and infallible. Decoding returns an error for
//! unknown keywords and malformed frames; the receive loop logs and drops
//! those, which is the resilience boundary against foreign or corrupted
//! traffic on a shared port.

use crate::error::{Error, Result};

/// Largest datagram the receive loop accepts. A chunk frame is bounded by
/// the keyword, two identifiers, and 512 payload bytes in base64.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Suffix appended to a transfer identifier to form the delivery
/// identifier of its END message.
pub const END_SUFFIX: &str = "_END";

/// Delivery identifier used for the END message of a transfer.
#[must_use]
pub fn end_delivery_id(transfer_id: &str) -> String {
    format!("{transfer_id}{END_SUFFIX}")
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Periodic liveness announcement
    Heartbeat {
        /// Announcing device's name
        name: String,
    },
    /// A text message requiring acknowledgment
    Talk {
        /// Delivery identifier
        id: String,
        /// Message body (may contain spaces)
        text: String,
    },
    /// Positive acknowledgment of a delivery identifier
    Ack {
        /// Acknowledged delivery identifier
        id: String,
    },
    /// Negative acknowledgment with a reason
    Nack {
        /// Rejected delivery identifier
        id: String,
        /// Reason code or free text
        reason: String,
    },
    /// Announcement of an incoming file transfer
    FileOffer {
        /// Transfer identifier
        id: String,
        /// Declared file name (no spaces)
        filename: String,
        /// Declared file size in bytes
        size: u64,
    },
    /// One file chunk
    Chunk {
        /// Transfer identifier
        id: String,
        /// Zero-based chunk sequence number
        seq: u64,
        /// Base64-encoded chunk bytes
        payload: String,
    },
    /// End of transfer carrying the whole-file digest
    End {
        /// Transfer identifier
        id: String,
        /// Lowercase hex SHA-256 of the complete file
        digest: String,
    },
}

impl Frame {
    /// Encode the frame to its wire text.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Heartbeat { name } => format!("HEARTBEAT {name}"),
            Self::Talk { id, text } => format!("TALK {id} {text}"),
            Self::Ack { id } => format!("ACK {id}"),
            Self::Nack { id, reason } => format!("NACK {id} {reason}"),
            Self::FileOffer { id, filename, size } => format!("FILE {id} {filename} {size}"),
            Self::Chunk { id, seq, payload } => format!("CHUNK {id} {seq} {payload}"),
            Self::End { id, digest } => format!("END {id} {digest}"),
        }
    }

    /// Decode a frame from wire text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] for unknown keywords, missing fields, and
    /// unparseable numeric fields. Callers are expected to drop such
    /// frames silently.
    pub fn decode(input: &str) -> Result<Self> {
        let mut parts = input.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| Error::Decode("empty frame".to_string()))?;

        match keyword {
            "HEARTBEAT" => {
                let name = required(parts.next(), "HEARTBEAT name")?;
                Ok(Self::Heartbeat { name })
            }
            "TALK" => {
                let id = required(parts.next(), "TALK id")?;
                let text = rest(parts);
                Ok(Self::Talk { id, text })
            }
            "ACK" => {
                let id = required(parts.next(), "ACK id")?;
                Ok(Self::Ack { id })
            }
            "NACK" => {
                let id = required(parts.next(), "NACK id")?;
                let reason = rest(parts);
                Ok(Self::Nack { id, reason })
            }
            "FILE" => {
                let id = required(parts.next(), "FILE id")?;
                let filename = required(parts.next(), "FILE filename")?;
                let size = required(parts.next(), "FILE size")?
                    .parse::<u64>()
                    .map_err(|e| Error::Decode(format!("FILE size: {e}")))?;
                Ok(Self::FileOffer { id, filename, size })
            }
            "CHUNK" => {
                let id = required(parts.next(), "CHUNK id")?;
                let seq = required(parts.next(), "CHUNK seq")?
                    .parse::<u64>()
                    .map_err(|e| Error::Decode(format!("CHUNK seq: {e}")))?;
                let payload = required(parts.next(), "CHUNK payload")?;
                Ok(Self::Chunk { id, seq, payload })
            }
            "END" => {
                let id = required(parts.next(), "END id")?;
                let digest = required(parts.next(), "END digest")?;
                Ok(Self::End { id, digest })
            }
            other => Err(Error::Decode(format!("unknown keyword '{other}'"))),
        }
    }
}

fn required(part: Option<&str>, what: &str) -> Result<String> {
    part.map(ToString::to_string)
        .ok_or_else(|| Error::Decode(format!("missing field: {what}")))
}

fn rest<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts.collect::<Vec<_>>().join(" ")
}
