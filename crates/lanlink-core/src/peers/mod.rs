//! Known-peer directory with liveness eviction.
//!
//! Peers announce themselves with periodic heartbeats; the directory keeps
//! at most one record per peer name, overwritten in place on every
//! heartbeat. A peer whose last heartbeat is older than
//! [`LIVENESS_THRESHOLD`](crate::LIVENESS_THRESHOLD) is evicted the next
//! time the directory is listed.
//!
//! All methods take an explicit `now` so eviction is deterministic under
//! test.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::LIVENESS_THRESHOLD;

/// One known peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Peer name as announced in its heartbeat
    pub name: String,
    /// Address the last heartbeat arrived from
    pub addr: SocketAddr,
    /// When the last heartbeat arrived
    pub last_heartbeat: Instant,
}

impl PeerRecord {
    /// Time since this peer's last heartbeat.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

/// Mapping from peer name to [`PeerRecord`].
#[derive(Debug, Default)]
pub struct PeerDirectory {
    records: HashMap<String, PeerRecord>,
}

impl PeerDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for `name`.
    ///
    /// Returns `true` when the peer was not previously known (callers use
    /// this to announce newly discovered peers).
    pub fn record_heartbeat(&mut self, name: &str, addr: SocketAddr, now: Instant) -> bool {
        self.records
            .insert(
                name.to_string(),
                PeerRecord {
                    name: name.to_string(),
                    addr,
                    last_heartbeat: now,
                },
            )
            .is_none()
    }

    /// Return all live records, evicting every record older than the
    /// liveness threshold as a side effect. Ordering is unspecified.
    pub fn list_active(&mut self, now: Instant) -> Vec<PeerRecord> {
        self.records
            .retain(|_, record| record.age(now) <= LIVENESS_THRESHOLD);
        self.records.values().cloned().collect()
    }

    /// Look up the address of a peer. `None` is a normal outcome: the
    /// target is unknown or was already evicted.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<SocketAddr> {
        self.records.get(name).map(|record| record.addr)
    }

    /// Number of known peers, live or not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
