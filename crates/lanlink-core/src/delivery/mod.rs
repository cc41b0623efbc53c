//! Pending-delivery tracking for at-least-once message delivery.
//!
//! Every reliable send registers a [`PendingDelivery`] holding the exact
//! wire bytes last sent. The device's retry loop calls
//! [`DeliveryTracker::take_due`] on a fixed tick and retransmits whatever
//! comes back, verbatim, to the original destination. A delivery lives
//! until the first matching acknowledgment; there is no retry cap and no
//! backoff, so an unreachable peer produces an unbounded background retry
//! by design.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::RETRY_TIMEOUT;

/// A message sent but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    /// Exact wire bytes last sent
    pub payload: Vec<u8>,
    /// Destination address
    pub dest: SocketAddr,
    /// When the payload was last put on the wire
    pub last_sent: Instant,
}

/// All deliveries currently awaiting acknowledgment, keyed by delivery
/// identifier.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    pending: HashMap<String, PendingDelivery>,
}

impl DeliveryTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delivery that was just sent.
    pub fn register(&mut self, id: &str, payload: Vec<u8>, dest: SocketAddr, now: Instant) {
        self.pending.insert(
            id.to_string(),
            PendingDelivery {
                payload,
                dest,
                last_sent: now,
            },
        );
    }

    /// Complete a delivery. Returns `true` when the identifier was
    /// pending; acknowledgments for unknown identifiers (duplicate or late
    /// ACKs) return `false` and are not an error.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Drop a delivery without completing it (transfer abandoned).
    pub fn discard(&mut self, id: &str) {
        self.pending.remove(id);
    }

    /// Collect every delivery whose last send is older than
    /// [`RETRY_TIMEOUT`], refreshing its timestamp to `now`. The caller
    /// retransmits the returned payloads; refreshing here keeps exactly
    /// one retransmission in flight per identifier per timeout window.
    pub fn take_due(&mut self, now: Instant) -> Vec<(String, Vec<u8>, SocketAddr)> {
        let mut due = Vec::new();
        for (id, delivery) in &mut self.pending {
            if now.saturating_duration_since(delivery.last_sent) > RETRY_TIMEOUT {
                delivery.last_sent = now;
                due.push((id.clone(), delivery.payload.clone(), delivery.dest));
            }
        }
        due
    }

    /// Whether the identifier is still awaiting acknowledgment.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of deliveries awaiting acknowledgment.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is awaiting acknowledgment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn dest() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5002)
    }

    #[test]
    fn test_acknowledge_removes_pending() {
        let mut tracker = DeliveryTracker::new();
        tracker.register("m-1", b"TALK m-1 hi".to_vec(), dest(), Instant::now());

        assert!(tracker.is_pending("m-1"));
        assert!(tracker.acknowledge("m-1"));
        assert!(!tracker.is_pending("m-1"));
    }

    #[test]
    fn test_unknown_ack_is_ignored() {
        let mut tracker = DeliveryTracker::new();
        assert!(!tracker.acknowledge("never-sent"));

        tracker.register("m-1", b"TALK m-1 hi".to_vec(), dest(), Instant::now());
        assert!(tracker.acknowledge("m-1"));
        // Duplicate ACK after completion.
        assert!(!tracker.acknowledge("m-1"));
    }

    #[test]
    fn test_take_due_respects_timeout() {
        let mut tracker = DeliveryTracker::new();
        let t0 = Instant::now();
        tracker.register("m-1", b"TALK m-1 hi".to_vec(), dest(), t0);

        assert!(tracker.take_due(t0 + Duration::from_millis(1900)).is_empty());

        let due = tracker.take_due(t0 + Duration::from_millis(2100));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "m-1");
        assert_eq!(due[0].1, b"TALK m-1 hi".to_vec());
    }

    #[test]
    fn test_take_due_refreshes_timestamp() {
        let mut tracker = DeliveryTracker::new();
        let t0 = Instant::now();
        tracker.register("m-1", b"payload".to_vec(), dest(), t0);

        let t1 = t0 + Duration::from_millis(2100);
        assert_eq!(tracker.take_due(t1).len(), 1);
        // Just refreshed, so not due again on the next tick.
        assert!(tracker.take_due(t1 + Duration::from_millis(100)).is_empty());
        // Due again a full timeout later.
        assert_eq!(tracker.take_due(t1 + Duration::from_millis(2100)).len(), 1);
    }
}
