//! The pending-request table: one entry per in-flight `Request`/`Publish`
//! call, keyed by message id, tracking the caller's deadline, expected
//! reply multiplicity, and per-peer response ordering.

use dashmap::DashMap;
use fabric_kernel::bus::BusMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

/// Whether a pending request expects exactly one terminal response
/// (`Request`) or a stream of zero-or-more responses (`Publish`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    Single,
    Stream,
}

/// One in-flight call's bookkeeping.
pub struct PendingRequest {
    pub sender: mpsc::Sender<BusMessage>,
    pub deadline: Instant,
    pub multiplicity: Multiplicity,
    /// Last-accepted sequence number per responding peer, used to drop
    /// late, lower-sequence frames from the same peer.
    last_seq_by_peer: DashMap<String, u64>,
    /// Peers that have sent at least one `ack` frame.
    acknowledged_peers: DashMap<String, ()>,
    /// Peers that have delivered a terminal `res`/`err` frame.
    completed_peers: DashMap<String, ()>,
}

impl PendingRequest {
    fn new(sender: mpsc::Sender<BusMessage>, deadline: Instant, multiplicity: Multiplicity) -> Self {
        Self {
            sender,
            deadline,
            multiplicity,
            last_seq_by_peer: DashMap::new(),
            acknowledged_peers: DashMap::new(),
            completed_peers: DashMap::new(),
        }
    }

    /// Record that `peer` acknowledged the request. Returns whether this is
    /// the peer's first ack.
    pub fn acknowledge(&self, peer: &str) -> bool {
        self.acknowledged_peers.insert(peer.to_string(), ()).is_none()
    }

    pub fn acknowledged_peer_count(&self) -> usize {
        self.acknowledged_peers.len()
    }

    pub fn is_acknowledged(&self, peer: &str) -> bool {
        self.acknowledged_peers.contains_key(peer)
    }

    /// Record that `peer` delivered its terminal `res`/`err` frame.
    pub fn mark_completed(&self, peer: &str) {
        self.completed_peers.insert(peer.to_string(), ());
    }

    /// Whether every peer that has acknowledged so far has also delivered
    /// its terminal frame. `false` while no peer has acked yet, since the
    /// expected peer set is unknown until the first ack arrives.
    pub fn all_acknowledged_peers_completed(&self) -> bool {
        !self.acknowledged_peers.is_empty()
            && self
                .acknowledged_peers
                .iter()
                .all(|entry| self.completed_peers.contains_key(entry.key()))
    }

    /// Accept or reject an inbound response frame from `peer` with
    /// sequence `seq`, enforcing per-peer send order. Returns `true` if the
    /// frame should be delivered, `false` if it is a stale duplicate that
    /// must be dropped (the caller should log a warning with the subject).
    pub fn accept_sequence(&self, peer: &str, seq: u64) -> bool {
        match self.last_seq_by_peer.get(peer) {
            Some(last) if seq <= *last => false,
            _ => {
                self.last_seq_by_peer.insert(peer.to_string(), seq);
                true
            }
        }
    }
}

/// The process-wide table of in-flight requests, keyed by message id.
///
/// A sharded concurrent map (`DashMap`) stands in for the fine-grained lock
/// the design calls for, avoiding a single process-wide mutex on the hot
/// publish/reply path.
#[derive(Default)]
pub struct PendingRequestMap {
    entries: DashMap<String, Arc<PendingRequest>>,
    next_seq: AtomicU64,
}

impl PendingRequestMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request, returning the receiving half of its
    /// bounded response channel.
    pub fn register(
        &self,
        message_id: impl Into<String>,
        multiplicity: Multiplicity,
        deadline: Instant,
        buffer: usize,
    ) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(buffer);
        let entry = Arc::new(PendingRequest::new(tx, deadline, multiplicity));
        self.entries.insert(message_id.into(), entry);
        rx
    }

    pub fn get(&self, message_id: &str) -> Option<Arc<PendingRequest>> {
        self.entries.get(message_id).map(|e| e.clone())
    }

    /// Unregister and return the entry, e.g. on cancellation, deadline, or
    /// terminal response.
    pub fn unregister(&self, message_id: &str) -> Option<Arc<PendingRequest>> {
        self.entries.remove(message_id).map(|(_, v)| v)
    }

    /// Deliver `message` to its pending request, dropping it (with a
    /// warning) if the request is unknown, its channel is full, or the
    /// frame is a stale duplicate from a peer that already sent a newer one.
    pub fn deliver(&self, message_id: &str, peer: &str, message: BusMessage) {
        let Some(pending) = self.get(message_id) else {
            warn!(message_id, "response for unknown or expired pending request");
            return;
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if !pending.accept_sequence(peer, seq) {
            warn!(message_id, peer, "dropping out-of-order response frame");
            return;
        }
        if pending.sender.try_send(message).is_err() {
            warn!(message_id, "pending request channel is full or closed; dropping response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_kernel::Frame;

    fn sample_message() -> BusMessage {
        BusMessage {
            subject: "svc.443.GET.ping".into(),
            payload: vec![],
            headers: Frame::new(),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn register_and_deliver_round_trips() {
        let map = PendingRequestMap::new();
        let mut rx = map.register("m1", Multiplicity::Single, Instant::now(), 4);
        map.deliver("m1", "peer-a", sample_message());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unknown_message_id_is_dropped_silently() {
        let map = PendingRequestMap::new();
        // No panic, no entry created.
        map.deliver("missing", "peer-a", sample_message());
        assert!(map.get("missing").is_none());
    }

    #[test]
    fn acknowledge_reports_first_ack_only() {
        let pending = PendingRequest::new(mpsc::channel(1).0, Instant::now(), Multiplicity::Single);
        assert!(pending.acknowledge("peer-a"));
        assert!(!pending.acknowledge("peer-a"));
        assert_eq!(pending.acknowledged_peer_count(), 1);
    }

    #[test]
    fn all_acknowledged_peers_completed_waits_for_every_acker() {
        let pending = PendingRequest::new(mpsc::channel(1).0, Instant::now(), Multiplicity::Stream);
        assert!(!pending.all_acknowledged_peers_completed());

        pending.acknowledge("peer-a");
        pending.acknowledge("peer-b");
        assert!(!pending.all_acknowledged_peers_completed());

        pending.mark_completed("peer-a");
        assert!(!pending.all_acknowledged_peers_completed());

        pending.mark_completed("peer-b");
        assert!(pending.all_acknowledged_peers_completed());
    }

    #[test]
    fn accept_sequence_drops_stale_duplicates() {
        let pending = PendingRequest::new(mpsc::channel(1).0, Instant::now(), Multiplicity::Stream);
        assert!(pending.accept_sequence("peer-a", 5));
        assert!(!pending.accept_sequence("peer-a", 3));
        assert!(pending.accept_sequence("peer-a", 6));
    }

    #[test]
    fn unregister_removes_the_entry() {
        let map = PendingRequestMap::new();
        let _rx = map.register("m1", Multiplicity::Single, Instant::now(), 1);
        assert!(map.unregister("m1").is_some());
        assert!(map.get("m1").is_none());
    }
}
