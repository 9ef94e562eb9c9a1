//! Cluster core counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, v: u64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters tracked by the cluster core.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Protocol messages received from peers.
    pub recv_msg_count: Counter,
    pub recv_msg_bytes: Counter,
    /// Protocol messages shipped to peers.
    pub send_msg_count: Counter,
    pub send_msg_bytes: Counter,
    /// Client proposes accepted by a local leader.
    pub propose_count: Counter,
    /// Committed entries handed to the applier.
    pub applied_count: Counter,
    /// Messages shed by a receive queue (full or over budget).
    pub queue_drop_count: Counter,
    /// Slot-leader election rounds run on this node.
    pub election_count: Counter,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub recv_msg_count: u64,
    pub recv_msg_bytes: u64,
    pub send_msg_count: u64,
    pub send_msg_bytes: u64,
    pub propose_count: u64,
    pub applied_count: u64,
    pub queue_drop_count: u64,
    pub election_count: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            recv_msg_count: self.recv_msg_count.get(),
            recv_msg_bytes: self.recv_msg_bytes.get(),
            send_msg_count: self.send_msg_count.get(),
            send_msg_bytes: self.send_msg_bytes.get(),
            propose_count: self.propose_count.get(),
            applied_count: self.applied_count.get(),
            queue_drop_count: self.queue_drop_count.get(),
            election_count: self.election_count.get(),
        }
    }
}

#[cfg(test)]
mod metrics_tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.propose_count.incr();
        m.propose_count.incr();
        m.recv_msg_bytes.add(100);
        let snap = m.snapshot();
        assert_eq!(snap.propose_count, 2);
        assert_eq!(snap.recv_msg_bytes, 100);
        assert_eq!(snap.send_msg_count, 0);
    }
}
