//! Bounded two-buffer swap queue bridging the transport layer and a
//! shard's state machine.
//!
//! Producers fill one pre-allocated buffer while the consumer drains the
//! other; `get()` swaps sides. A third unbounded no-drop lane carries
//! control-plane messages that must never be lost, and a byte budget over
//! log payloads sheds replication traffic under memory pressure.

use std::sync::Mutex;

use crate::replica::{logs_size, Message};
use crate::pf_warn;

struct RateLimiter {
    max_bytes: u64,
    bytes: u64,
}

impl RateLimiter {
    fn new(max_bytes: u64) -> Self {
        RateLimiter { max_bytes, bytes: 0 }
    }

    fn enabled(&self) -> bool {
        self.max_bytes > 0
    }

    fn limited(&self) -> bool {
        self.bytes > self.max_bytes
    }

    fn increase(&mut self, n: u64) {
        self.bytes += n;
    }

    fn reset(&mut self) {
        self.bytes = 0;
    }
}

struct QueueInner {
    left: Vec<Message>,
    right: Vec<Message>,
    nodrop: Vec<Message>,
    rl: RateLimiter,
    cycle: u64,
    idx: u64,
    old_idx: u64,
    left_in_write: bool,
    stopped: bool,
}

/// Per-shard inbound message queue.
pub struct MessageQueue {
    size: u64,
    lazy_free_cycle: u64,
    inner: Mutex<QueueInner>,
}

impl MessageQueue {
    /// Creates a queue with per-buffer capacity `size`, a GC cadence of
    /// `lazy_free_cycle` swaps (0 = never, 1 = every swap), and a rate
    /// limit of `max_memory_bytes` over queued log payloads (0 = off).
    pub fn new(size: u64, lazy_free_cycle: u64, max_memory_bytes: u64) -> Self {
        MessageQueue {
            size,
            lazy_free_cycle,
            inner: Mutex::new(QueueInner {
                left: vec![Message::default(); size as usize],
                right: vec![Message::default(); size as usize],
                nodrop: Vec::new(),
                rl: RateLimiter::new(max_memory_bytes),
                cycle: 0,
                idx: 0,
                old_idx: 0,
                left_in_write: true,
                stopped: false,
            }),
        }
    }

    /// Adds a message to the current write buffer. Returns
    /// `(accepted, stopped)`: not accepted when the buffer is full, the
    /// queue is stopped, or the memory budget sheds the message.
    pub fn add(&self, msg: Message) -> (bool, bool) {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if q.idx >= self.size {
            return (false, q.stopped);
        }
        if q.stopped {
            return (false, true);
        }
        if q.rl.enabled() {
            if q.rl.limited() {
                pf_warn!(
                    "rate limited, dropped a {:?} msg for {}",
                    msg.msg_type,
                    msg.shard_no
                );
                return (false, false);
            }
            let sz = logs_size(&msg.logs);
            q.rl.increase(sz);
        }
        let idx = q.idx as usize;
        let w = if q.left_in_write {
            &mut q.left
        } else {
            &mut q.right
        };
        w[idx] = msg;
        q.idx += 1;
        (true, false)
    }

    /// Adds a message to the no-drop lane, bypassing capacity and budget
    /// checks. Returns false only after `stop()`.
    pub fn must_add(&self, msg: Message) -> bool {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if q.stopped {
            return false;
        }
        q.nodrop.push(msg);
        true
    }

    /// Swaps the write/read sides and returns the no-drop lane followed by
    /// the filled prefix of the just-swapped buffer.
    pub fn get(&self) -> Vec<Message> {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        q.cycle += 1;
        let sz = q.idx;
        q.idx = 0;
        q.left_in_write = !q.left_in_write;
        self.gc(&mut q);
        q.old_idx = sz;
        if q.rl.enabled() {
            q.rl.reset();
        }
        let read = if q.left_in_write {
            &mut q.right
        } else {
            &mut q.left
        };
        let mut out: Vec<Message> =
            read[..sz as usize].iter().cloned().collect();
        if !q.nodrop.is_empty() {
            let mut result = std::mem::take(&mut q.nodrop);
            result.append(&mut out);
            return result;
        }
        out
    }

    pub fn stop(&self) {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        q.stopped = true;
    }

    /// Drops back-references to log payloads in drained buffer entries so
    /// they stop pinning memory between swaps.
    fn gc(&self, q: &mut QueueInner) {
        if self.lazy_free_cycle == 0 {
            return;
        }
        let old_idx = q.old_idx as usize;
        let cycle = q.cycle;
        let oldq = if q.left_in_write {
            &mut q.left
        } else {
            &mut q.right
        };
        if self.lazy_free_cycle == 1 {
            for m in oldq[..old_idx].iter_mut() {
                m.logs = Vec::new();
            }
        } else if cycle % self.lazy_free_cycle == 0 {
            for m in oldq.iter_mut() {
                m.logs = Vec::new();
            }
        }
    }
}

#[cfg(test)]
mod queue_tests {
    use super::*;
    use crate::replica::{Log, MsgType};

    fn data_msg(n: u64, payload: usize) -> Message {
        Message {
            msg_type: MsgType::SyncResp,
            from: n,
            logs: vec![Log {
                index: n,
                term: 1,
                data: vec![7u8; payload],
            }],
            shard_no: "slot-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn add_get_swaps_buffers() {
        let q = MessageQueue::new(4, 0, 0);
        assert_eq!(q.add(data_msg(1, 0)), (true, false));
        assert_eq!(q.add(data_msg(2, 0)), (true, false));
        let got = q.get();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].from, 1);
        assert!(q.get().is_empty());
        // the other buffer now takes writes
        assert_eq!(q.add(data_msg(3, 0)), (true, false));
        assert_eq!(q.get().len(), 1);
    }

    #[test]
    fn add_when_full_rejected() {
        let q = MessageQueue::new(2, 0, 0);
        assert_eq!(q.add(data_msg(1, 0)), (true, false));
        assert_eq!(q.add(data_msg(2, 0)), (true, false));
        assert_eq!(q.add(data_msg(3, 0)), (false, false));
        q.get();
        assert_eq!(q.add(data_msg(4, 0)), (true, false));
    }

    #[test]
    fn stop_semantics() {
        let q = MessageQueue::new(2, 0, 0);
        assert!(q.must_add(data_msg(1, 0)));
        q.stop();
        assert_eq!(q.add(data_msg(2, 0)), (false, true));
        assert!(!q.must_add(data_msg(3, 0)));
        // what was enqueued before the stop still drains
        assert_eq!(q.get().len(), 1);
    }

    #[test]
    fn nodrop_lane_drains_first() {
        let q = MessageQueue::new(2, 0, 0);
        q.add(data_msg(1, 0));
        q.must_add(Message {
            msg_type: MsgType::AppointLeaderReq,
            from: 9,
            ..Default::default()
        });
        let got = q.get();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].from, 9);
        assert_eq!(got[1].from, 1);
    }

    #[test]
    fn nodrop_bypasses_capacity() {
        let q = MessageQueue::new(1, 0, 0);
        assert_eq!(q.add(data_msg(1, 0)), (true, false));
        assert_eq!(q.add(data_msg(2, 0)), (false, false));
        assert!(q.must_add(data_msg(3, 0)));
        assert_eq!(q.get().len(), 2);
    }

    #[test]
    fn rate_limit_sheds_payload_heavy() {
        let q = MessageQueue::new(64, 0, 256);
        // first message always admitted; budget only trips once exceeded
        assert_eq!(q.add(data_msg(1, 512)), (true, false));
        assert_eq!(q.add(data_msg(2, 16)), (false, false));
        // budget resets on swap
        q.get();
        assert_eq!(q.add(data_msg(3, 16)), (true, false));
    }

    #[test]
    fn lazy_free_clears_drained_payloads() {
        let q = MessageQueue::new(4, 1, 0);
        q.add(data_msg(1, 64));
        assert_eq!(q.get().len(), 1);
        // swap back: the buffer holding message 1 is GCed on this get
        q.get();
        let inner = q.inner.lock().unwrap();
        assert!(inner.left[0].logs.is_empty());
        assert!(inner.right[0].logs.is_empty());
    }
}
