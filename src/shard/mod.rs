//! Shard layer: binds a replica state machine to a shard identity, its
//! receive queue, storage, and commit-wait notifications.

pub mod manager;
pub mod queue;
pub mod storage;

pub use manager::{AckApplier, LogApplier, ShardManager, SlotLogInfo};
pub use queue::MessageQueue;
pub use storage::{MemoryShardLogStorage, ShardLogStorage};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::{self, Duration};

use crate::config::{ChannelClusterConfig, Slot, CONFIG_SHARD_NO};
use crate::metrics::Metrics;
use crate::options::Options;
use crate::replica::{
    Log, LogIndex, Message, MsgType, NodeId, Ready, Replica, ReplicaOpts,
    Role, SlotId, Term,
};
use crate::utils::ClusterError;
use crate::{pf_debug, pf_error};

/// Storage key of a slot's replicated group.
pub fn slot_shard_no(slot_id: SlotId) -> String {
    format!("slot-{}", slot_id)
}

/// Storage key of a channel's replicated group.
pub fn channel_shard_no(channel_id: &str, channel_type: u8) -> String {
    format!("channel-{}-{}", channel_type, channel_id)
}

/// A single replicated group: replica state machine plus its inbound
/// queue, bound to storage by its shard number.
///
/// The replica is guarded by a step lock; composite step-plus-timer
/// transitions hold it for their whole extent, and it is never held
/// across I/O.
pub struct Shard {
    shard_no: String,
    replica: Mutex<Replica>,
    queue: MessageQueue,
    waiters: Mutex<BTreeMap<LogIndex, Vec<oneshot::Sender<LogIndex>>>>,
    quarantined: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Shard {
    /// Creates the shard of a slot from its descriptor.
    pub fn new_slot(
        slot: &Slot,
        storage: Arc<dyn ShardLogStorage>,
        opts: &Options,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Shard>, ClusterError> {
        Self::new(
            slot_shard_no(slot.id),
            slot.replicas.clone(),
            vec![],
            0,
            storage,
            opts,
            metrics,
        )
    }

    /// Creates the shard of a channel from its cluster config.
    pub fn new_channel(
        cfg: &ChannelClusterConfig,
        applied_index: LogIndex,
        storage: Arc<dyn ShardLogStorage>,
        opts: &Options,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Shard>, ClusterError> {
        Self::new(
            channel_shard_no(&cfg.channel_id, cfg.channel_type),
            cfg.replicas.clone(),
            cfg.learners.clone(),
            applied_index,
            storage,
            opts,
            metrics,
        )
    }

    /// Creates the distinguished config-group shard over the static seed
    /// replica set.
    pub fn new_config(
        replicas: Vec<NodeId>,
        storage: Arc<dyn ShardLogStorage>,
        opts: &Options,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Shard>, ClusterError> {
        Self::new(
            CONFIG_SHARD_NO.into(),
            replicas,
            vec![],
            0,
            storage,
            opts,
            metrics,
        )
    }

    fn new(
        shard_no: String,
        replicas: Vec<NodeId>,
        learners: Vec<NodeId>,
        applied_index: LogIndex,
        storage: Arc<dyn ShardLogStorage>,
        opts: &Options,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Shard>, ClusterError> {
        // jitter the timeout so shards do not give up on a quiet leader
        // in lockstep
        let election_timeout_ticks = opts.election_timeout_ticks
            + rand::thread_rng()
                .gen_range(0..=opts.election_timeout_ticks / 3);
        let replica = Replica::new(
            opts.node_id,
            shard_no.clone(),
            replicas,
            learners,
            applied_index,
            storage,
            ReplicaOpts {
                heartbeat_interval_ticks: opts.heartbeat_interval_ticks,
                sync_interval_ticks: opts.sync_interval_ticks,
                election_timeout_ticks,
            },
        )?;
        Ok(Arc::new(Shard {
            shard_no,
            replica: Mutex::new(replica),
            queue: MessageQueue::new(
                opts.recv_queue_size,
                opts.recv_queue_lazy_free_cycle,
                opts.recv_queue_max_memory,
            ),
            waiters: Mutex::new(BTreeMap::new()),
            quarantined: AtomicBool::new(false),
            metrics,
        }))
    }

    pub fn shard_no(&self) -> &str {
        &self.shard_no
    }

    pub fn is_leader(&self) -> bool {
        self.replica().map(|r| r.is_leader()).unwrap_or(false)
    }

    pub fn role(&self) -> Role {
        self.replica().map(|r| r.role()).unwrap_or_default()
    }

    pub fn leader_id(&self) -> NodeId {
        self.replica().map(|r| r.leader_id()).unwrap_or(0)
    }

    pub fn term(&self) -> Term {
        self.replica().map(|r| r.term()).unwrap_or(0)
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.replica().map(|r| r.last_log_index()).unwrap_or(0)
    }

    pub fn applied_index(&self) -> LogIndex {
        self.replica().map(|r| r.applied_index()).unwrap_or(0)
    }

    /// A quarantined shard stopped stepping after a storage failure or
    /// invariant violation; the node should report unhealthy.
    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Acquire)
    }

    fn replica(&self) -> Result<MutexGuard<'_, Replica>, ClusterError> {
        self.replica
            .lock()
            .map_err(|e| ClusterError::Other(e.to_string()))
    }

    fn check_quarantined(&self) -> Result<(), ClusterError> {
        if self.is_quarantined() {
            return Err(ClusterError::Other(format!(
                "shard {} is quarantined",
                self.shard_no
            )));
        }
        Ok(())
    }

    /// Steps one message under the step lock, then fires any commit
    /// waiters the step satisfied.
    pub fn step_lock(&self, msg: Message) -> Result<(), ClusterError> {
        self.check_quarantined()?;
        let (applied, committed, is_leader) = {
            let mut replica = self.replica()?;
            if let Err(e) = replica.step(msg) {
                if matches!(
                    e,
                    ClusterError::InvariantViolation(_)
                        | ClusterError::StorageFailure(_)
                ) {
                    drop(replica);
                    self.quarantine(&e);
                }
                return Err(e);
            }
            (
                replica.applied_index(),
                replica.committed_index(),
                replica.is_leader(),
            )
        };
        self.wake_committed(applied);
        if !is_leader {
            // a stepped-down leader cannot commit what it accepted; cancel
            // the uncommitted waits so callers retry against the new leader
            self.cancel_waiters_above(committed);
        }
        Ok(())
    }

    fn cancel_waiters_above(&self, committed: LogIndex) {
        if let Ok(mut waiters) = self.waiters.lock() {
            // dropping the senders cancels the waits
            waiters.split_off(&(committed + 1));
        }
    }

    pub(crate) fn quarantine(&self, err: &ClusterError) {
        pf_error!("shard {} quarantined: {}", self.shard_no, err);
        self.quarantined.store(true, Ordering::Release);
        self.queue.stop();
    }

    /// Appoints `leader` for `term`. A no-op unless `term` exceeds the
    /// current one; the effect is deterministic from the term alone.
    pub fn appoint_leader(
        &self,
        term: Term,
        leader: NodeId,
    ) -> Result<(), ClusterError> {
        let to = self.replica()?.node_id();
        self.step_lock(Message {
            msg_type: MsgType::AppointLeaderReq,
            from: leader,
            to,
            term,
            shard_no: self.shard_no.clone(),
            ..Default::default()
        })
    }

    /// Proposes data on the local leader, returning its assigned index.
    pub fn propose(&self, data: Vec<u8>) -> Result<LogIndex, ClusterError> {
        self.check_quarantined()?;
        let mut replica = self.replica()?;
        replica.step(Message {
            msg_type: MsgType::Propose,
            logs: vec![Log {
                data,
                ..Default::default()
            }],
            ..Default::default()
        })?;
        self.metrics.propose_count.incr();
        Ok(replica.last_log_index())
    }

    /// Proposes data and waits until the applier reports the assigned
    /// index applied. On timeout the committed log still applies; there is
    /// no rollback, and the caller must treat the outcome as unknown.
    pub async fn propose_and_wait_commit(
        &self,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<LogIndex, ClusterError> {
        self.check_quarantined()?;
        let (tx, rx) = oneshot::channel();
        let index = {
            let mut replica = self.replica()?;
            replica.step(Message {
                msg_type: MsgType::Propose,
                logs: vec![Log {
                    data,
                    ..Default::default()
                }],
                ..Default::default()
            })?;
            let index = replica.last_log_index();
            self.waiters
                .lock()
                .map_err(|e| ClusterError::Other(e.to_string()))?
                .entry(index)
                .or_default()
                .push(tx);
            index
        };
        self.metrics.propose_count.incr();
        match time::timeout(timeout, rx).await {
            Ok(Ok(applied)) => {
                debug_assert!(applied >= index);
                Ok(index)
            }
            Ok(Err(_)) => Err(ClusterError::NotLeader {
                hint: self.leader_id(),
            }),
            Err(_) => {
                if let Ok(mut waiters) = self.waiters.lock() {
                    waiters.remove(&index);
                }
                Err(ClusterError::Timeout)
            }
        }
    }

    fn wake_committed(&self, applied: LogIndex) {
        let mut fired = Vec::new();
        if let Ok(mut waiters) = self.waiters.lock() {
            let rest = waiters.split_off(&(applied + 1));
            let done = std::mem::replace(&mut *waiters, rest);
            for (_, txs) in done {
                fired.extend(txs);
            }
        }
        for tx in fired {
            let _ = tx.send(applied);
        }
    }

    /// Routes an inbound protocol message into the receive queue.
    /// Control-plane messages take the no-drop lane.
    pub fn recv_message(&self, msg: Message) {
        self.metrics.recv_msg_count.incr();
        if msg.msg_type.is_control() {
            if !self.queue.must_add(msg) {
                pf_debug!("shard {} stopped, control msg dropped", self.shard_no);
            }
        } else {
            let (accepted, _stopped) = self.queue.add(msg);
            if !accepted {
                self.metrics.queue_drop_count.incr();
            }
        }
    }

    pub(crate) fn drain_queue(&self) -> Vec<Message> {
        self.queue.get()
    }

    pub fn tick(&self) -> Result<(), ClusterError> {
        self.replica()?.tick();
        Ok(())
    }

    pub fn has_ready(&self) -> bool {
        self.replica().map(|r| r.has_ready()).unwrap_or(false)
    }

    pub fn ready(&self) -> Result<Ready, ClusterError> {
        self.replica()?.ready()
    }

    /// Handles a locally addressed message outside the manager loop:
    /// acknowledges an `ApplyLogsReq` as applied through its index. Used
    /// where no external applier is wired in.
    pub fn handle_local_msg(&self, msg: Message) -> Result<(), ClusterError> {
        if msg.msg_type != MsgType::ApplyLogsReq {
            return self.step_lock(msg);
        }
        self.metrics.applied_count.add(msg.logs.len() as u64);
        self.step_lock(Message {
            msg_type: MsgType::ApplyLogsResp,
            index: msg.index,
            shard_no: self.shard_no.clone(),
            ..Default::default()
        })
    }
}
