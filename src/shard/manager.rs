//! Replica manager: drives every shard through ticks, queue drains, and
//! Ready batches (persist, ship, apply).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use get_size::GetSize;
use tokio::sync::watch;
use tokio::time::{self, Duration};

use crate::metrics::Metrics;
use crate::replica::{Log, LogIndex, Message, MsgType, NodeId, SlotId};
use crate::route::Transport;
use crate::shard::{slot_shard_no, Shard, ShardLogStorage};
use crate::utils::ClusterError;
use crate::{pf_debug, pf_error, pf_warn};

/// Applies committed entries of a shard to the external state it
/// materializes, returning the new applied index.
pub trait LogApplier: Send + Sync {
    fn apply(
        &self,
        shard_no: &str,
        logs: &[Log],
    ) -> Result<LogIndex, ClusterError>;
}

/// Applier that acknowledges without materializing anything.
pub struct AckApplier;

impl LogApplier for AckApplier {
    fn apply(
        &self,
        _shard_no: &str,
        logs: &[Log],
    ) -> Result<LogIndex, ClusterError> {
        Ok(logs.last().map(|l| l.index).unwrap_or(0))
    }
}

/// Per-slot log tip, reported during slot-leader elections.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SlotLogInfo {
    pub slot_id: SlotId,
    pub log_index: LogIndex,
}

/// Owns all local shards and the single driver loop that advances them.
pub struct ShardManager {
    node_id: NodeId,
    tick_interval: Duration,
    shards: RwLock<HashMap<String, Arc<Shard>>>,
    storage: Arc<dyn ShardLogStorage>,
    transport: Arc<dyn Transport>,
    applier: Arc<dyn LogApplier>,
    metrics: Arc<Metrics>,
}

impl ShardManager {
    pub fn new(
        node_id: NodeId,
        tick_interval: Duration,
        storage: Arc<dyn ShardLogStorage>,
        transport: Arc<dyn Transport>,
        applier: Arc<dyn LogApplier>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(ShardManager {
            node_id,
            tick_interval,
            shards: RwLock::new(HashMap::new()),
            storage,
            transport,
            applier,
            metrics,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn storage(&self) -> &Arc<dyn ShardLogStorage> {
        &self.storage
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn add_shard(&self, shard: Arc<Shard>) {
        let mut shards = match self.shards.write() {
            Ok(s) => s,
            Err(e) => e.into_inner(),
        };
        shards.insert(shard.shard_no().into(), shard);
    }

    pub fn shard(&self, shard_no: &str) -> Option<Arc<Shard>> {
        let shards = match self.shards.read() {
            Ok(s) => s,
            Err(e) => e.into_inner(),
        };
        shards.get(shard_no).cloned()
    }

    pub fn slot_shard(&self, slot_id: SlotId) -> Option<Arc<Shard>> {
        self.shard(&slot_shard_no(slot_id))
    }

    fn all_shards(&self) -> Vec<Arc<Shard>> {
        let shards = match self.shards.read() {
            Ok(s) => s,
            Err(e) => e.into_inner(),
        };
        shards.values().cloned().collect()
    }

    /// Routes an inbound message from the transport into the addressed
    /// shard's queue.
    pub fn deliver(&self, msg: Message) {
        self.metrics.recv_msg_bytes.add(msg.get_size() as u64);
        match self.shard(&msg.shard_no) {
            Some(shard) => shard.recv_message(msg),
            None => {
                pf_debug!(
                    "message for unknown shard {} dropped",
                    msg.shard_no
                );
                self.metrics.queue_drop_count.incr();
            }
        }
    }

    /// Collects the local log tips of the requested slots. Slots without a
    /// local shard are omitted.
    pub fn slot_log_infos(
        &self,
        slot_ids: &[SlotId],
    ) -> Vec<SlotLogInfo> {
        let mut infos = Vec::with_capacity(slot_ids.len());
        for &slot_id in slot_ids {
            if let Some(shard) = self.slot_shard(slot_id) {
                infos.push(SlotLogInfo {
                    slot_id,
                    log_index: shard.last_log_index(),
                });
            }
        }
        infos
    }

    /// Driver loop: ticks every shard at a fixed interval, drains its
    /// receive queue, and processes Ready batches until told to stop.
    pub async fn run(self: Arc<Self>, mut rx_stop: watch::Receiver<bool>) {
        let mut interval = time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.on_tick().await;
                },
                _ = rx_stop.changed() => {
                    pf_warn!("shard manager caught stop signal");
                    break;
                },
            }
        }
    }

    /// One driver pass over every shard.
    pub async fn on_tick(&self) {
        for shard in self.all_shards() {
            if shard.is_quarantined() {
                continue;
            }
            if let Err(e) = shard.tick() {
                pf_error!("error ticking shard {}: {}", shard.shard_no(), e);
                continue;
            }
            for msg in shard.drain_queue() {
                if let Err(e) = shard.step_lock(msg) {
                    pf_debug!(
                        "error stepping shard {}: {}",
                        shard.shard_no(),
                        e
                    );
                }
            }
            if let Err(e) = self.process_ready(&shard).await {
                pf_error!(
                    "error processing ready of {}: {}",
                    shard.shard_no(),
                    e
                );
            }
        }
    }

    /// Drains a shard's Ready batches: persists unstable entries, applies
    /// committed ones, and ships peer messages through the transport.
    /// Bounded passes per tick so one chatty shard cannot starve the rest.
    async fn process_ready(
        &self,
        shard: &Arc<Shard>,
    ) -> Result<(), ClusterError> {
        const MAX_READY_PASSES: usize = 4;
        for _ in 0..MAX_READY_PASSES {
            if !shard.has_ready() {
                return Ok(());
            }
            let rd = match shard.ready() {
                Ok(rd) => rd,
                Err(e) => {
                    shard.quarantine(&e);
                    return Err(e);
                }
            };

            if let Some(last) = rd.unstable_logs.last() {
                let index = last.index;
                if let Err(e) =
                    self.storage.append(shard.shard_no(), &rd.unstable_logs)
                {
                    shard.quarantine(&e);
                    return Err(e);
                }
                shard.step_lock(Message {
                    msg_type: MsgType::StoreAppendResp,
                    index,
                    shard_no: shard.shard_no().into(),
                    ..Default::default()
                })?;
            }

            for msg in rd.messages {
                if msg.msg_type == MsgType::ApplyLogsReq {
                    self.apply_committed(shard, msg)?;
                } else if msg.to == self.node_id {
                    shard.step_lock(msg)?;
                } else {
                    self.metrics.send_msg_count.incr();
                    self.metrics.send_msg_bytes.add(msg.get_size() as u64);
                    let to = msg.to;
                    if let Err(e) = self.transport.send(to, msg).await {
                        // unreliable lane; peers re-sync on their own
                        pf_debug!("send to {} failed: {}", to, e);
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_committed(
        &self,
        shard: &Arc<Shard>,
        msg: Message,
    ) -> Result<(), ClusterError> {
        let applied =
            match self.applier.apply(shard.shard_no(), &msg.logs) {
                Ok(applied) => applied.max(msg.index),
                Err(e) => {
                    shard.quarantine(&e);
                    return Err(e);
                }
            };
        self.metrics.applied_count.add(msg.logs.len() as u64);
        shard.step_lock(Message {
            msg_type: MsgType::ApplyLogsResp,
            index: applied,
            shard_no: shard.shard_no().into(),
            ..Default::default()
        })
    }
}
