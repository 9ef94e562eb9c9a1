//! Cluster-event coordinator: observes config-group changes and drives
//! slot creation, slot-leader elections, and node-descriptor updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::try_join_all;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration};

use crate::config::{
    cmd, ClusterConfig, Cmd, ConfigCmdType, Node, Slot, SlotStatus,
    CONFIG_SHARD_NO,
};
use crate::options::Options;
use crate::replica::{Log, LogIndex, NodeId, SlotId};
use crate::route::{
    decode_slot_log_info_resp, encode_slot_log_info_req, Transport,
    PATH_NODE_UPDATE, PATH_SLOT_LOG_INFO,
};
use crate::shard::{LogApplier, Shard, ShardManager, SlotLogInfo};
use crate::store::StoreApplier;
use crate::utils::ClusterError;
use crate::{pf_debug, pf_error, pf_info, pf_warn};

/// Deadline for gathering slot log info from remote candidates.
const ELECTION_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SlotEventType {
    /// Initial slot layout during bootstrap.
    Init,
    /// Re-elect the leaders of the named slots.
    Election,
}

#[derive(Debug, Clone)]
pub struct SlotEvent {
    pub event_type: SlotEventType,
    pub slots: Vec<Slot>,
    pub slot_ids: Vec<SlotId>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NodeEventType {
    /// A node asks the config leader to refresh its descriptor.
    RequestUpdate,
    /// Observed liveness changes; only the leader applies them.
    OnlineStatusChange,
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub event_type: NodeEventType,
    pub nodes: Vec<Node>,
}

/// One observation emitted by the config replication group or the node
/// health watcher.
#[derive(Debug, Default, Clone)]
pub struct ClusterEvent {
    pub slot_event: Option<SlotEvent>,
    pub node_event: Option<NodeEvent>,
    pub version_change: bool,
}

impl ClusterEvent {
    pub fn version_change() -> Self {
        ClusterEvent {
            version_change: true,
            ..Default::default()
        }
    }
}

/// Applies config-group commands to the shared cluster config and emits a
/// version-change event per batch. Commands that no longer resolve (e.g.
/// an update for a node the config never saw) are skipped so that every
/// replica applies the same way.
pub struct ConfigApplier {
    config: Arc<RwLock<ClusterConfig>>,
    tx_event: mpsc::UnboundedSender<ClusterEvent>,
}

impl ConfigApplier {
    pub fn new(
        config: Arc<RwLock<ClusterConfig>>,
        tx_event: mpsc::UnboundedSender<ClusterEvent>,
    ) -> Self {
        ConfigApplier { config, tx_event }
    }
}

impl LogApplier for ConfigApplier {
    fn apply(
        &self,
        _shard_no: &str,
        logs: &[Log],
    ) -> Result<LogIndex, ClusterError> {
        let mut applied = 0;
        {
            let mut config =
                self.config.write().unwrap_or_else(|e| e.into_inner());
            for log in logs {
                let cmd = Cmd::decode(&log.data)?;
                if let Err(e) = config.apply_cmd(&cmd) {
                    pf_warn!(
                        "config cmd {} at index {} skipped: {}",
                        cmd.cmd_type,
                        log.index,
                        e
                    );
                }
                applied = log.index;
            }
        }
        if applied > 0 {
            let _ = self.tx_event.send(ClusterEvent::version_change());
        }
        Ok(applied)
    }
}

/// Routes committed entries to the applier owning the shard: the config
/// group feeds the cluster config, slot groups feed the metadata store.
pub struct ClusterApplier {
    config_applier: ConfigApplier,
    store_applier: StoreApplier,
}

impl ClusterApplier {
    pub fn new(
        config_applier: ConfigApplier,
        store_applier: StoreApplier,
    ) -> Self {
        ClusterApplier {
            config_applier,
            store_applier,
        }
    }
}

impl LogApplier for ClusterApplier {
    fn apply(
        &self,
        shard_no: &str,
        logs: &[Log],
    ) -> Result<LogIndex, ClusterError> {
        if shard_no == CONFIG_SHARD_NO {
            self.config_applier.apply(shard_no, logs)
        } else if shard_no.starts_with("slot-") {
            self.store_applier.apply(shard_no, logs)
        } else {
            // channel shards carry message payloads applied elsewhere
            Ok(logs.last().map(|l| l.index).unwrap_or(0))
        }
    }
}

/// Coordinates cluster-wide reactions to config-group events.
pub struct EventCoordinator {
    opts: Arc<Options>,
    config: Arc<RwLock<ClusterConfig>>,
    config_shard: Arc<Shard>,
    shards: Arc<ShardManager>,
    transport: Arc<dyn Transport>,
    slot_init_done: AtomicBool,
}

impl EventCoordinator {
    pub fn new(
        opts: Arc<Options>,
        config: Arc<RwLock<ClusterConfig>>,
        config_shard: Arc<Shard>,
        shards: Arc<ShardManager>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(EventCoordinator {
            opts,
            config,
            config_shard,
            shards,
            transport,
            slot_init_done: AtomicBool::new(false),
        })
    }

    pub fn is_config_leader(&self) -> bool {
        self.config_shard.is_leader()
    }

    pub fn config_leader_id(&self) -> NodeId {
        self.config_shard.leader_id()
    }

    pub fn slot_init_done(&self) -> bool {
        self.slot_init_done.load(Ordering::Acquire)
    }

    fn config_snapshot(&self) -> ClusterConfig {
        match self.config.read() {
            Ok(cfg) => cfg.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    async fn propose_cmd(&self, cmd: Cmd) -> Result<LogIndex, ClusterError> {
        self.config_shard
            .propose_and_wait_commit(
                cmd.encode(),
                Duration::from_millis(self.opts.propose_timeout_ms),
            )
            .await
    }

    /// Event loop; exits on the stop signal.
    pub async fn run(
        self: Arc<Self>,
        mut rx_event: mpsc::UnboundedReceiver<ClusterEvent>,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = rx_event.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.handle_event(event).await {
                                pf_error!("error handling cluster event: {}", e);
                            }
                        }
                        None => break,
                    }
                },
                _ = rx_stop.changed() => {
                    pf_warn!("event coordinator caught stop signal");
                    break;
                },
            }
        }
    }

    pub async fn handle_event(
        &self,
        event: ClusterEvent,
    ) -> Result<(), ClusterError> {
        if let Some(slot_event) = event.slot_event {
            match slot_event.event_type {
                SlotEventType::Init => {
                    self.handle_slot_init(slot_event.slots).await?
                }
                SlotEventType::Election => {
                    self.handle_slot_election(slot_event.slot_ids).await?
                }
            }
        }
        if let Some(node_event) = event.node_event {
            match node_event.event_type {
                NodeEventType::RequestUpdate => {
                    self.handle_node_request_update(node_event.nodes)
                        .await?
                }
                NodeEventType::OnlineStatusChange => {
                    self.handle_node_online_change(node_event.nodes)
                        .await?
                }
            }
        }
        if event.version_change {
            self.handle_version_change()?;
        }
        Ok(())
    }

    /// Initial slot layout. Non-leader nodes only mark init done; the
    /// leader writes the slots into the config in a single version bump.
    async fn handle_slot_init(
        &self,
        slots: Vec<Slot>,
    ) -> Result<(), ClusterError> {
        if slots.is_empty() {
            return Ok(());
        }
        if !self.is_config_leader() {
            self.slot_init_done.store(true, Ordering::Release);
            return Ok(());
        }
        self.propose_cmd(Cmd::new(
            ConfigCmdType::SlotUpdate,
            cmd::encode_slots(&slots)?,
        ))
        .await?;
        self.slot_init_done.store(true, Ordering::Release);
        Ok(())
    }

    /// Slot-leader election: gathers each candidate's log tip and commits
    /// the per-slot winners in a single version bump. The most up-to-date
    /// replica wins; ties go to the smaller node id.
    pub async fn handle_slot_election(
        &self,
        slot_ids: Vec<SlotId>,
    ) -> Result<(), ClusterError> {
        if slot_ids.is_empty() || !self.is_config_leader() {
            return Ok(());
        }
        self.shards.metrics().election_count.incr();
        let cfg = self.config_snapshot();

        // candidates: self plus the online replica nodes of each slot
        let mut node_slots: HashMap<NodeId, Vec<SlotId>> = HashMap::new();
        for &slot_id in &slot_ids {
            let Some(slot) = cfg.slot(slot_id) else {
                pf_warn!("slot {} not in config, skipped", slot_id);
                continue;
            };
            for &replica in &slot.replicas {
                if replica == self.opts.node_id
                    || cfg.node_is_online(replica)
                {
                    node_slots.entry(replica).or_default().push(slot_id);
                }
            }
        }
        if node_slots.is_empty() {
            pf_warn!("no reachable candidates for slots {:?}", slot_ids);
            return Ok(());
        }

        // gather log tips: local synchronously, remote fanned out under
        // one deadline; any failure aborts this election batch
        let mut reports: Vec<(NodeId, Vec<SlotLogInfo>)> = Vec::new();
        let mut handles = Vec::new();
        for (node_id, ids) in node_slots {
            if node_id == self.opts.node_id {
                reports.push((node_id, self.shards.slot_log_infos(&ids)));
                continue;
            }
            let transport = self.transport.clone();
            handles.push(tokio::spawn(async move {
                let body = transport
                    .request(
                        node_id,
                        PATH_SLOT_LOG_INFO,
                        encode_slot_log_info_req(&ids),
                    )
                    .await?;
                Ok::<_, ClusterError>((
                    node_id,
                    decode_slot_log_info_resp(&body)?,
                ))
            }));
        }
        let joined = match time::timeout(
            ELECTION_GATHER_TIMEOUT,
            try_join_all(handles),
        )
        .await
        {
            Ok(Ok(joined)) => joined,
            Ok(Err(e)) => {
                pf_error!("slot log info gather task failed: {}", e);
                return Ok(());
            }
            Err(_) => {
                pf_error!("slot log info gather timed out");
                return Ok(());
            }
        };
        for result in joined {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    pf_error!("slot log info request failed: {}", e);
                    return Ok(());
                }
            }
        }

        // node -> slot -> log index
        let mut node_slot_index: HashMap<NodeId, HashMap<SlotId, u64>> =
            HashMap::new();
        for (node_id, infos) in reports {
            let entry = node_slot_index.entry(node_id).or_default();
            for info in infos {
                entry.insert(info.slot_id, info.log_index);
            }
        }

        // per slot: maximum log index wins, smaller node id breaks ties
        let mut updated = Vec::new();
        for &slot_id in &slot_ids {
            let mut winner: Option<(NodeId, u64)> = None;
            for (&node_id, slot_index) in &node_slot_index {
                let Some(&log_index) = slot_index.get(&slot_id) else {
                    continue;
                };
                winner = match winner {
                    None => Some((node_id, log_index)),
                    Some((best_node, best_index)) => {
                        if log_index > best_index
                            || (log_index == best_index
                                && node_id < best_node)
                        {
                            Some((node_id, log_index))
                        } else {
                            Some((best_node, best_index))
                        }
                    }
                };
            }
            let Some((leader, log_index)) = winner else {
                pf_warn!("slot {} had no report, retried next round", slot_id);
                continue;
            };
            let Some(slot) = cfg.slot(slot_id) else {
                continue;
            };
            pf_info!(
                "slot {} elects node {} at log index {}",
                slot_id,
                leader,
                log_index
            );
            let mut new_slot = slot.clone();
            new_slot.leader = leader;
            new_slot.term = slot.term + 1;
            new_slot.status = SlotStatus::Normal;
            updated.push(new_slot);
        }
        if updated.is_empty() {
            pf_warn!("election chose no slot leaders");
            return Ok(());
        }
        self.propose_cmd(Cmd::new(
            ConfigCmdType::SlotUpdate,
            cmd::encode_slots(&updated)?,
        ))
        .await?;
        Ok(())
    }

    /// A node asks for its descriptor to be refreshed: the leader applies
    /// it, everyone else forwards to the leader.
    async fn handle_node_request_update(
        &self,
        nodes: Vec<Node>,
    ) -> Result<(), ClusterError> {
        let Some(node) = nodes.into_iter().next() else {
            return Ok(());
        };
        if self.is_config_leader() {
            self.propose_cmd(Cmd::new(
                ConfigCmdType::NodeJoin,
                cmd::encode_node(&node)?,
            ))
            .await?;
            return Ok(());
        }
        let leader = self.config_leader_id();
        if leader == 0 {
            return Ok(());
        }
        self.transport
            .request(leader, PATH_NODE_UPDATE, cmd::encode_node(&node)?)
            .await?;
        Ok(())
    }

    /// Server side of `PATH_NODE_UPDATE`.
    pub async fn handle_node_update_request(
        &self,
        body: &[u8],
    ) -> Result<Vec<u8>, ClusterError> {
        let node = cmd::decode_node(body)?;
        if !self.is_config_leader() {
            return Err(ClusterError::NotLeader {
                hint: self.config_leader_id(),
            });
        }
        self.propose_cmd(Cmd::new(
            ConfigCmdType::NodeJoin,
            cmd::encode_node(&node)?,
        ))
        .await?;
        Ok(vec![])
    }

    /// Liveness changes; only the leader applies them.
    async fn handle_node_online_change(
        &self,
        nodes: Vec<Node>,
    ) -> Result<(), ClusterError> {
        if !self.is_config_leader() {
            return Ok(());
        }
        for node in nodes {
            self.propose_cmd(Cmd::new(
                ConfigCmdType::NodeOnlineStatusChange,
                cmd::encode_node_online_status_change(node.id, node.online),
            ))
            .await?;
        }
        Ok(())
    }

    /// Reconciles local slot shards against the new config: creates
    /// missing ones and re-appoints leaders that moved.
    pub fn handle_version_change(&self) -> Result<(), ClusterError> {
        let cfg = self.config_snapshot();
        for slot in &cfg.slots {
            if !slot.replicas.contains(&self.opts.node_id) {
                continue;
            }
            let shard = match self.shards.slot_shard(slot.id) {
                Some(shard) => shard,
                None => {
                    pf_debug!("creating shard of slot {}", slot.id);
                    let shard = Shard::new_slot(
                        slot,
                        self.shards.storage().clone(),
                        &self.opts,
                        self.shards.metrics().clone(),
                    )?;
                    self.shards.add_shard(shard.clone());
                    shard
                }
            };
            if slot.leader != 0 && shard.term() < slot.term {
                shard.appoint_leader(slot.term, slot.leader)?;
            }
        }
        Ok(())
    }

    /// One-time cluster bootstrap from the static seed list. Breaks the
    /// config group's self-hosting recursion: the seed with the smallest
    /// id is appointed config leader deterministically, then initializes
    /// nodes and the slot layout, and runs the first slot election.
    pub async fn bootstrap(&self) -> Result<(), ClusterError> {
        let seeds = self.opts.seed_node_pairs()?;
        if seeds.is_empty() {
            return Err(ClusterError::Other(
                "bootstrap requires a non-empty seed list".into(),
            ));
        }
        let first_leader = seeds
            .iter()
            .map(|&(id, _)| id)
            .min()
            .unwrap_or(self.opts.node_id);
        let term = self.config_shard.term() + 1;
        self.config_shard.appoint_leader(term, first_leader)?;
        if first_leader != self.opts.node_id {
            return Ok(());
        }

        if self.config_snapshot().version == 0 {
            let nodes: Vec<Node> = seeds
                .iter()
                .map(|(id, addr)| Node {
                    id: *id,
                    cluster_addr: addr.clone(),
                    online: true,
                    allow_vote: true,
                    ..Default::default()
                })
                .collect();
            let init = ClusterConfig {
                version: 0,
                nodes,
                slots: vec![],
            };
            self.propose_cmd(Cmd::new(
                ConfigCmdType::ConfigInit,
                init.encode()?,
            ))
            .await?;
        }

        if self.config_snapshot().slots.is_empty() {
            let seed_ids: Vec<NodeId> =
                seeds.iter().map(|&(id, _)| id).collect();
            let replica_count =
                (self.opts.slot_replica_count as usize).min(seed_ids.len());
            let slots: Vec<Slot> = (0..self.opts.slot_count)
                .map(|slot_id| {
                    let replicas: Vec<NodeId> = (0..replica_count)
                        .map(|k| {
                            seed_ids
                                [(slot_id as usize + k) % seed_ids.len()]
                        })
                        .collect();
                    Slot {
                        id: slot_id,
                        leader: 0,
                        term: 0,
                        replicas,
                        replica_count: replica_count as u32,
                        status: SlotStatus::Candidate,
                        ..Default::default()
                    }
                })
                .collect();
            let slot_ids: Vec<SlotId> =
                slots.iter().map(|s| s.id).collect();
            self.handle_event(ClusterEvent {
                slot_event: Some(SlotEvent {
                    event_type: SlotEventType::Init,
                    slots,
                    slot_ids: vec![],
                }),
                ..Default::default()
            })
            .await?;
            self.handle_version_change()?;
            self.handle_slot_election(slot_ids).await?;
            self.handle_version_change()?;
        }
        Ok(())
    }
}
