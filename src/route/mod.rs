//! Routing and propose layer: resolves slot/channel leaders, forwards
//! proposes to them, and hides the cluster transport behind a seam.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::time::{self, Duration};

use crate::config::{ChannelClusterConfig, ClusterConfig, Node};
use crate::options::Options;
use crate::replica::{
    get_bytes, get_string, get_u32, get_u64, get_u8, put_string, LogIndex,
    Message, NodeId, SlotId,
};
use crate::shard::{channel_shard_no, Shard, ShardManager, SlotLogInfo};
use crate::store::ChannelMetaStore;
use crate::utils::ClusterError;
use crate::{pf_debug, pf_warn};

/// RPC path for forwarding a slot propose to its leader.
pub const PATH_SLOT_PROPOSE: &str = "/slot/propose";
/// RPC path for gathering slot log tips during elections.
pub const PATH_SLOT_LOG_INFO: &str = "/slot/loginfo";
/// RPC path for forwarding a node-descriptor update to the config leader.
pub const PATH_NODE_UPDATE: &str = "/node/update";
/// RPC path for fetching a channel's cluster config from its slot leader.
pub const PATH_CHANNEL_CONFIG: &str = "/channel/config";

/// Cluster transport seam: typed fire-and-forget messages plus unary
/// request/response. Implementations own framing and reconnection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a typed message to a node; unreliable, never blocks on a
    /// reply.
    async fn send(&self, to: NodeId, msg: Message) -> Result<(), ClusterError>;

    /// Unary RPC. Cancellation is the caller's: drop the future (or race
    /// it against a deadline) to stop waiting.
    async fn request(
        &self,
        to: NodeId,
        path: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, ClusterError>;
}

type MessageSink = Box<dyn Fn(Message) + Send + Sync>;
type RequestHandler =
    Box<dyn Fn(&[u8]) -> Result<Vec<u8>, ClusterError> + Send + Sync>;

/// In-process `Transport` wiring nodes of a test cluster together.
#[derive(Default)]
pub struct MemoryTransport {
    sinks: RwLock<HashMap<NodeId, MessageSink>>,
    handlers: RwLock<HashMap<(NodeId, String), RequestHandler>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the inbound-message callback of a node.
    pub fn register_sink(
        &self,
        node_id: NodeId,
        sink: impl Fn(Message) + Send + Sync + 'static,
    ) {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        sinks.insert(node_id, Box::new(sink));
    }

    /// Registers a unary request handler of a node.
    pub fn register_handler(
        &self,
        node_id: NodeId,
        path: &str,
        handler: impl Fn(&[u8]) -> Result<Vec<u8>, ClusterError>
            + Send
            + Sync
            + 'static,
    ) {
        let mut handlers =
            self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert((node_id, path.into()), Box::new(handler));
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        to: NodeId,
        msg: Message,
    ) -> Result<(), ClusterError> {
        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner());
        match sinks.get(&to) {
            Some(sink) => {
                sink(msg);
                Ok(())
            }
            None => Err(ClusterError::TransportFailure(format!(
                "node {} unreachable",
                to
            ))),
        }
    }

    async fn request(
        &self,
        to: NodeId,
        path: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, ClusterError> {
        let handlers =
            self.handlers.read().unwrap_or_else(|e| e.into_inner());
        match handlers.get(&(to, path.to_string())) {
            Some(handler) => handler(&body),
            None => Err(ClusterError::TransportFailure(format!(
                "node {} has no handler for {}",
                to, path
            ))),
        }
    }
}

/// Stable mapping from a channel id to its slot.
pub fn slot_id_of_channel(channel_id: &str, slot_count: u32) -> SlotId {
    crc32fast::hash(channel_id.as_bytes()) % slot_count
}

pub fn encode_slot_propose_req(slot_id: SlotId, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u32(slot_id);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.to_vec()
}

pub fn decode_slot_propose_req(
    data: &[u8],
) -> Result<(SlotId, Vec<u8>), ClusterError> {
    let mut buf = data;
    let slot_id = get_u32(&mut buf)?;
    let len = get_u32(&mut buf)? as usize;
    Ok((slot_id, get_bytes(&mut buf, len)?))
}

pub fn encode_log_index(index: LogIndex) -> Vec<u8> {
    index.to_be_bytes().to_vec()
}

pub fn decode_log_index(data: &[u8]) -> Result<LogIndex, ClusterError> {
    let mut buf = data;
    get_u64(&mut buf)
}

pub fn encode_slot_log_info_req(slot_ids: &[SlotId]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + 4 * slot_ids.len());
    buf.put_u32(slot_ids.len() as u32);
    for &id in slot_ids {
        buf.put_u32(id);
    }
    buf.to_vec()
}

pub fn decode_slot_log_info_req(
    data: &[u8],
) -> Result<Vec<SlotId>, ClusterError> {
    let mut buf = data;
    let count = get_u32(&mut buf)?;
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ids.push(get_u32(&mut buf)?);
    }
    Ok(ids)
}

pub fn encode_slot_log_info_resp(infos: &[SlotLogInfo]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + 12 * infos.len());
    buf.put_u32(infos.len() as u32);
    for info in infos {
        buf.put_u32(info.slot_id);
        buf.put_u64(info.log_index);
    }
    buf.to_vec()
}

pub fn decode_slot_log_info_resp(
    data: &[u8],
) -> Result<Vec<SlotLogInfo>, ClusterError> {
    let mut buf = data;
    let count = get_u32(&mut buf)?;
    let mut infos = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let slot_id = get_u32(&mut buf)?;
        let log_index = get_u64(&mut buf)?;
        infos.push(SlotLogInfo { slot_id, log_index });
    }
    Ok(infos)
}

pub fn encode_channel_config_req(
    channel_id: &str,
    channel_type: u8,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, channel_id);
    buf.put_u8(channel_type);
    buf.to_vec()
}

pub fn decode_channel_config_req(
    data: &[u8],
) -> Result<(String, u8), ClusterError> {
    let mut buf = data;
    let channel_id = get_string(&mut buf)?;
    let channel_type = get_u8(&mut buf)?;
    Ok((channel_id, channel_type))
}

/// Resolves slot/channel leaders and carries proposes to them, locally or
/// across the wire.
pub struct Router {
    opts: Arc<Options>,
    config: Arc<RwLock<ClusterConfig>>,
    shards: Arc<ShardManager>,
    transport: Arc<dyn Transport>,
    meta: Arc<dyn ChannelMetaStore>,
}

impl Router {
    pub fn new(
        opts: Arc<Options>,
        config: Arc<RwLock<ClusterConfig>>,
        shards: Arc<ShardManager>,
        transport: Arc<dyn Transport>,
        meta: Arc<dyn ChannelMetaStore>,
    ) -> Arc<Self> {
        Arc::new(Router {
            opts,
            config,
            shards,
            transport,
            meta,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.opts.node_id
    }

    fn config_snapshot(&self) -> ClusterConfig {
        match self.config.read() {
            Ok(cfg) => cfg.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    pub fn slot_id_of_channel(&self, channel_id: &str) -> SlotId {
        slot_id_of_channel(channel_id, self.opts.slot_count)
    }

    pub fn node_info(&self, node_id: NodeId) -> Result<Node, ClusterError> {
        self.config_snapshot()
            .node(node_id)
            .cloned()
            .ok_or_else(|| {
                ClusterError::NotFound(format!("node {}", node_id))
            })
    }

    pub fn node_is_online(&self, node_id: NodeId) -> bool {
        self.config_snapshot().node_is_online(node_id)
    }

    /// Leader node of a channel, resolved through the channel's slot and
    /// its lazily created cluster config.
    pub async fn leader_of_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<NodeId, ClusterError> {
        let cfg = self.fetch_channel_config(channel_id, channel_type).await?;
        Ok(cfg.leader_id)
    }

    /// Loads a channel's cluster config from its slot, creating it on
    /// first access when this node leads the slot. The leader is chosen
    /// from the slot leader's view of online replicas.
    pub async fn fetch_channel_config(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<ChannelClusterConfig, ClusterError> {
        let slot_id = self.slot_id_of_channel(channel_id);
        let cfg = self.config_snapshot();
        let slot = cfg.slot(slot_id).cloned().ok_or_else(|| {
            ClusterError::NotFound(format!("slot {}", slot_id))
        })?;

        if let Some(existing) =
            self.meta.channel_cluster_config(channel_id, channel_type)?
        {
            return Ok(existing);
        }

        if slot.leader != self.opts.node_id {
            if slot.leader == 0 {
                return Err(ClusterError::NotLeader { hint: 0 });
            }
            let body = self
                .transport
                .request(
                    slot.leader,
                    PATH_CHANNEL_CONFIG,
                    encode_channel_config_req(channel_id, channel_type),
                )
                .await?;
            return ChannelClusterConfig::decode(&body);
        }

        // first access on the slot leader: online voters form the
        // replica set, smallest ids first, self preferred as channel
        // leader; online non-voting nodes ride along as learners
        let mut voters: Vec<NodeId> = cfg
            .nodes
            .iter()
            .filter(|n| n.online && n.allow_vote)
            .map(|n| n.id)
            .collect();
        voters.sort_unstable();
        let mut replicas: Vec<NodeId> = Vec::new();
        if voters.contains(&self.opts.node_id) {
            replicas.push(self.opts.node_id);
        }
        for id in voters {
            if replicas.len() >= self.opts.channel_replica_count as usize {
                break;
            }
            if !replicas.contains(&id) {
                replicas.push(id);
            }
        }
        if replicas.is_empty() {
            return Err(ClusterError::NotFound(format!(
                "no online replicas for channel {}",
                channel_id
            )));
        }
        let mut learners: Vec<NodeId> = cfg
            .nodes
            .iter()
            .filter(|n| n.online && !n.allow_vote)
            .map(|n| n.id)
            .collect();
        learners.sort_unstable();
        let channel_cfg = ChannelClusterConfig {
            channel_id: channel_id.into(),
            channel_type,
            replica_count: self.opts.channel_replica_count,
            replicas: replicas.clone(),
            learners,
            leader_id: replicas[0],
            term: 1,
        };
        self.meta.save_channel_cluster_config(&channel_cfg)?;
        self.ensure_channel_shard(&channel_cfg)?;
        Ok(channel_cfg)
    }

    /// Makes sure the local shard of a channel exists and follows the
    /// configured leader.
    pub fn ensure_channel_shard(
        &self,
        cfg: &ChannelClusterConfig,
    ) -> Result<Arc<Shard>, ClusterError> {
        let shard_no = channel_shard_no(&cfg.channel_id, cfg.channel_type);
        let shard = match self.shards.shard(&shard_no) {
            Some(shard) => shard,
            None => {
                let applied =
                    self.meta.applied_index(&shard_no)?;
                let shard = Shard::new_channel(
                    cfg,
                    applied,
                    self.shards.storage().clone(),
                    &self.opts,
                    self.shards.metrics().clone(),
                )?;
                self.shards.add_shard(shard.clone());
                shard
            }
        };
        if cfg.leader_id != 0 && shard.term() < cfg.term {
            shard.appoint_leader(cfg.term, cfg.leader_id)?;
        }
        Ok(shard)
    }

    /// Proposes metadata bytes onto a slot's log and waits for commit,
    /// forwarding to the slot leader when it is remote. Transport failures
    /// are retried once per known replica before surfacing.
    pub async fn propose_to_slot(
        &self,
        slot_id: SlotId,
        data: Vec<u8>,
    ) -> Result<LogIndex, ClusterError> {
        let cfg = self.config_snapshot();
        let slot = cfg.slot(slot_id).cloned().ok_or_else(|| {
            ClusterError::NotFound(format!("slot {}", slot_id))
        })?;

        let mut targets = Vec::with_capacity(slot.replicas.len());
        if slot.leader != 0 {
            targets.push(slot.leader);
        }
        for &replica in &slot.replicas {
            if !targets.contains(&replica) {
                targets.push(replica);
            }
        }
        if targets.is_empty() {
            return Err(ClusterError::NotLeader { hint: 0 });
        }

        let timeout = Duration::from_millis(self.opts.propose_timeout_ms);
        let mut last_err =
            ClusterError::TransportFailure("no replica reachable".into());
        for target in targets {
            let result = if target == self.opts.node_id {
                match self.shards.slot_shard(slot_id) {
                    Some(shard) => {
                        shard
                            .propose_and_wait_commit(data.clone(), timeout)
                            .await
                    }
                    None => Err(ClusterError::NotFound(format!(
                        "slot shard {}",
                        slot_id
                    ))),
                }
            } else {
                match time::timeout(
                    timeout,
                    self.transport.request(
                        target,
                        PATH_SLOT_PROPOSE,
                        encode_slot_propose_req(slot_id, &data),
                    ),
                )
                .await
                {
                    Ok(Ok(body)) => decode_log_index(&body),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(ClusterError::Timeout),
                }
            };
            match result {
                Ok(index) => return Ok(index),
                Err(
                    e @ (ClusterError::TransportFailure(_)
                    | ClusterError::NotLeader { .. }),
                ) => {
                    pf_debug!(
                        "slot {} propose via {} failed: {}",
                        slot_id,
                        target,
                        e
                    );
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Generic unary RPC with caller-supplied cancellation (drop the
    /// future to cancel).
    pub async fn request(
        &self,
        to: NodeId,
        path: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, ClusterError> {
        if to == self.opts.node_id {
            return self.handle_request(path, &body).await;
        }
        self.transport.request(to, path, body).await
    }

    /// Fire-and-forget typed message; unreliable.
    pub async fn send(&self, to: NodeId, msg: Message) {
        if let Err(e) = self.transport.send(to, msg).await {
            pf_warn!("send to {} failed: {}", to, e);
        }
    }

    /// Server side of the routing RPCs, shared by every transport
    /// implementation's inbound callback.
    pub async fn handle_request(
        &self,
        path: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, ClusterError> {
        match path {
            PATH_SLOT_PROPOSE => {
                let (slot_id, data) = decode_slot_propose_req(body)?;
                let shard =
                    self.shards.slot_shard(slot_id).ok_or_else(|| {
                        ClusterError::NotFound(format!("slot {}", slot_id))
                    })?;
                let timeout =
                    Duration::from_millis(self.opts.propose_timeout_ms);
                let index =
                    shard.propose_and_wait_commit(data, timeout).await?;
                Ok(encode_log_index(index))
            }
            PATH_SLOT_LOG_INFO => {
                let slot_ids = decode_slot_log_info_req(body)?;
                let infos = self.shards.slot_log_infos(&slot_ids);
                Ok(encode_slot_log_info_resp(&infos))
            }
            PATH_CHANNEL_CONFIG => {
                let (channel_id, channel_type) =
                    decode_channel_config_req(body)?;
                let cfg = self
                    .fetch_channel_config(&channel_id, channel_type)
                    .await?;
                cfg.encode()
            }
            _ => Err(ClusterError::NotFound(format!("path {}", path))),
        }
    }
}

#[cfg(test)]
mod route_tests {
    use super::*;
    use crate::config::Slot;
    use crate::metrics::Metrics;
    use crate::replica::Role;
    use crate::shard::{AckApplier, MemoryShardLogStorage, ShardManager};
    use crate::store::MemoryMetaStore;

    fn test_router_with(
        node_id: NodeId,
        cfg: ClusterConfig,
        transport: Arc<MemoryTransport>,
    ) -> Arc<Router> {
        let opts = Arc::new(Options {
            node_id,
            slot_count: 8,
            ..Default::default()
        });
        let shards = ShardManager::new(
            node_id,
            Duration::from_millis(10),
            Arc::new(MemoryShardLogStorage::new()),
            transport.clone(),
            Arc::new(AckApplier),
            Arc::new(Metrics::new()),
        );
        Router::new(
            opts,
            Arc::new(RwLock::new(cfg)),
            shards,
            transport,
            Arc::new(MemoryMetaStore::new()),
        )
    }

    fn test_router(node_id: NodeId, cfg: ClusterConfig) -> Arc<Router> {
        test_router_with(node_id, cfg, Arc::new(MemoryTransport::new()))
    }

    fn online_node(id: NodeId) -> Node {
        Node {
            id,
            online: true,
            allow_vote: true,
            ..Default::default()
        }
    }

    #[test]
    fn slot_hash_is_stable() {
        let a = slot_id_of_channel("general", 128);
        assert_eq!(a, slot_id_of_channel("general", 128));
        assert!(a < 128);
        assert_eq!(
            slot_id_of_channel("general", 128),
            crc32fast::hash(b"general") % 128
        );
    }

    #[test]
    fn rpc_codecs_round_trip() -> Result<(), ClusterError> {
        let (slot_id, data) =
            decode_slot_propose_req(&encode_slot_propose_req(7, b"cmd"))?;
        assert_eq!((slot_id, data.as_slice()), (7, b"cmd".as_slice()));

        assert_eq!(decode_log_index(&encode_log_index(99))?, 99);

        let ids = vec![1, 2, 30];
        assert_eq!(
            decode_slot_log_info_req(&encode_slot_log_info_req(&ids))?,
            ids
        );

        let infos = vec![
            SlotLogInfo {
                slot_id: 1,
                log_index: 10,
            },
            SlotLogInfo {
                slot_id: 2,
                log_index: 0,
            },
        ];
        assert_eq!(
            decode_slot_log_info_resp(&encode_slot_log_info_resp(&infos))?,
            infos
        );

        assert_eq!(
            decode_channel_config_req(&encode_channel_config_req(
                "general", 2
            ))?,
            ("general".to_string(), 2)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn channel_config_created_lazily_on_slot_leader() {
        let channel_id = "general";
        let slot_id = slot_id_of_channel(channel_id, 8);
        let cfg = ClusterConfig {
            version: 1,
            nodes: vec![online_node(1), online_node(2), online_node(3)],
            slots: vec![Slot {
                id: slot_id,
                leader: 1,
                term: 1,
                replicas: vec![1, 2, 3],
                replica_count: 3,
                ..Default::default()
            }],
        };
        let router = test_router(1, cfg);

        let ch_cfg = router
            .fetch_channel_config(channel_id, 2)
            .await
            .unwrap();
        assert_eq!(ch_cfg.leader_id, 1);
        assert_eq!(ch_cfg.replicas, vec![1, 2, 3]);
        assert_eq!(ch_cfg.term, 1);

        // second access loads the stored config
        let again = router
            .fetch_channel_config(channel_id, 2)
            .await
            .unwrap();
        assert_eq!(again, ch_cfg);

        // the channel shard exists and was appointed
        let shard = router
            .shards
            .shard(&channel_shard_no(channel_id, 2))
            .unwrap();
        assert!(shard.is_leader());
        assert_eq!(
            router.leader_of_channel(channel_id, 2).await.unwrap(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_voting_nodes_join_as_learners() {
        let channel_id = "general";
        let slot_id = slot_id_of_channel(channel_id, 8);
        let mut nodes =
            vec![online_node(1), online_node(2), online_node(3)];
        nodes.push(Node {
            id: 4,
            online: true,
            allow_vote: false,
            ..Default::default()
        });
        let cfg = ClusterConfig {
            version: 1,
            nodes,
            slots: vec![Slot {
                id: slot_id,
                leader: 1,
                term: 1,
                replicas: vec![1, 2, 3],
                replica_count: 3,
                ..Default::default()
            }],
        };
        let router = test_router(1, cfg);

        let ch_cfg = router
            .fetch_channel_config(channel_id, 2)
            .await
            .unwrap();
        assert_eq!(ch_cfg.replicas, vec![1, 2, 3]);
        assert_eq!(ch_cfg.learners, vec![4]);

        // the same config on node 4 yields a non-voting shard that no
        // appointment can promote
        let opts = Options {
            node_id: 4,
            ..Default::default()
        };
        let shard = Shard::new_channel(
            &ch_cfg,
            0,
            Arc::new(MemoryShardLogStorage::new()),
            &opts,
            Arc::new(Metrics::new()),
        )
        .unwrap();
        assert_eq!(shard.role(), Role::Learner);
        shard.appoint_leader(5, 4).unwrap();
        assert_eq!(shard.role(), Role::Learner);
        assert!(!shard.is_leader());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn propose_to_unknown_slot_is_not_found() {
        let router = test_router(1, ClusterConfig::default());
        let err = router.propose_to_slot(3, b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn propose_retries_next_replica_on_transport_failure() {
        // slot led by unreachable node 2; replica 3 answers
        let cfg = ClusterConfig {
            version: 1,
            nodes: vec![online_node(1), online_node(2), online_node(3)],
            slots: vec![Slot {
                id: 4,
                leader: 2,
                term: 1,
                replicas: vec![2, 3],
                replica_count: 2,
                ..Default::default()
            }],
        };
        let transport = Arc::new(MemoryTransport::new());
        transport.register_handler(3, PATH_SLOT_PROPOSE, |body| {
            let (slot_id, _) = decode_slot_propose_req(body)?;
            assert_eq!(slot_id, 4);
            Ok(encode_log_index(17))
        });
        let router = test_router_with(1, cfg, transport);
        let index = router.propose_to_slot(4, b"x".to_vec()).await.unwrap();
        assert_eq!(index, 17);
    }
}
