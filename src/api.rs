//! Admin info views: typed, JSON-serializable responses computed over the
//! cluster config and shard state. HTTP routing lives outside the core;
//! handlers call these and serialize the results.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::config::{ClusterConfig, Node, Slot};
use crate::replica::{LogIndex, NodeId, SlotId, Term};
use crate::route::{
    decode_slot_log_info_resp, encode_slot_log_info_req, Router,
    PATH_SLOT_LOG_INFO,
};
use crate::shard::{
    channel_shard_no, slot_shard_no, ShardLogStorage, ShardManager,
};
use crate::store::ChannelMetaStore;
use crate::utils::ClusterError;

/// `GET /nodes` response.
#[derive(Debug, Serialize)]
pub struct NodeConfigTotal {
    pub total: usize,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Serialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub is_leader: bool,
    pub cluster_addr: String,
    pub api_server_addr: String,
    pub online: bool,
    pub offline_count: u32,
    /// Unix seconds of the last offline transition (0 if never).
    pub last_offline: u64,
    pub allow_vote: bool,
    pub slot_count: usize,
}

impl NodeConfig {
    fn from_node(node: &Node, cfg: &ClusterConfig, leader_id: NodeId) -> Self {
        NodeConfig {
            id: node.id,
            is_leader: node.id == leader_id,
            cluster_addr: node.cluster_addr.clone(),
            api_server_addr: node.api_addr.clone(),
            online: node.online,
            offline_count: node.offline_count,
            last_offline: node.last_offline,
            allow_vote: node.allow_vote,
            slot_count: cfg.node_slot_count(node.id),
        }
    }
}

/// `GET /channels/:id/:type/config` response.
#[derive(Debug, Serialize)]
pub struct ChannelClusterConfigResp {
    pub channel_id: String,
    pub channel_type: u8,
    pub slot_id: SlotId,
    pub slot_leader_id: NodeId,
    pub replica_count: u32,
    pub replicas: Vec<NodeId>,
    pub leader_id: NodeId,
    pub term: Term,
    pub max_message_seq: LogIndex,
    /// Unix nanoseconds of the last message-log append (0 if never).
    pub last_append_time: u64,
}

/// `GET /slots/:id/config` response.
#[derive(Debug, Serialize)]
pub struct SlotClusterConfigResp {
    pub id: SlotId,
    pub leader_id: NodeId,
    pub term: Term,
    pub replicas: Vec<NodeId>,
    pub replica_count: u32,
    pub log_max_index: LogIndex,
    pub leader_log_max_index: LogIndex,
    pub applied_index: LogIndex,
}

/// Computes admin responses over the live cluster state.
pub struct AdminApi {
    node_id: NodeId,
    config: Arc<RwLock<ClusterConfig>>,
    shards: Arc<ShardManager>,
    meta: Arc<dyn ChannelMetaStore>,
    router: Arc<Router>,
}

impl AdminApi {
    pub fn new(
        node_id: NodeId,
        config: Arc<RwLock<ClusterConfig>>,
        shards: Arc<ShardManager>,
        meta: Arc<dyn ChannelMetaStore>,
        router: Arc<Router>,
    ) -> Self {
        AdminApi {
            node_id,
            config,
            shards,
            meta,
            router,
        }
    }

    fn config_snapshot(&self) -> ClusterConfig {
        match self.config.read() {
            Ok(cfg) => cfg.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    fn slot(&self, slot_id: SlotId) -> Result<Slot, ClusterError> {
        self.config_snapshot()
            .slot(slot_id)
            .cloned()
            .ok_or_else(|| {
                ClusterError::NotFound(format!("slot {}", slot_id))
            })
    }

    /// All known nodes, with the given config-group leader flagged.
    pub fn cluster_info(&self, leader_id: NodeId) -> NodeConfigTotal {
        let cfg = self.config_snapshot();
        let nodes: Vec<NodeConfig> = cfg
            .nodes
            .iter()
            .map(|n| NodeConfig::from_node(n, &cfg, leader_id))
            .collect();
        NodeConfigTotal {
            total: nodes.len(),
            nodes,
        }
    }

    /// A channel's replication layout plus its message-log high-water
    /// marks.
    pub async fn channel_config(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<ChannelClusterConfigResp, ClusterError> {
        let slot_id = self.router.slot_id_of_channel(channel_id);
        let slot = self.slot(slot_id)?;
        let cfg = self
            .router
            .fetch_channel_config(channel_id, channel_type)
            .await?;
        let shard_no = channel_shard_no(channel_id, channel_type);
        let (max_message_seq, last_append_time) = self
            .shards
            .storage()
            .last_index_and_append_time(&shard_no)?;
        Ok(ChannelClusterConfigResp {
            channel_id: cfg.channel_id,
            channel_type: cfg.channel_type,
            slot_id,
            slot_leader_id: slot.leader,
            replica_count: cfg.replica_count,
            replicas: cfg.replicas,
            leader_id: cfg.leader_id,
            term: cfg.term,
            max_message_seq,
            last_append_time,
        })
    }

    /// A slot's replication layout plus local/leader log tips and the
    /// applied index.
    pub async fn slot_config(
        &self,
        slot_id: SlotId,
    ) -> Result<SlotClusterConfigResp, ClusterError> {
        let slot = self.slot(slot_id)?;
        let shard_no = slot_shard_no(slot_id);
        let log_max_index =
            self.shards.storage().last_index(&shard_no)?;
        let applied_index = self.meta.applied_index(&shard_no)?;
        let leader_log_max_index =
            self.slot_max_log_index(&slot, log_max_index).await?;
        Ok(SlotClusterConfigResp {
            id: slot.id,
            leader_id: slot.leader,
            term: slot.term,
            replicas: slot.replicas.clone(),
            replica_count: slot.replica_count,
            log_max_index,
            leader_log_max_index,
            applied_index,
        })
    }

    async fn slot_max_log_index(
        &self,
        slot: &Slot,
        local_max: LogIndex,
    ) -> Result<LogIndex, ClusterError> {
        if slot.leader == 0 || slot.leader == self.node_id {
            return Ok(local_max);
        }
        let body = self
            .router
            .request(
                slot.leader,
                PATH_SLOT_LOG_INFO,
                encode_slot_log_info_req(&[slot.id]),
            )
            .await?;
        let infos = decode_slot_log_info_resp(&body)?;
        Ok(infos.first().map(|i| i.log_index).unwrap_or(0))
    }
}

#[cfg(test)]
mod api_tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::options::Options;
    use crate::route::{slot_id_of_channel, MemoryTransport};
    use crate::shard::{
        AckApplier, MemoryShardLogStorage, ShardManager,
    };
    use crate::store::MemoryMetaStore;
    use tokio::time::Duration;

    fn test_api(node_id: NodeId, cfg: ClusterConfig) -> AdminApi {
        let opts = Arc::new(Options {
            node_id,
            slot_count: 8,
            ..Default::default()
        });
        let transport = Arc::new(MemoryTransport::new());
        let shards = ShardManager::new(
            node_id,
            Duration::from_millis(10),
            Arc::new(MemoryShardLogStorage::new()),
            transport.clone(),
            Arc::new(AckApplier),
            Arc::new(Metrics::new()),
        );
        let config = Arc::new(RwLock::new(cfg));
        let meta = Arc::new(MemoryMetaStore::new());
        let router = Router::new(
            opts,
            config.clone(),
            shards.clone(),
            transport,
            meta.clone(),
        );
        AdminApi::new(node_id, config, shards, meta, router)
    }

    fn online_node(id: NodeId) -> Node {
        Node {
            id,
            cluster_addr: format!("10.0.0.{}:11110", id),
            api_addr: format!("10.0.0.{}:11120", id),
            online: true,
            allow_vote: true,
            ..Default::default()
        }
    }

    #[test]
    fn cluster_info_counts_slots_and_flags_leader() {
        let cfg = ClusterConfig {
            version: 1,
            nodes: vec![online_node(1), online_node(2)],
            slots: vec![
                Slot {
                    id: 0,
                    replicas: vec![1, 2],
                    ..Default::default()
                },
                Slot {
                    id: 1,
                    replicas: vec![1],
                    ..Default::default()
                },
            ],
        };
        let api = test_api(1, cfg);
        let info = api.cluster_info(2);
        assert_eq!(info.total, 2);
        let n1 = info.nodes.iter().find(|n| n.id == 1).unwrap();
        assert!(!n1.is_leader);
        assert_eq!(n1.slot_count, 2);
        let n2 = info.nodes.iter().find(|n| n.id == 2).unwrap();
        assert!(n2.is_leader);
        assert_eq!(n2.slot_count, 1);
        // responses serialize to JSON
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"total\":2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slot_and_channel_config_views() {
        let channel_id = "general";
        let slot_id = slot_id_of_channel(channel_id, 8);
        let cfg = ClusterConfig {
            version: 1,
            nodes: vec![online_node(1)],
            slots: vec![Slot {
                id: slot_id,
                leader: 1,
                term: 2,
                replicas: vec![1],
                replica_count: 1,
                ..Default::default()
            }],
        };
        let api = test_api(1, cfg);

        let resp = api.slot_config(slot_id).await.unwrap();
        assert_eq!(resp.id, slot_id);
        assert_eq!(resp.leader_id, 1);
        assert_eq!(resp.log_max_index, 0);
        assert_eq!(resp.leader_log_max_index, 0);

        let resp = api.channel_config(channel_id, 2).await.unwrap();
        assert_eq!(resp.channel_id, channel_id);
        assert_eq!(resp.slot_id, slot_id);
        assert_eq!(resp.slot_leader_id, 1);
        assert_eq!(resp.leader_id, 1);
        assert_eq!(resp.max_message_seq, 0);

        assert!(matches!(
            api.slot_config(99).await.unwrap_err(),
            ClusterError::NotFound(_)
        ));
    }
}
