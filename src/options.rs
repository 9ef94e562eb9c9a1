//! Node-wide configuration parameters.

use serde::Deserialize;

use crate::replica::NodeId;
use crate::utils::ClusterError;
use crate::{logged_err, parsed_config};

/// Configuration parameters struct for a cluster node.
#[derive(Debug, Clone, Deserialize)]
pub struct Options {
    /// This node's id; must be non-zero and unique cluster-wide.
    pub node_id: NodeId,

    /// Address peers use for cluster traffic.
    pub cluster_addr: String,

    /// Address the public API is served on.
    pub api_addr: String,

    /// Static seed list of `id@addr` entries the config group bootstraps
    /// from.
    pub seed_nodes: Vec<String>,

    /// Number of slots the channel key space is partitioned into. Fixed
    /// for the lifetime of the cluster.
    pub slot_count: u32,

    /// Replicas per slot.
    pub slot_replica_count: u32,

    /// Replicas per channel.
    pub channel_replica_count: u32,

    /// Driver tick interval in milliseconds.
    pub tick_interval_ms: u64,

    /// Leader heartbeat cadence, in ticks.
    pub heartbeat_interval_ticks: u64,

    /// Follower re-sync cadence, in ticks.
    pub sync_interval_ticks: u64,

    /// Ticks of leader silence before a follower forgets it.
    pub election_timeout_ticks: u64,

    /// Default `propose_and_wait_commit` deadline in milliseconds.
    pub propose_timeout_ms: u64,

    /// Per-buffer capacity of each shard's receive queue.
    pub recv_queue_size: u64,

    /// Byte budget over queued log payloads (0 disables shedding).
    pub recv_queue_max_memory: u64,

    /// GC cadence for drained queue buffers (0 never, 1 every swap).
    pub recv_queue_lazy_free_cycle: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            node_id: 0,
            cluster_addr: "127.0.0.1:11110".into(),
            api_addr: "127.0.0.1:11120".into(),
            seed_nodes: vec![],
            slot_count: 128,
            slot_replica_count: 3,
            channel_replica_count: 3,
            tick_interval_ms: 100,
            heartbeat_interval_ticks: 2,
            sync_interval_ticks: 5,
            election_timeout_ticks: 30,
            propose_timeout_ms: 5000,
            recv_queue_size: 1024,
            recv_queue_max_memory: 64 << 20,
            recv_queue_lazy_free_cycle: 1,
        }
    }
}

impl Options {
    /// Composes options from defaults overlaid with a TOML string.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, ClusterError> {
        parsed_config!(config_str => Options;
                       node_id, cluster_addr, api_addr, seed_nodes,
                       slot_count, slot_replica_count,
                       channel_replica_count, tick_interval_ms,
                       heartbeat_interval_ticks, sync_interval_ticks,
                       election_timeout_ticks, propose_timeout_ms,
                       recv_queue_size, recv_queue_max_memory,
                       recv_queue_lazy_free_cycle)
    }

    /// Parses the seed list into `(node_id, addr)` pairs.
    pub fn seed_node_pairs(
        &self,
    ) -> Result<Vec<(NodeId, String)>, ClusterError> {
        let mut pairs = Vec::with_capacity(self.seed_nodes.len());
        for entry in &self.seed_nodes {
            let Some((id, addr)) = entry.split_once('@') else {
                return logged_err!("invalid seed node entry '{}'", entry);
            };
            let id = id.parse::<NodeId>().map_err(ClusterError::msg)?;
            pairs.push((id, addr.to_string()));
        }
        Ok(pairs)
    }
}
