//! Versioned cluster configuration: nodes, slots, and per-channel replica
//! sets. The config is owned by a distinguished replication group; every
//! mutation flows through it as a command and bumps the version by one.

pub mod cmd;

pub use cmd::{Cmd, ConfigCmdType, CMD_VERSION};

use serde::{Deserialize, Serialize};

use crate::replica::{NodeId, SlotId, Term};
use crate::utils::ClusterError;

/// Shard number of the distinguished config replication group.
pub const CONFIG_SHARD_NO: &str = "clusterconfig";

/// Lifecycle status of a node.
#[derive(
    Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub enum NodeStatus {
    #[default]
    Unknown,
    Joining,
    Joined,
}

/// Descriptor of a cluster member. Nodes are added once via a join
/// command and never removed by the core.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub cluster_addr: String,
    pub api_addr: String,
    pub online: bool,
    pub offline_count: u32,
    /// Unix seconds of the last transition to offline (0 if never).
    pub last_offline: u64,
    pub allow_vote: bool,
    pub status: NodeStatus,
}

/// Replication status of a slot.
#[derive(
    Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub enum SlotStatus {
    #[default]
    Normal,
    Candidate,
    Migrating,
}

/// Descriptor of a slot: one shard of the channel-metadata key space.
/// Slots are created once during bootstrap and never deleted.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub leader: NodeId,
    pub term: Term,
    pub replicas: Vec<NodeId>,
    pub replica_count: u32,
    pub status: SlotStatus,
    /// Set while a `Migrating` slot moves between nodes.
    pub migrate_from: NodeId,
    pub migrate_to: NodeId,
}

/// Per-channel replication config, created lazily on first access and
/// stored in the containing slot's metadata store.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ChannelClusterConfig {
    pub channel_id: String,
    pub channel_type: u8,
    pub replica_count: u32,
    pub replicas: Vec<NodeId>,
    pub learners: Vec<NodeId>,
    pub leader_id: NodeId,
    pub term: Term,
}

impl ChannelClusterConfig {
    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ClusterError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Snapshot of the whole cluster layout. Monotonically versioned.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub version: u64,
    pub nodes: Vec<Node>,
    pub slots: Vec<Slot>,
}

impl ClusterConfig {
    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ClusterError> {
        Ok(rmp_serde::from_slice(data)?)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn node_is_online(&self, id: NodeId) -> bool {
        self.node(id).map(|n| n.online).unwrap_or(false)
    }

    /// Slots whose replica set contains the node.
    pub fn node_slot_count(&self, id: NodeId) -> usize {
        self.slots
            .iter()
            .filter(|s| s.replicas.contains(&id))
            .count()
    }

    fn upsert_node(&mut self, node: Node) {
        match self.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    fn upsert_slot(&mut self, slot: Slot) {
        match self.slots.iter_mut().find(|s| s.id == slot.id) {
            Some(existing) => *existing = slot,
            None => self.slots.push(slot),
        }
    }

    /// Applies one replicated command. Any accepted mutation bumps the
    /// version by exactly one.
    pub fn apply_cmd(&mut self, cmd: &Cmd) -> Result<(), ClusterError> {
        let cmd_type = ConfigCmdType::from_u16(cmd.cmd_type).ok_or_else(
            || {
                ClusterError::Other(format!(
                    "unknown config cmd type {}",
                    cmd.cmd_type
                ))
            },
        )?;
        match cmd_type {
            ConfigCmdType::ConfigInit => {
                // bootstrap: accepted even without prior state
                let init = ClusterConfig::decode(&cmd.data)?;
                self.nodes = init.nodes;
                self.slots = init.slots;
            }
            ConfigCmdType::ApiServerAddrChange => {
                let (node_id, api_addr) =
                    cmd::decode_api_server_addr_change(&cmd.data)?;
                let node =
                    self.nodes.iter_mut().find(|n| n.id == node_id);
                match node {
                    Some(node) => node.api_addr = api_addr,
                    None => {
                        return Err(ClusterError::NotFound(format!(
                            "node {}",
                            node_id
                        )))
                    }
                }
            }
            ConfigCmdType::NodeJoin => {
                let node = cmd::decode_node(&cmd.data)?;
                self.upsert_node(node);
            }
            ConfigCmdType::NodeJoining => {
                let node_id = cmd::decode_node_id(&cmd.data)?;
                if let Some(node) =
                    self.nodes.iter_mut().find(|n| n.id == node_id)
                {
                    node.status = NodeStatus::Joining;
                }
            }
            ConfigCmdType::NodeJoined => {
                let (node_id, slots) = cmd::decode_node_joined(&cmd.data)?;
                if let Some(node) =
                    self.nodes.iter_mut().find(|n| n.id == node_id)
                {
                    node.status = NodeStatus::Joined;
                }
                for slot in slots {
                    self.upsert_slot(slot);
                }
            }
            ConfigCmdType::NodeOnlineStatusChange => {
                let (node_id, online) =
                    cmd::decode_node_online_status_change(&cmd.data)?;
                let node =
                    self.nodes.iter_mut().find(|n| n.id == node_id);
                match node {
                    Some(node) => {
                        if node.online && !online {
                            node.offline_count += 1;
                            node.last_offline = now_unix_secs();
                        }
                        node.online = online;
                    }
                    None => {
                        return Err(ClusterError::NotFound(format!(
                            "node {}",
                            node_id
                        )))
                    }
                }
            }
            ConfigCmdType::SlotMigrate => {
                let (slot_id, from, to) =
                    cmd::decode_slot_migrate(&cmd.data)?;
                let slot =
                    self.slots.iter_mut().find(|s| s.id == slot_id);
                match slot {
                    Some(slot) => {
                        slot.status = SlotStatus::Migrating;
                        slot.migrate_from = from;
                        slot.migrate_to = to;
                    }
                    None => {
                        return Err(ClusterError::NotFound(format!(
                            "slot {}",
                            slot_id
                        )))
                    }
                }
            }
            ConfigCmdType::SlotUpdate => {
                let slots = cmd::decode_slots(&cmd.data)?;
                for slot in slots {
                    self.upsert_slot(slot);
                }
            }
            ConfigCmdType::NodeStatusChange => {
                let (node_id, status) =
                    cmd::decode_node_status_change(&cmd.data)?;
                if let Some(node) =
                    self.nodes.iter_mut().find(|n| n.id == node_id)
                {
                    node.status = status;
                }
            }
        }
        self.version += 1;
        Ok(())
    }
}

fn now_unix_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
