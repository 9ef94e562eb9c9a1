//! Public interface to the Volary cluster core library: slot-partitioned,
//! appointed-leader log replication for messaging-server channel metadata.

pub mod utils;

pub mod api;
pub mod config;
pub mod event;
pub mod metrics;
pub mod options;
pub mod replica;
pub mod route;
pub mod shard;
pub mod store;

pub use api::{AdminApi, ChannelClusterConfigResp, NodeConfigTotal, SlotClusterConfigResp};
pub use config::{
    ChannelClusterConfig, ClusterConfig, Cmd, ConfigCmdType, Node, Slot,
    SlotStatus, CONFIG_SHARD_NO,
};
pub use event::{
    ClusterApplier, ClusterEvent, ConfigApplier, EventCoordinator, NodeEvent,
    NodeEventType, SlotEvent, SlotEventType,
};
pub use metrics::{Metrics, MetricsSnapshot};
pub use options::Options;
pub use replica::{
    Log, LogIndex, Message, MsgType, NodeId, Ready, Replica, ReplicaOpts,
    Role, SlotId, Term,
};
pub use route::{MemoryTransport, Router, Transport};
pub use shard::{
    channel_shard_no, slot_shard_no, AckApplier, LogApplier,
    MemoryShardLogStorage, MessageQueue, Shard, ShardLogStorage,
    ShardManager, SlotLogInfo,
};
pub use store::{
    ChannelCmdType, ChannelInfo, ChannelMetaStore, MemoryMetaStore,
    MetaStore, StoreApplier,
};
pub use utils::ClusterError;
