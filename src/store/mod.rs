//! Channel metadata store: the pluggable key/value seam that materializes
//! committed commands, the applier that feeds it, and the propose-side
//! facade that turns metadata mutations into replicated commands.

pub mod cmd;

pub use cmd::ChannelCmdType;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::{Cmd, ChannelClusterConfig};
use crate::replica::{Log, LogIndex};
use crate::route::Router;
use crate::shard::LogApplier;
use crate::utils::ClusterError;
use crate::pf_warn;

/// Channel definition carried by `AddOrUpdateChannel`.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub channel_type: u8,
    pub ban: bool,
    pub large: bool,
    pub disband: bool,
}

/// Key/value store for channel metadata, populated only by applied
/// commands. Implementations must persist enough state to resume applying
/// from `applied_index + 1` after a crash.
pub trait ChannelMetaStore: Send + Sync {
    fn add_or_update_channel(
        &self,
        info: ChannelInfo,
    ) -> Result<(), ClusterError>;
    fn channel(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Option<ChannelInfo>, ClusterError>;
    fn exists_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<bool, ClusterError>;
    fn delete_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<(), ClusterError>;

    fn add_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: Vec<String>,
    ) -> Result<(), ClusterError>;
    fn remove_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: Vec<String>,
    ) -> Result<(), ClusterError>;
    fn remove_all_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<(), ClusterError>;
    fn subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Vec<String>, ClusterError>;
    fn exists_subscriber(
        &self,
        channel_id: &str,
        channel_type: u8,
        uid: &str,
    ) -> Result<bool, ClusterError>;

    fn add_denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: Vec<String>,
    ) -> Result<(), ClusterError>;
    fn remove_denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: Vec<String>,
    ) -> Result<(), ClusterError>;
    fn remove_all_denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<(), ClusterError>;
    fn denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Vec<String>, ClusterError>;
    fn exists_denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uid: &str,
    ) -> Result<bool, ClusterError>;

    fn add_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: Vec<String>,
    ) -> Result<(), ClusterError>;
    fn remove_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: Vec<String>,
    ) -> Result<(), ClusterError>;
    fn remove_all_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<(), ClusterError>;
    fn allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Vec<String>, ClusterError>;
    fn exists_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uid: &str,
    ) -> Result<bool, ClusterError>;
    fn has_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<bool, ClusterError>;

    fn save_channel_cluster_config(
        &self,
        cfg: &ChannelClusterConfig,
    ) -> Result<(), ClusterError>;
    fn channel_cluster_config(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Option<ChannelClusterConfig>, ClusterError>;

    fn set_applied_index(
        &self,
        shard_no: &str,
        index: LogIndex,
    ) -> Result<(), ClusterError>;
    fn applied_index(&self, shard_no: &str) -> Result<LogIndex, ClusterError>;
}

type ChannelKey = (String, u8);

#[derive(Default)]
struct MemoryMetaInner {
    channels: HashMap<ChannelKey, ChannelInfo>,
    subscribers: HashMap<ChannelKey, BTreeSet<String>>,
    denylist: HashMap<ChannelKey, BTreeSet<String>>,
    allowlist: HashMap<ChannelKey, BTreeSet<String>>,
    channel_cfgs: HashMap<ChannelKey, ChannelClusterConfig>,
    applied: HashMap<String, LogIndex>,
}

/// In-memory `ChannelMetaStore` used by tests and bootstrap.
#[derive(Default)]
pub struct MemoryMetaStore {
    inner: RwLock<MemoryMetaInner>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, MemoryMetaInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, MemoryMetaInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn key(channel_id: &str, channel_type: u8) -> ChannelKey {
    (channel_id.to_string(), channel_type)
}

macro_rules! member_set_impls {
    ($field:ident, $add:ident, $remove:ident, $remove_all:ident,
     $list:ident, $exists:ident) => {
        fn $add(
            &self,
            channel_id: &str,
            channel_type: u8,
            uids: Vec<String>,
        ) -> Result<(), ClusterError> {
            let mut inner = self.write();
            let set = inner
                .$field
                .entry(key(channel_id, channel_type))
                .or_default();
            set.extend(uids);
            Ok(())
        }

        fn $remove(
            &self,
            channel_id: &str,
            channel_type: u8,
            uids: Vec<String>,
        ) -> Result<(), ClusterError> {
            let mut inner = self.write();
            if let Some(set) =
                inner.$field.get_mut(&key(channel_id, channel_type))
            {
                for uid in &uids {
                    set.remove(uid);
                }
            }
            Ok(())
        }

        fn $remove_all(
            &self,
            channel_id: &str,
            channel_type: u8,
        ) -> Result<(), ClusterError> {
            self.write().$field.remove(&key(channel_id, channel_type));
            Ok(())
        }

        fn $list(
            &self,
            channel_id: &str,
            channel_type: u8,
        ) -> Result<Vec<String>, ClusterError> {
            Ok(self
                .read()
                .$field
                .get(&key(channel_id, channel_type))
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default())
        }

        fn $exists(
            &self,
            channel_id: &str,
            channel_type: u8,
            uid: &str,
        ) -> Result<bool, ClusterError> {
            Ok(self
                .read()
                .$field
                .get(&key(channel_id, channel_type))
                .map(|s| s.contains(uid))
                .unwrap_or(false))
        }
    };
}

impl ChannelMetaStore for MemoryMetaStore {
    fn add_or_update_channel(
        &self,
        info: ChannelInfo,
    ) -> Result<(), ClusterError> {
        self.write()
            .channels
            .insert(key(&info.channel_id, info.channel_type), info);
        Ok(())
    }

    fn channel(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Option<ChannelInfo>, ClusterError> {
        Ok(self
            .read()
            .channels
            .get(&key(channel_id, channel_type))
            .cloned())
    }

    fn exists_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<bool, ClusterError> {
        Ok(self
            .read()
            .channels
            .contains_key(&key(channel_id, channel_type)))
    }

    fn delete_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<(), ClusterError> {
        let k = key(channel_id, channel_type);
        let mut inner = self.write();
        inner.channels.remove(&k);
        inner.subscribers.remove(&k);
        inner.denylist.remove(&k);
        inner.allowlist.remove(&k);
        Ok(())
    }

    member_set_impls!(
        subscribers,
        add_subscribers,
        remove_subscribers,
        remove_all_subscribers,
        subscribers,
        exists_subscriber
    );

    member_set_impls!(
        denylist,
        add_denylist,
        remove_denylist,
        remove_all_denylist,
        denylist,
        exists_denylist
    );

    member_set_impls!(
        allowlist,
        add_allowlist,
        remove_allowlist,
        remove_all_allowlist,
        allowlist,
        exists_allowlist
    );

    fn has_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<bool, ClusterError> {
        Ok(self
            .read()
            .allowlist
            .get(&key(channel_id, channel_type))
            .map(|s| !s.is_empty())
            .unwrap_or(false))
    }

    fn save_channel_cluster_config(
        &self,
        cfg: &ChannelClusterConfig,
    ) -> Result<(), ClusterError> {
        self.write()
            .channel_cfgs
            .insert(key(&cfg.channel_id, cfg.channel_type), cfg.clone());
        Ok(())
    }

    fn channel_cluster_config(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Option<ChannelClusterConfig>, ClusterError> {
        Ok(self
            .read()
            .channel_cfgs
            .get(&key(channel_id, channel_type))
            .cloned())
    }

    fn set_applied_index(
        &self,
        shard_no: &str,
        index: LogIndex,
    ) -> Result<(), ClusterError> {
        self.write().applied.insert(shard_no.into(), index);
        Ok(())
    }

    fn applied_index(
        &self,
        shard_no: &str,
    ) -> Result<LogIndex, ClusterError> {
        Ok(self.read().applied.get(shard_no).copied().unwrap_or(0))
    }
}

/// Applies slot-group commands to the metadata store. Unknown command
/// types are skipped (forward compatibility), never fatal.
pub struct StoreApplier {
    meta: Arc<dyn ChannelMetaStore>,
}

impl StoreApplier {
    pub fn new(meta: Arc<dyn ChannelMetaStore>) -> Self {
        StoreApplier { meta }
    }

    fn apply_one(&self, log: &Log) -> Result<(), ClusterError> {
        let cmd = Cmd::decode(&log.data)?;
        let Some(cmd_type) = ChannelCmdType::from_u16(cmd.cmd_type) else {
            pf_warn!("skipping unknown channel cmd type {}", cmd.cmd_type);
            return Ok(());
        };
        match cmd_type {
            ChannelCmdType::AddSubscribers => {
                let (cid, cty, uids) = cmd::decode_members(&cmd.data)?;
                self.meta.add_subscribers(&cid, cty, uids)
            }
            ChannelCmdType::RemoveSubscribers => {
                let (cid, cty, uids) = cmd::decode_members(&cmd.data)?;
                self.meta.remove_subscribers(&cid, cty, uids)
            }
            ChannelCmdType::RemoveAllSubscribers => {
                let (cid, cty) = cmd::decode_channel(&cmd.data)?;
                self.meta.remove_all_subscribers(&cid, cty)
            }
            ChannelCmdType::AddOrUpdateChannel => {
                let info = cmd::decode_channel_info(&cmd.data)?;
                self.meta.add_or_update_channel(info)
            }
            ChannelCmdType::DeleteChannel => {
                let (cid, cty) = cmd::decode_channel(&cmd.data)?;
                self.meta.delete_channel(&cid, cty)
            }
            ChannelCmdType::AddDenylist => {
                let (cid, cty, uids) = cmd::decode_members(&cmd.data)?;
                self.meta.add_denylist(&cid, cty, uids)
            }
            ChannelCmdType::RemoveDenylist => {
                let (cid, cty, uids) = cmd::decode_members(&cmd.data)?;
                self.meta.remove_denylist(&cid, cty, uids)
            }
            ChannelCmdType::RemoveAllDenylist => {
                let (cid, cty) = cmd::decode_channel(&cmd.data)?;
                self.meta.remove_all_denylist(&cid, cty)
            }
            ChannelCmdType::AddAllowlist => {
                let (cid, cty, uids) = cmd::decode_members(&cmd.data)?;
                self.meta.add_allowlist(&cid, cty, uids)
            }
            ChannelCmdType::RemoveAllowlist => {
                let (cid, cty, uids) = cmd::decode_members(&cmd.data)?;
                self.meta.remove_allowlist(&cid, cty, uids)
            }
            ChannelCmdType::RemoveAllAllowlist => {
                let (cid, cty) = cmd::decode_channel(&cmd.data)?;
                self.meta.remove_all_allowlist(&cid, cty)
            }
        }
    }
}

impl LogApplier for StoreApplier {
    fn apply(
        &self,
        shard_no: &str,
        logs: &[Log],
    ) -> Result<LogIndex, ClusterError> {
        let mut applied = self.meta.applied_index(shard_no)?;
        for log in logs {
            if log.index <= applied {
                continue; // at-least-once redelivery, dedup by index
            }
            self.apply_one(log)?;
            applied = log.index;
            self.meta.set_applied_index(shard_no, applied)?;
        }
        Ok(applied)
    }
}

/// Propose-side facade: turns channel metadata mutations into replicated
/// slot commands and serves reads from the local store.
pub struct MetaStore {
    router: Arc<Router>,
    meta: Arc<dyn ChannelMetaStore>,
}

impl MetaStore {
    pub fn new(router: Arc<Router>, meta: Arc<dyn ChannelMetaStore>) -> Self {
        MetaStore { router, meta }
    }

    async fn propose_channel_cmd(
        &self,
        channel_id: &str,
        cmd_type: ChannelCmdType,
        data: Vec<u8>,
    ) -> Result<LogIndex, ClusterError> {
        let cmd = Cmd::with_type(cmd_type as u16, data);
        let slot_id = self.router.slot_id_of_channel(channel_id);
        self.router.propose_to_slot(slot_id, cmd.encode()).await
    }

    pub async fn add_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            channel_id,
            ChannelCmdType::AddSubscribers,
            cmd::encode_members(channel_id, channel_type, uids),
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            channel_id,
            ChannelCmdType::RemoveSubscribers,
            cmd::encode_members(channel_id, channel_type, uids),
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_all_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            channel_id,
            ChannelCmdType::RemoveAllSubscribers,
            cmd::encode_channel(channel_id, channel_type),
        )
        .await
        .map(|_| ())
    }

    pub async fn add_or_update_channel(
        &self,
        info: &ChannelInfo,
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            &info.channel_id,
            ChannelCmdType::AddOrUpdateChannel,
            cmd::encode_channel_info(info)?,
        )
        .await
        .map(|_| ())
    }

    pub async fn delete_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            channel_id,
            ChannelCmdType::DeleteChannel,
            cmd::encode_channel(channel_id, channel_type),
        )
        .await
        .map(|_| ())
    }

    pub async fn add_denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            channel_id,
            ChannelCmdType::AddDenylist,
            cmd::encode_members(channel_id, channel_type, uids),
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            channel_id,
            ChannelCmdType::RemoveDenylist,
            cmd::encode_members(channel_id, channel_type, uids),
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_all_denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            channel_id,
            ChannelCmdType::RemoveAllDenylist,
            cmd::encode_channel(channel_id, channel_type),
        )
        .await
        .map(|_| ())
    }

    pub async fn add_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            channel_id,
            ChannelCmdType::AddAllowlist,
            cmd::encode_members(channel_id, channel_type, uids),
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            channel_id,
            ChannelCmdType::RemoveAllowlist,
            cmd::encode_members(channel_id, channel_type, uids),
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_all_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<(), ClusterError> {
        self.propose_channel_cmd(
            channel_id,
            ChannelCmdType::RemoveAllAllowlist,
            cmd::encode_channel(channel_id, channel_type),
        )
        .await
        .map(|_| ())
    }

    pub fn subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Vec<String>, ClusterError> {
        self.meta.subscribers(channel_id, channel_type)
    }

    pub fn exists_subscriber(
        &self,
        channel_id: &str,
        channel_type: u8,
        uid: &str,
    ) -> Result<bool, ClusterError> {
        self.meta.exists_subscriber(channel_id, channel_type, uid)
    }

    pub fn channel(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Option<ChannelInfo>, ClusterError> {
        self.meta.channel(channel_id, channel_type)
    }

    pub fn exists_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<bool, ClusterError> {
        self.meta.exists_channel(channel_id, channel_type)
    }

    pub fn denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Vec<String>, ClusterError> {
        self.meta.denylist(channel_id, channel_type)
    }

    pub fn exists_denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uid: &str,
    ) -> Result<bool, ClusterError> {
        self.meta.exists_denylist(channel_id, channel_type, uid)
    }

    pub fn allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Vec<String>, ClusterError> {
        self.meta.allowlist(channel_id, channel_type)
    }

    pub fn exists_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uid: &str,
    ) -> Result<bool, ClusterError> {
        self.meta.exists_allowlist(channel_id, channel_type, uid)
    }

    pub fn has_allowlist(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<bool, ClusterError> {
        self.meta.has_allowlist(channel_id, channel_type)
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;

    fn cmd_log(index: u64, ty: ChannelCmdType, data: Vec<u8>) -> Log {
        Log {
            index,
            term: 1,
            data: Cmd::with_type(ty as u16, data).encode(),
        }
    }

    #[test]
    fn memory_store_member_sets() -> Result<(), ClusterError> {
        let store = MemoryMetaStore::new();
        store.add_subscribers(
            "general",
            2,
            vec!["u1".into(), "u2".into()],
        )?;
        assert!(store.exists_subscriber("general", 2, "u1")?);
        store.remove_subscribers("general", 2, vec!["u1".into()])?;
        assert!(!store.exists_subscriber("general", 2, "u1")?);
        assert_eq!(store.subscribers("general", 2)?, vec!["u2"]);
        store.remove_all_subscribers("general", 2)?;
        assert!(store.subscribers("general", 2)?.is_empty());

        assert!(!store.has_allowlist("general", 2)?);
        store.add_allowlist("general", 2, vec!["a".into()])?;
        assert!(store.has_allowlist("general", 2)?);
        Ok(())
    }

    #[test]
    fn applier_routes_each_cmd() -> Result<(), ClusterError> {
        let meta = Arc::new(MemoryMetaStore::new());
        let applier = StoreApplier::new(meta.clone());

        let logs = vec![
            cmd_log(
                1,
                ChannelCmdType::AddOrUpdateChannel,
                cmd::encode_channel_info(&ChannelInfo {
                    channel_id: "general".into(),
                    channel_type: 2,
                    ..Default::default()
                })?,
            ),
            cmd_log(
                2,
                ChannelCmdType::AddSubscribers,
                cmd::encode_members("general", 2, &["u1".into()]),
            ),
            cmd_log(
                3,
                ChannelCmdType::AddDenylist,
                cmd::encode_members("general", 2, &["bad".into()]),
            ),
            cmd_log(
                4,
                ChannelCmdType::AddAllowlist,
                cmd::encode_members("general", 2, &["ok".into()]),
            ),
        ];
        let applied = applier.apply("slot-3", &logs)?;
        assert_eq!(applied, 4);
        assert!(meta.exists_channel("general", 2)?);
        assert!(meta.exists_subscriber("general", 2, "u1")?);
        assert!(meta.exists_denylist("general", 2, "bad")?);
        assert!(meta.exists_allowlist("general", 2, "ok")?);
        assert_eq!(meta.applied_index("slot-3")?, 4);

        // redelivery of already-applied indices is a no-op
        let applied = applier.apply("slot-3", &logs)?;
        assert_eq!(applied, 4);

        let more = vec![cmd_log(
            5,
            ChannelCmdType::DeleteChannel,
            cmd::encode_channel("general", 2),
        )];
        applier.apply("slot-3", &more)?;
        assert!(!meta.exists_channel("general", 2)?);
        assert!(meta.subscribers("general", 2)?.is_empty());
        Ok(())
    }

    #[test]
    fn applier_skips_unknown_cmd_types() -> Result<(), ClusterError> {
        let meta = Arc::new(MemoryMetaStore::new());
        let applier = StoreApplier::new(meta.clone());
        let logs = vec![Log {
            index: 1,
            term: 1,
            data: Cmd::with_type(999, vec![1, 2, 3]).encode(),
        }];
        assert_eq!(applier.apply("slot-1", &logs)?, 1);
        Ok(())
    }
}
