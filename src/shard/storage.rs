//! Durable per-shard log storage seam and its in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::replica::Log;
use crate::utils::ClusterError;

/// Append-only per-shard log storage with random read by index.
///
/// Implementations may block on I/O; callers never invoke these while
/// holding a shard's step lock. Indices are 1-based; `read` covers
/// `[lo, hi)`; `truncate_to` removes entries with index >= `index`.
pub trait ShardLogStorage: Send + Sync {
    fn append(&self, shard_no: &str, logs: &[Log]) -> Result<(), ClusterError>;

    fn last_index(&self, shard_no: &str) -> Result<u64, ClusterError>;

    fn read(
        &self,
        shard_no: &str,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<Log>, ClusterError>;

    fn truncate_to(&self, shard_no: &str, index: u64)
        -> Result<(), ClusterError>;

    /// Last index plus the wall-clock nanosecond timestamp of the most
    /// recent append (0 if never appended).
    fn last_index_and_append_time(
        &self,
        shard_no: &str,
    ) -> Result<(u64, u64), ClusterError>;
}

#[derive(Default)]
struct MemoryShardLog {
    logs: Vec<Log>,
    last_append_ns: u64,
}

/// In-memory `ShardLogStorage`, used by tests and bootstrap.
#[derive(Default)]
pub struct MemoryShardLogStorage {
    shards: RwLock<HashMap<String, MemoryShardLog>>,
}

impl MemoryShardLogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl ShardLogStorage for MemoryShardLogStorage {
    fn append(&self, shard_no: &str, logs: &[Log]) -> Result<(), ClusterError> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut shards = self
            .shards
            .write()
            .map_err(|e| ClusterError::StorageFailure(e.to_string()))?;
        let shard = shards.entry(shard_no.into()).or_default();
        let first = logs[0].index;
        let expect = shard.logs.last().map(|l| l.index + 1).unwrap_or(1);
        if first > expect {
            return Err(ClusterError::StorageFailure(format!(
                "append gap on {}: first {} expected {}",
                shard_no, first, expect
            )));
        }
        // re-appends of an overlapping suffix overwrite in place
        shard.logs.truncate((first - 1) as usize);
        shard.logs.extend_from_slice(logs);
        shard.last_append_ns = now_ns();
        Ok(())
    }

    fn last_index(&self, shard_no: &str) -> Result<u64, ClusterError> {
        let shards = self
            .shards
            .read()
            .map_err(|e| ClusterError::StorageFailure(e.to_string()))?;
        Ok(shards
            .get(shard_no)
            .and_then(|s| s.logs.last())
            .map(|l| l.index)
            .unwrap_or(0))
    }

    fn read(
        &self,
        shard_no: &str,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<Log>, ClusterError> {
        if lo >= hi || lo == 0 {
            return Ok(vec![]);
        }
        let shards = self
            .shards
            .read()
            .map_err(|e| ClusterError::StorageFailure(e.to_string()))?;
        let Some(shard) = shards.get(shard_no) else {
            return Ok(vec![]);
        };
        let last = shard.logs.len() as u64;
        let lo = (lo - 1).min(last);
        let hi = (hi - 1).min(last);
        Ok(shard.logs[lo as usize..hi as usize].to_vec())
    }

    fn truncate_to(
        &self,
        shard_no: &str,
        index: u64,
    ) -> Result<(), ClusterError> {
        let mut shards = self
            .shards
            .write()
            .map_err(|e| ClusterError::StorageFailure(e.to_string()))?;
        if let Some(shard) = shards.get_mut(shard_no) {
            shard.logs.truncate(index.saturating_sub(1) as usize);
        }
        Ok(())
    }

    fn last_index_and_append_time(
        &self,
        shard_no: &str,
    ) -> Result<(u64, u64), ClusterError> {
        let shards = self
            .shards
            .read()
            .map_err(|e| ClusterError::StorageFailure(e.to_string()))?;
        Ok(shards
            .get(shard_no)
            .map(|s| {
                (
                    s.logs.last().map(|l| l.index).unwrap_or(0),
                    s.last_append_ns,
                )
            })
            .unwrap_or((0, 0)))
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;

    fn mk_logs(lo: u64, hi: u64, term: u32) -> Vec<Log> {
        (lo..hi)
            .map(|index| Log {
                index,
                term,
                data: format!("e{}", index).into_bytes(),
            })
            .collect()
    }

    #[test]
    fn append_read_round_trip() -> Result<(), ClusterError> {
        let st = MemoryShardLogStorage::new();
        st.append("slot-1", &mk_logs(1, 6, 1))?;
        assert_eq!(st.last_index("slot-1")?, 5);
        assert_eq!(st.read("slot-1", 2, 4)?, mk_logs(2, 4, 1));
        assert_eq!(st.read("slot-1", 2, 2)?, vec![]);
        assert_eq!(st.last_index("slot-2")?, 0);
        Ok(())
    }

    #[test]
    fn append_overwrites_overlap() -> Result<(), ClusterError> {
        let st = MemoryShardLogStorage::new();
        st.append("slot-1", &mk_logs(1, 6, 1))?;
        st.append("slot-1", &mk_logs(4, 7, 2))?;
        assert_eq!(st.last_index("slot-1")?, 6);
        assert_eq!(st.read("slot-1", 4, 5)?[0].term, 2);
        Ok(())
    }

    #[test]
    fn append_gap_rejected() -> Result<(), ClusterError> {
        let st = MemoryShardLogStorage::new();
        st.append("slot-1", &mk_logs(1, 3, 1))?;
        assert!(matches!(
            st.append("slot-1", &mk_logs(5, 6, 1)),
            Err(ClusterError::StorageFailure(_))
        ));
        Ok(())
    }

    #[test]
    fn truncate_and_times() -> Result<(), ClusterError> {
        let st = MemoryShardLogStorage::new();
        let (idx, at) = st.last_index_and_append_time("slot-9")?;
        assert_eq!((idx, at), (0, 0));
        st.append("slot-9", &mk_logs(1, 4, 1))?;
        let (idx, at) = st.last_index_and_append_time("slot-9")?;
        assert_eq!(idx, 3);
        assert!(at > 0);
        st.truncate_to("slot-9", 2)?;
        assert_eq!(st.last_index("slot-9")?, 1);
        Ok(())
    }
}
