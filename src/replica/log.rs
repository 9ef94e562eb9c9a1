//! Per-shard log entry type and the in-memory unstable log window.

use get_size::GetSize;
use serde::{Deserialize, Serialize};

use crate::utils::ClusterError;

/// A single replicated log entry. Indices are 1-based within a shard;
/// index 0 means "none". Two entries sharing `(index, term)` are identical.
#[derive(
    Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize,
)]
pub struct Log {
    pub index: u64,
    pub term: u32,
    pub data: Vec<u8>,
}

/// Approximate in-memory size of a batch of log entries, used by the
/// receive queue's memory budget.
pub fn logs_size(logs: &[Log]) -> u64 {
    logs.iter().map(|l| l.get_size() as u64).sum()
}

/// In-memory window of log entries not yet handed over to stable storage.
///
/// The first entry (if any) always has `index == offset`.
/// `offset_in_progress` in `[offset, offset + len]` separates entries
/// already handed to storage for writing from newly added ones.
pub(crate) struct LogUnstable {
    logs: Vec<Log>,
    offset: u64,
    offset_in_progress: u64,
}

impl LogUnstable {
    /// Creates an empty window starting right after the given stable index.
    pub(crate) fn new(stable_index: u64) -> Self {
        LogUnstable {
            logs: Vec::new(),
            offset: stable_index + 1,
            offset_in_progress: stable_index + 1,
        }
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn len(&self) -> usize {
        self.logs.len()
    }

    /// Index of the last entry in the window, or `None` if empty.
    pub(crate) fn maybe_last_index(&self) -> Option<u64> {
        if self.logs.is_empty() {
            None
        } else {
            Some(self.offset + self.logs.len() as u64 - 1)
        }
    }

    /// Marks entries with index <= `index` as fully processed; they are
    /// dropped from the window. Idempotent.
    pub(crate) fn applied_to(&mut self, index: u64) {
        if index + 1 < self.offset {
            // already out of the window, nothing to drop
            return;
        }
        let num =
            ((index + 1 - self.offset) as usize).min(self.logs.len());
        self.logs.drain(..num);
        self.offset += num as u64;
        self.offset_in_progress = self.offset_in_progress.max(self.offset);
        self.shrink_logs_array();
    }

    /// Entries added since the last `accept_in_progress()`, i.e. not yet
    /// handed to storage.
    pub(crate) fn next_logs(&self) -> &[Log] {
        let in_progress = (self.offset_in_progress - self.offset) as usize;
        &self.logs[in_progress..]
    }

    pub(crate) fn has_next_logs(&self) -> bool {
        ((self.offset_in_progress - self.offset) as usize) < self.logs.len()
    }

    /// Marks all current entries as having begun the process of being
    /// written to storage; they will no longer be returned from
    /// `next_logs()`. Entries added afterwards will be, until the next
    /// call.
    pub(crate) fn accept_in_progress(&mut self) {
        if let Some(last) = self.maybe_last_index() {
            self.offset_in_progress = last + 1;
        }
    }

    /// Replaces the window tail from `logs[0].index` onward.
    ///
    /// Overlap with the stable prefix (`logs[0].index <= offset` while not
    /// a clean extension) would silently rewrite durable entries and is a
    /// critical invariant violation.
    pub(crate) fn truncate_and_append(
        &mut self,
        mut logs: Vec<Log>,
    ) -> Result<(), ClusterError> {
        let from_index = match logs.first() {
            Some(l) => l.index,
            None => return Ok(()),
        };
        if from_index == self.offset + self.logs.len() as u64 {
            // from_index is the next index in the window, append directly
            self.logs.append(&mut logs);
        } else if from_index <= self.offset {
            return Err(ClusterError::InvariantViolation(format!(
                "truncate_and_append from {} overlaps stable prefix (offset {})",
                from_index, self.offset
            )));
        } else {
            // truncate to the first conflicting index, then append
            let keep = (from_index - self.offset) as usize;
            self.logs.truncate(keep);
            self.logs.append(&mut logs);
            self.offset_in_progress =
                self.offset_in_progress.min(from_index);
        }
        Ok(())
    }

    /// Copies out entries in `[lo, hi)`. Out-of-bounds is always a bug,
    /// never a runtime condition.
    pub(crate) fn slice(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<Log>, ClusterError> {
        self.check_out_of_bounds(lo, hi)?;
        Ok(self.logs[(lo - self.offset) as usize..(hi - self.offset) as usize]
            .to_vec())
    }

    /// Term of the entry at `index` if inside the window.
    pub(crate) fn term_of(&self, index: u64) -> Option<u32> {
        if index < self.offset {
            return None;
        }
        self.logs.get((index - self.offset) as usize).map(|l| l.term)
    }

    fn check_out_of_bounds(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<(), ClusterError> {
        if lo > hi {
            return Err(ClusterError::InvariantViolation(format!(
                "invalid unstable slice {} > {}",
                lo, hi
            )));
        }
        let upper = self.offset + self.logs.len() as u64;
        if lo < self.offset || hi > upper {
            return Err(ClusterError::InvariantViolation(format!(
                "unstable slice [{},{}) out of bound [{},{})",
                lo, hi, self.offset, upper
            )));
        }
        Ok(())
    }

    /// Discards the excess backing capacity if most of it isn't being used
    /// anymore, so drained entries stop pinning large payloads.
    fn shrink_logs_array(&mut self) {
        const LEN_MULTIPLE: usize = 2;
        if self.logs.is_empty() {
            self.logs = Vec::new();
        } else if self.logs.len() * LEN_MULTIPLE < self.logs.capacity() {
            self.logs.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod unstable_tests {
    use super::*;

    fn mk_logs(lo: u64, hi: u64, term: u32) -> Vec<Log> {
        (lo..hi)
            .map(|index| Log {
                index,
                term,
                data: format!("entry-{}", index).into_bytes(),
            })
            .collect()
    }

    #[test]
    fn append_and_slice() -> Result<(), ClusterError> {
        let mut u = LogUnstable::new(0);
        u.truncate_and_append(mk_logs(1, 5, 1))?;
        assert_eq!(u.maybe_last_index(), Some(4));
        assert_eq!(u.slice(1, 5)?, mk_logs(1, 5, 1));
        assert_eq!(u.slice(2, 2)?, vec![]);
        Ok(())
    }

    #[test]
    fn slice_out_of_bounds() -> Result<(), ClusterError> {
        let mut u = LogUnstable::new(0);
        u.truncate_and_append(mk_logs(1, 4, 1))?;
        assert!(u.slice(3, 2).is_err());
        assert!(u.slice(0, 2).is_err());
        assert!(u.slice(2, 9).is_err());
        Ok(())
    }

    #[test]
    fn applied_to_is_idempotent() -> Result<(), ClusterError> {
        let mut u = LogUnstable::new(0);
        u.truncate_and_append(mk_logs(1, 10, 1))?;
        u.applied_to(5);
        assert_eq!(u.offset(), 6);
        assert_eq!(u.maybe_last_index(), Some(9));
        u.applied_to(5);
        assert_eq!(u.offset(), 6);
        assert_eq!(u.maybe_last_index(), Some(9));
        u.applied_to(2); // below the window, no effect
        assert_eq!(u.offset(), 6);
        Ok(())
    }

    #[test]
    fn truncate_overwrites_conflicting_tail() -> Result<(), ClusterError> {
        let mut u = LogUnstable::new(0);
        u.truncate_and_append(mk_logs(1, 6, 1))?;
        // a new leader overwrites entries from index 4 onward
        u.truncate_and_append(mk_logs(4, 8, 2))?;
        assert_eq!(u.maybe_last_index(), Some(7));
        assert_eq!(u.term_of(3), Some(1));
        assert_eq!(u.term_of(4), Some(2));
        Ok(())
    }

    #[test]
    fn truncate_into_stable_is_fatal() -> Result<(), ClusterError> {
        let mut u = LogUnstable::new(0);
        u.truncate_and_append(mk_logs(1, 6, 1))?;
        u.applied_to(3); // offset now 4
        let err = u.truncate_and_append(mk_logs(2, 5, 2)).unwrap_err();
        assert!(matches!(err, ClusterError::InvariantViolation(_)));
        Ok(())
    }

    #[test]
    fn in_progress_window() -> Result<(), ClusterError> {
        let mut u = LogUnstable::new(0);
        u.truncate_and_append(mk_logs(1, 4, 1))?;
        assert!(u.has_next_logs());
        assert_eq!(u.next_logs().len(), 3);
        u.accept_in_progress();
        assert!(!u.has_next_logs());
        u.truncate_and_append(mk_logs(4, 6, 1))?;
        assert_eq!(u.next_logs(), &mk_logs(4, 6, 1)[..]);
        Ok(())
    }

    #[test]
    fn empty_append_is_noop() -> Result<(), ClusterError> {
        let mut u = LogUnstable::new(7);
        u.truncate_and_append(vec![])?;
        assert_eq!(u.maybe_last_index(), None);
        assert_eq!(u.offset(), 8);
        assert_eq!(u.len(), 0);
        Ok(())
    }
}
