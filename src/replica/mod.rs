//! Per-group replica state machine: leader/follower rules, log matching,
//! commit tracking, appointed-leader transitions.
//!
//! A `Replica` is a synchronous, message-driven state machine. Inputs
//! arrive through `step()`; outputs are collected per cycle through
//! `ready()` as a batch of outbound messages, unstable entries to persist,
//! and committed entries to apply. Leadership is never self-elected: a
//! higher authority appoints leaders through `AppointLeaderReq`, which
//! makes transitions deterministic from the term alone.

mod log;
mod message;

pub use log::{logs_size, Log};
pub use message::{Message, MsgType, MESSAGE_VERSION};

pub(crate) use log::LogUnstable;
pub(crate) use message::{
    get_bytes, get_string, get_u16, get_u32, get_u64, get_u8, put_string,
};

use std::collections::HashMap;
use std::sync::Arc;

use crate::shard::ShardLogStorage;
use crate::utils::ClusterError;
use crate::{pf_info, pf_warn};

/// Node identifier.
pub type NodeId = u64;
/// Slot identifier.
pub type SlotId = u32;
/// Replication term. Term 0 means "no leader appointed yet".
pub type Term = u32;
/// 1-based log index; 0 means "none".
pub type LogIndex = u64;

/// Upper bound of entries shipped per `SyncResp`, to keep lagging
/// followers from monopolizing a ready cycle.
const MAX_SYNC_LOGS: u64 = 1024;

/// Replica role within its group.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
    /// Non-voting follower: replicates but never counts toward the commit
    /// quorum and never becomes leader.
    Learner,
}

/// Per-peer replication progress tracked by the leader.
#[derive(Debug, Default, Clone, Copy)]
pub struct Progress {
    pub match_index: LogIndex,
    pub next_index: LogIndex,
}

/// Leader/term pair reported when either changed since the last ready.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct HardState {
    pub term: Term,
    pub leader: NodeId,
}

/// An atomic batch of work produced by a replica per cycle.
#[derive(Debug, Default)]
pub struct Ready {
    /// Outbound messages, including local `ApplyLogsReq`.
    pub messages: Vec<Message>,
    /// Unstable entries newly accepted as in-progress, to be persisted.
    pub unstable_logs: Vec<Log>,
    /// Committed-but-unapplied entries (mirrors the `ApplyLogsReq`).
    pub committed_logs: Vec<Log>,
    /// Set iff leader or term changed since the last ready.
    pub hard_state: Option<HardState>,
}

/// Knobs for a single replica, all in units of driver ticks.
#[derive(Debug, Clone)]
pub struct ReplicaOpts {
    pub heartbeat_interval_ticks: u64,
    pub sync_interval_ticks: u64,
    pub election_timeout_ticks: u64,
}

impl Default for ReplicaOpts {
    fn default() -> Self {
        ReplicaOpts {
            heartbeat_interval_ticks: 2,
            sync_interval_ticks: 5,
            election_timeout_ticks: 30,
        }
    }
}

/// A single replicated group member.
pub struct Replica {
    node_id: NodeId,
    shard_no: String,

    role: Role,
    term: Term,
    leader: NodeId,

    /// Voting members, self included.
    replicas: Vec<NodeId>,
    /// Non-voting members.
    learners: Vec<NodeId>,

    unstable: LogUnstable,
    last_log_index: LogIndex,
    committed_index: LogIndex,
    applied_index: LogIndex,
    /// Highest index storage has acknowledged persisting.
    persisted_index: LogIndex,

    progress: HashMap<NodeId, Progress>,

    storage: Arc<dyn ShardLogStorage>,
    opts: ReplicaOpts,

    /// Outbox accumulated between `ready()` calls.
    msgs: Vec<Message>,
    state_changed: bool,
    /// An `ApplyLogsReq` is outstanding; suppress duplicates.
    applying: bool,

    tick_count: u64,
    ticks_since_heard: u64,
}

impl Replica {
    /// Creates a replica bound to a shard identity and its storage. The
    /// initial role is follower at term 0 with no leader; `learner` forces
    /// the non-voting role.
    pub fn new(
        node_id: NodeId,
        shard_no: String,
        replicas: Vec<NodeId>,
        learners: Vec<NodeId>,
        applied_index: LogIndex,
        storage: Arc<dyn ShardLogStorage>,
        opts: ReplicaOpts,
    ) -> Result<Self, ClusterError> {
        let stable_index = storage.last_index(&shard_no)?;
        let role = if learners.contains(&node_id) {
            Role::Learner
        } else {
            Role::Follower
        };
        Ok(Replica {
            node_id,
            shard_no,
            role,
            term: 0,
            leader: 0,
            replicas,
            learners,
            unstable: LogUnstable::new(stable_index),
            last_log_index: stable_index,
            committed_index: applied_index,
            applied_index,
            persisted_index: stable_index,
            progress: HashMap::new(),
            storage,
            opts,
            msgs: Vec::new(),
            state_changed: false,
            applying: false,
            tick_count: 0,
            ticks_since_heard: 0,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn shard_no(&self) -> &str {
        &self.shard_no
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader_id(&self) -> NodeId {
        self.leader
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.last_log_index
    }

    pub fn committed_index(&self) -> LogIndex {
        self.committed_index
    }

    pub fn applied_index(&self) -> LogIndex {
        self.applied_index
    }

    /// Peers of this replica (voters and learners, self excluded).
    fn peers(&self) -> Vec<NodeId> {
        self.replicas
            .iter()
            .chain(self.learners.iter())
            .copied()
            .filter(|&id| id != self.node_id)
            .collect()
    }

    fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    fn send(&mut self, mut msg: Message) {
        msg.from = self.node_id;
        msg.shard_no = self.shard_no.clone();
        self.msgs.push(msg);
    }

    fn become_follower(&mut self, term: Term, leader: NodeId) {
        if self.role == Role::Leader {
            pf_info!(
                "{} stepping down at term {} (new term {})",
                self.shard_no,
                self.term,
                term
            );
        }
        if self.role != Role::Learner {
            self.role = Role::Follower;
        }
        self.term = term;
        self.leader = leader;
        self.ticks_since_heard = 0;
        self.state_changed = true;
    }

    /// Steps a single message into the state machine.
    pub fn step(&mut self, msg: Message) -> Result<(), ClusterError> {
        match msg.msg_type {
            MsgType::Propose => return self.step_propose(msg),
            MsgType::ApplyLogsResp => return self.step_apply_logs_resp(msg),
            MsgType::StoreAppendResp => {
                return self.step_store_append_resp(msg)
            }
            _ => {}
        }

        if msg.msg_type == MsgType::AppointLeaderReq {
            // appointing at term <= current is a no-op (idempotence)
            if msg.term <= self.term {
                return Ok(());
            }
            return self.step_appoint_leader_req(msg);
        }
        if msg.term > self.term {
            match msg.msg_type {
                MsgType::AppointLeaderResp
                | MsgType::NotifySync
                | MsgType::Ping => {
                    self.become_follower(msg.term, msg.from);
                }
                _ => self.become_follower(msg.term, 0),
            }
        } else if msg.term < self.term {
            // stale sender
            return Ok(());
        }

        match msg.msg_type {
            MsgType::AppointLeaderResp => {
                self.step_appoint_leader_resp(msg)
            }
            MsgType::NotifySync => self.step_notify_sync(msg),
            MsgType::Sync => self.step_sync(msg),
            MsgType::SyncResp => self.step_sync_resp(msg),
            MsgType::Ping => self.step_ping(msg),
            MsgType::Pong => self.step_pong(msg),
            MsgType::ApplyLogsReq | MsgType::Unknown => Ok(()),
            _ => Ok(()),
        }
    }

    /// Local propose at the leader: assigns the next index at the current
    /// term, appends to the unstable window, and pokes every peer to sync.
    fn step_propose(&mut self, msg: Message) -> Result<(), ClusterError> {
        if self.role != Role::Leader {
            return Err(ClusterError::NotLeader { hint: self.leader });
        }
        let data = match msg.logs.into_iter().next() {
            Some(l) => l.data,
            None => vec![],
        };
        let index = self.last_log_index + 1;
        self.unstable.truncate_and_append(vec![Log {
            index,
            term: self.term,
            data,
        }])?;
        self.last_log_index = index;
        self.maybe_commit()?;
        for peer in self.peers() {
            self.send(Message {
                msg_type: MsgType::NotifySync,
                to: peer,
                term: self.term,
                commit_index: self.committed_index,
                ..Default::default()
            });
        }
        Ok(())
    }

    /// The authority appoints `msg.from` leader at `msg.term` (already
    /// checked to exceed the current one). The appointee answers each
    /// peer so followers converge without a vote.
    fn step_appoint_leader_req(
        &mut self,
        msg: Message,
    ) -> Result<(), ClusterError> {
        if msg.from == self.node_id && self.role != Role::Learner {
            self.role = Role::Leader;
            self.term = msg.term;
            self.leader = self.node_id;
            self.ticks_since_heard = 0;
            self.state_changed = true;
            // restart peer progress from the tip
            self.progress.clear();
            for peer in self.peers() {
                self.progress.insert(
                    peer,
                    Progress {
                        match_index: 0,
                        next_index: self.last_log_index + 1,
                    },
                );
            }
            pf_info!(
                "{} appointed leader at term {}",
                self.shard_no,
                self.term
            );
            for peer in self.peers() {
                self.send(Message {
                    msg_type: MsgType::AppointLeaderResp,
                    to: peer,
                    term: self.term,
                    commit_index: self.committed_index,
                    ..Default::default()
                });
            }
        } else {
            self.become_follower(msg.term, msg.from);
        }
        Ok(())
    }

    fn step_appoint_leader_resp(
        &mut self,
        msg: Message,
    ) -> Result<(), ClusterError> {
        if self.role != Role::Leader {
            self.leader = msg.from;
            self.ticks_since_heard = 0;
        }
        Ok(())
    }

    /// Leader poked us: pull entries starting after our tip.
    fn step_notify_sync(&mut self, msg: Message) -> Result<(), ClusterError> {
        if self.role == Role::Leader {
            return Ok(());
        }
        self.leader = msg.from;
        self.ticks_since_heard = 0;
        self.commit_to(msg.commit_index.min(self.last_log_index));
        self.send(Message {
            msg_type: MsgType::Sync,
            to: msg.from,
            term: self.term,
            index: self.last_log_index + 1,
            commit_index: self.committed_index,
            ..Default::default()
        });
        Ok(())
    }

    /// A follower reports its tip and asks for entries from `msg.index`
    /// on. The report doubles as the replication ack: everything below the
    /// requested index is on the follower.
    fn step_sync(&mut self, msg: Message) -> Result<(), ClusterError> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let prog = self.progress.entry(msg.from).or_default();
        if msg.reject {
            prog.next_index = prog.next_index.saturating_sub(1).max(1);
        } else {
            prog.match_index = msg.index.saturating_sub(1);
            prog.next_index = msg.index;
        }
        self.maybe_commit()?;

        let lo = msg.index;
        let hi = (self.last_log_index + 1).min(lo + MAX_SYNC_LOGS);
        let logs = if lo < hi { self.log_range(lo, hi)? } else { vec![] };
        self.send(Message {
            msg_type: MsgType::SyncResp,
            to: msg.from,
            term: self.term,
            index: lo,
            commit_index: self.committed_index,
            logs,
            ..Default::default()
        });
        Ok(())
    }

    /// Entries shipped from the leader. Duplicates below the commit point
    /// are skipped (per-log-index deduplication); an overlap with the
    /// stable prefix is answered with a fresh `Sync` instead of rewriting
    /// durable entries.
    fn step_sync_resp(&mut self, msg: Message) -> Result<(), ClusterError> {
        if self.role == Role::Leader {
            return Ok(());
        }
        self.leader = msg.from;
        self.ticks_since_heard = 0;

        let mut logs = msg.logs;
        logs.retain(|l| l.index > self.committed_index);
        if let Some(first) = logs.first() {
            if first.index > self.last_log_index + 1 {
                // a gap; ask again from our actual tip
                self.send(Message {
                    msg_type: MsgType::Sync,
                    to: msg.from,
                    term: self.term,
                    index: self.last_log_index + 1,
                    commit_index: self.committed_index,
                    ..Default::default()
                });
                return Ok(());
            }
            let tail = self.unstable.offset() + self.unstable.len() as u64;
            if first.index == tail || first.index > self.unstable.offset() {
                self.unstable.truncate_and_append(logs)?;
                self.last_log_index =
                    self.unstable.maybe_last_index().unwrap_or(tail - 1);
            } else {
                pf_warn!(
                    "{} sync resp from {} overlaps stable prefix at {}",
                    self.shard_no,
                    msg.from,
                    first.index
                );
                self.send(Message {
                    msg_type: MsgType::Sync,
                    to: msg.from,
                    term: self.term,
                    index: self.last_log_index + 1,
                    commit_index: self.committed_index,
                    reject: true,
                    ..Default::default()
                });
                return Ok(());
            }
        }
        self.commit_to(msg.commit_index.min(self.last_log_index));
        Ok(())
    }

    fn step_ping(&mut self, msg: Message) -> Result<(), ClusterError> {
        if self.role == Role::Leader {
            return Ok(());
        }
        self.leader = msg.from;
        self.ticks_since_heard = 0;
        self.commit_to(msg.commit_index.min(self.last_log_index));
        self.send(Message {
            msg_type: MsgType::Pong,
            to: msg.from,
            term: self.term,
            index: self.last_log_index,
            commit_index: self.committed_index,
            ..Default::default()
        });
        Ok(())
    }

    fn step_pong(&mut self, _msg: Message) -> Result<(), ClusterError> {
        // liveness only; replication acks arrive via Sync
        Ok(())
    }

    fn step_apply_logs_resp(
        &mut self,
        msg: Message,
    ) -> Result<(), ClusterError> {
        self.applying = false;
        if msg.index > self.applied_index {
            self.applied_index = msg.index.min(self.committed_index);
            self.unstable.applied_to(self.applied_index);
        }
        Ok(())
    }

    fn step_store_append_resp(
        &mut self,
        msg: Message,
    ) -> Result<(), ClusterError> {
        if msg.reject {
            return Err(ClusterError::StorageFailure(format!(
                "{} storage append rejected at {}",
                self.shard_no, msg.index
            )));
        }
        if msg.index > self.persisted_index {
            self.persisted_index = msg.index.min(self.last_log_index);
        }
        if self.role == Role::Leader {
            self.maybe_commit()?;
        }
        Ok(())
    }

    /// Leader commit rule: index i commits once a majority of voters
    /// (self included) hold it and `log[i].term == current_term`.
    fn maybe_commit(&mut self) -> Result<(), ClusterError> {
        let mut new_commit = self.committed_index;
        for i in (self.committed_index + 1)..=self.last_log_index {
            let count = self
                .replicas
                .iter()
                .filter(|&&id| {
                    if id == self.node_id {
                        self.last_log_index >= i
                    } else {
                        self.progress
                            .get(&id)
                            .map(|p| p.match_index >= i)
                            .unwrap_or(false)
                    }
                })
                .count();
            if count < self.quorum() {
                break;
            }
            if self.unstable.term_of(i) != Some(self.term) {
                // cannot decide commit using a non-current-term entry
                continue;
            }
            new_commit = i;
        }
        self.commit_to(new_commit);
        Ok(())
    }

    fn commit_to(&mut self, index: LogIndex) {
        if index > self.committed_index {
            self.committed_index = index.min(self.last_log_index);
        }
    }

    /// Reads entries `[lo, hi)`, stitching the stable prefix from storage
    /// with the unstable tail.
    fn log_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<Log>, ClusterError> {
        let offset = self.unstable.offset();
        let mut out = Vec::new();
        if lo < offset {
            out = self.storage.read(&self.shard_no, lo, hi.min(offset))?;
        }
        let u_lo = lo.max(offset);
        let u_hi = hi.min(offset + self.unstable.len() as u64);
        if u_lo < u_hi {
            out.extend(self.unstable.slice(u_lo, u_hi)?);
        }
        Ok(out)
    }

    /// Advances time-driven behavior by one driver tick: the leader
    /// heartbeats its peers, followers periodically re-sync from the
    /// leader and give up on a quiet one.
    pub fn tick(&mut self) {
        self.tick_count += 1;
        match self.role {
            Role::Leader => {
                if self.tick_count % self.opts.heartbeat_interval_ticks == 0 {
                    for peer in self.peers() {
                        self.send(Message {
                            msg_type: MsgType::Ping,
                            to: peer,
                            term: self.term,
                            commit_index: self.committed_index,
                            ..Default::default()
                        });
                    }
                }
            }
            Role::Follower | Role::Learner => {
                self.ticks_since_heard += 1;
                if self.leader != 0
                    && self.tick_count % self.opts.sync_interval_ticks == 0
                {
                    self.send(Message {
                        msg_type: MsgType::Sync,
                        to: self.leader,
                        term: self.term,
                        index: self.last_log_index + 1,
                        commit_index: self.committed_index,
                        ..Default::default()
                    });
                }
                if self.leader != 0
                    && self.ticks_since_heard
                        > self.opts.election_timeout_ticks
                {
                    pf_warn!(
                        "{} leader {} quiet for {} ticks, forgetting it",
                        self.shard_no,
                        self.leader,
                        self.ticks_since_heard
                    );
                    self.leader = 0;
                    self.ticks_since_heard = 0;
                    self.state_changed = true;
                }
            }
            Role::Candidate => {}
        }
    }

    /// True iff `ready()` would return a non-empty batch.
    pub fn has_ready(&self) -> bool {
        !self.msgs.is_empty()
            || self.unstable.has_next_logs()
            || self.state_changed
            || (self.committed_index > self.applied_index && !self.applying)
    }

    /// Collects the pending batch of work and marks it in progress.
    pub fn ready(&mut self) -> Result<Ready, ClusterError> {
        let mut messages = std::mem::take(&mut self.msgs);

        let unstable_logs = self.unstable.next_logs().to_vec();
        self.unstable.accept_in_progress();

        let mut committed_logs = Vec::new();
        if self.committed_index > self.applied_index && !self.applying {
            committed_logs = self
                .log_range(self.applied_index + 1, self.committed_index + 1)?;
            messages.push(Message {
                msg_type: MsgType::ApplyLogsReq,
                from: self.node_id,
                to: self.node_id,
                term: self.term,
                index: self.committed_index,
                commit_index: self.committed_index,
                logs: committed_logs.clone(),
                shard_no: self.shard_no.clone(),
                ..Default::default()
            });
            self.applying = true;
        }

        let hard_state = if self.state_changed {
            self.state_changed = false;
            Some(HardState {
                term: self.term,
                leader: self.leader,
            })
        } else {
            None
        };

        Ok(Ready {
            messages,
            unstable_logs,
            committed_logs,
            hard_state,
        })
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use crate::shard::MemoryShardLogStorage;

    fn new_replica(node_id: NodeId, replicas: Vec<NodeId>) -> Replica {
        Replica::new(
            node_id,
            "channel-2-test".into(),
            replicas,
            vec![],
            0,
            Arc::new(MemoryShardLogStorage::new()),
            ReplicaOpts::default(),
        )
        .unwrap()
    }

    fn appoint(r: &mut Replica, term: Term, leader: NodeId) {
        r.step(Message {
            msg_type: MsgType::AppointLeaderReq,
            from: leader,
            to: r.node_id(),
            term,
            ..Default::default()
        })
        .unwrap();
    }

    fn propose(r: &mut Replica, data: &[u8]) -> Result<(), ClusterError> {
        r.step(Message {
            msg_type: MsgType::Propose,
            logs: vec![Log {
                data: data.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    fn messages_of_type(msgs: &[Message], ty: MsgType) -> Vec<Message> {
        msgs.iter().filter(|m| m.msg_type == ty).cloned().collect()
    }

    #[test]
    fn appoint_leader_emits_resp_per_follower() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        appoint(&mut r, 2, 1);
        assert!(r.is_leader());
        assert_eq!(r.term(), 2);
        assert!(r.has_ready());
        let rd = r.ready()?;
        let resps =
            messages_of_type(&rd.messages, MsgType::AppointLeaderResp);
        assert_eq!(resps.len(), 2);
        let mut tos: Vec<NodeId> = resps.iter().map(|m| m.to).collect();
        tos.sort_unstable();
        assert_eq!(tos, vec![2, 3]);
        Ok(())
    }

    #[test]
    fn appoint_at_stale_term_is_noop() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        appoint(&mut r, 5, 1);
        let _ = r.ready()?;
        appoint(&mut r, 5, 2); // same term: ignored
        assert!(r.is_leader());
        appoint(&mut r, 3, 2); // lower term: ignored
        assert!(r.is_leader());
        appoint(&mut r, 6, 2); // higher term: step down to follower of 2
        assert!(!r.is_leader());
        assert_eq!(r.leader_id(), 2);
        assert_eq!(r.term(), 6);
        Ok(())
    }

    #[test]
    fn leader_propose_emits_notify_sync() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        appoint(&mut r, 2, 1);
        let _ = r.ready()?;
        propose(&mut r, b"hello")?;
        assert_eq!(r.last_log_index(), 1);
        let rd = r.ready()?;
        let notifies = messages_of_type(&rd.messages, MsgType::NotifySync);
        assert!(!notifies.is_empty());
        assert!(notifies.iter().all(|m| m.term == 2 && m.to != 1));
        assert_eq!(rd.unstable_logs.len(), 1);
        assert_eq!(rd.unstable_logs[0].term, 2);
        Ok(())
    }

    #[test]
    fn propose_on_follower_rejected_fast() {
        let mut r = new_replica(1, vec![1, 2, 3]);
        r.step(Message {
            msg_type: MsgType::AppointLeaderResp,
            from: 3,
            to: 1,
            term: 4,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            propose(&mut r, b"nope"),
            Err(ClusterError::NotLeader { hint: 3 })
        );
    }

    #[test]
    fn follower_answers_notify_sync() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        r.step(Message {
            msg_type: MsgType::NotifySync,
            from: 2,
            to: 1,
            term: 1,
            ..Default::default()
        })?;
        assert_eq!(r.leader_id(), 2);
        let rd = r.ready()?;
        let syncs = messages_of_type(&rd.messages, MsgType::Sync);
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].to, 2);
        assert_eq!(syncs[0].index, 1); // last_log_index + 1
        Ok(())
    }

    #[test]
    fn follower_applies_sync_resp() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        r.step(Message {
            msg_type: MsgType::SyncResp,
            from: 2,
            to: 1,
            term: 1,
            index: 1,
            logs: vec![Log {
                index: 1,
                term: 1,
                data: b"hello".to_vec(),
            }],
            ..Default::default()
        })?;
        let rd = r.ready()?;
        assert!(rd.messages.is_empty());
        assert_eq!(rd.unstable_logs.len(), 1);
        assert_eq!(r.last_log_index(), 1);
        Ok(())
    }

    #[test]
    fn leader_commits_on_majority_sync() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        appoint(&mut r, 1, 1);
        let _ = r.ready()?;
        propose(&mut r, b"hello")?;
        let _ = r.ready()?;
        assert_eq!(r.committed_index(), 0);

        // follower 2 reports everything through index 1 on board
        r.step(Message {
            msg_type: MsgType::Sync,
            from: 2,
            to: 1,
            term: 1,
            index: 2,
            ..Default::default()
        })?;
        assert_eq!(r.committed_index(), 1);

        let rd = r.ready()?;
        let applies = messages_of_type(&rd.messages, MsgType::ApplyLogsReq);
        assert_eq!(applies.len(), 1);
        assert_eq!(applies[0].logs.len(), 1);
        assert_eq!(rd.committed_logs, applies[0].logs);

        // applier acks; applied index advances, duplicate req suppressed
        r.step(Message {
            msg_type: MsgType::ApplyLogsResp,
            index: 1,
            ..Default::default()
        })?;
        assert_eq!(r.applied_index(), 1);
        assert!(r
            .ready()?
            .messages
            .iter()
            .all(|m| m.msg_type != MsgType::ApplyLogsReq));
        Ok(())
    }

    #[test]
    fn leader_serves_sync_resp_logs() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        appoint(&mut r, 1, 1);
        let _ = r.ready()?;
        propose(&mut r, b"a")?;
        propose(&mut r, b"b")?;
        let _ = r.ready()?;
        r.step(Message {
            msg_type: MsgType::Sync,
            from: 2,
            to: 1,
            term: 1,
            index: 1,
            ..Default::default()
        })?;
        let rd = r.ready()?;
        let resps = messages_of_type(&rd.messages, MsgType::SyncResp);
        assert_eq!(resps.len(), 1);
        assert_eq!(resps[0].to, 2);
        assert_eq!(resps[0].logs.len(), 2);
        assert_eq!(resps[0].logs[0].index, 1);
        Ok(())
    }

    #[test]
    fn commit_skips_older_term_entries() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        // adopt an entry from an old leader at term 1
        r.step(Message {
            msg_type: MsgType::SyncResp,
            from: 3,
            to: 1,
            term: 1,
            index: 1,
            logs: vec![Log {
                index: 1,
                term: 1,
                data: b"old".to_vec(),
            }],
            ..Default::default()
        })?;
        let _ = r.ready()?;
        // now appointed leader at term 2; follower 2 acks index 1
        appoint(&mut r, 2, 1);
        let _ = r.ready()?;
        r.step(Message {
            msg_type: MsgType::Sync,
            from: 2,
            to: 1,
            term: 2,
            index: 2,
            ..Default::default()
        })?;
        // cannot commit a term-1 entry at term 2 by counting replicas
        assert_eq!(r.committed_index(), 0);

        // a new propose at term 2, once majority-held, commits both
        propose(&mut r, b"new")?;
        r.step(Message {
            msg_type: MsgType::Sync,
            from: 2,
            to: 1,
            term: 2,
            index: 3,
            ..Default::default()
        })?;
        assert_eq!(r.committed_index(), 2);
        Ok(())
    }

    #[test]
    fn follower_adopts_commit_capped_by_log() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        r.step(Message {
            msg_type: MsgType::SyncResp,
            from: 2,
            to: 1,
            term: 1,
            index: 1,
            commit_index: 9, // leader is far ahead
            logs: vec![Log {
                index: 1,
                term: 1,
                data: b"x".to_vec(),
            }],
            ..Default::default()
        })?;
        assert_eq!(r.committed_index(), 1);
        Ok(())
    }

    #[test]
    fn learner_replicates_but_never_counts() -> Result<(), ClusterError> {
        let mut leader = new_replica(1, vec![1, 2]);
        leader.learners = vec![3];
        appoint(&mut leader, 1, 1);
        let _ = leader.ready()?;
        propose(&mut leader, b"x")?;
        let rd = leader.ready()?;
        // learner also gets notified
        let notifies = messages_of_type(&rd.messages, MsgType::NotifySync);
        assert!(notifies.iter().any(|m| m.to == 3));
        // learner's sync must not commit anything (quorum of {1,2} is 2)
        leader.step(Message {
            msg_type: MsgType::Sync,
            from: 3,
            to: 1,
            term: 1,
            index: 2,
            ..Default::default()
        })?;
        assert_eq!(leader.committed_index(), 0);

        // a learner never becomes leader via appointment
        let mut learner = Replica::new(
            3,
            "channel-2-test".into(),
            vec![1, 2],
            vec![3],
            0,
            Arc::new(MemoryShardLogStorage::new()),
            ReplicaOpts::default(),
        )
        .unwrap();
        appoint(&mut learner, 5, 3);
        assert_eq!(learner.role(), Role::Learner);
        Ok(())
    }

    #[test]
    fn leader_ticks_emit_pings() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        appoint(&mut r, 1, 1);
        let _ = r.ready()?;
        for _ in 0..ReplicaOpts::default().heartbeat_interval_ticks {
            r.tick();
        }
        let rd = r.ready()?;
        let pings = messages_of_type(&rd.messages, MsgType::Ping);
        assert_eq!(pings.len(), 2);
        Ok(())
    }

    #[test]
    fn follower_forgets_quiet_leader() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1, 2, 3]);
        r.step(Message {
            msg_type: MsgType::Ping,
            from: 2,
            to: 1,
            term: 1,
            ..Default::default()
        })?;
        assert_eq!(r.leader_id(), 2);
        let _ = r.ready()?;
        for _ in 0..=ReplicaOpts::default().election_timeout_ticks {
            r.tick();
        }
        assert_eq!(r.leader_id(), 0);
        Ok(())
    }

    #[test]
    fn indices_stay_ordered() -> Result<(), ClusterError> {
        let mut r = new_replica(1, vec![1]);
        appoint(&mut r, 1, 1);
        let _ = r.ready()?;
        for i in 0..5 {
            propose(&mut r, format!("e{}", i).as_bytes())?;
            assert!(r.applied_index() <= r.committed_index());
            assert!(r.committed_index() <= r.last_log_index());
            let rd = r.ready()?;
            for msg in rd.messages {
                if msg.msg_type == MsgType::ApplyLogsReq {
                    r.step(Message {
                        msg_type: MsgType::ApplyLogsResp,
                        index: msg.index,
                        ..Default::default()
                    })?;
                }
            }
        }
        assert_eq!(r.last_log_index(), 5);
        assert_eq!(r.applied_index(), 5);
        Ok(())
    }
}
