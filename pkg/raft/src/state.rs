//! Role state (spec §3, §9). `Role` is a tagged enum rather than one flat
//! struct with optional leader/candidate fields, so that e.g. `next_index`
//! and `match_index` simply do not exist unless `role` is `Leader` -- this
//! is what makes I6 ("at most one leader per term") enforceable by
//! construction rather than by a runtime assertion, per the Design Note in
//! spec §9.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::errors::CallError;
use crate::types::{LogIndex, ServerId, Term};

/// Persistent fields that must survive restart (spec §3). The log itself is
/// owned by the `Store`, not duplicated here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
}

/// A reply handle for a client request pending commitment (`froms`, spec
/// §3, §4.6). Fulfilled exactly once: either with the applied result, or
/// with `Deposed` if this server stops being leader first.
pub type ReplyHandle = oneshot::Sender<Result<Bytes, CallError>>;

#[derive(Debug)]
pub struct FollowerState {
    /// Randomized follower election timeout (150 + rand(150) ms, spec §6.4).
    pub election_timeout: Duration,
    /// Last server we believe is leader, used as a hint on `NotLeader`.
    pub last_leader_id: Option<ServerId>,
}

#[derive(Debug)]
pub struct CandidateState {
    /// Peers (including self) that have granted a vote this term.
    pub votes_granted: HashSet<ServerId>,
    /// Randomized candidate election timeout (15 + rand(15) ms, spec §6.4).
    pub election_timeout: Duration,
    pub election_start: Instant,
}

/// Per-peer leader-side replication progress.
#[derive(Debug, Clone)]
pub struct ServerProgress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
}

impl ServerProgress {
    pub fn new(last_log_index: LogIndex) -> Self {
        ServerProgress {
            next_index: last_log_index + 1,
            match_index: 0,
        }
    }
}

#[derive(Debug)]
pub struct LeaderState {
    pub progress: HashMap<ServerId, ServerProgress>,
    /// Pending client replies, keyed by the log index they were appended
    /// at. Drained (with `Deposed`) on transition out of leader.
    pub froms: HashMap<LogIndex, ReplyHandle>,
}

impl LeaderState {
    /// Answers every pending client request with `Deposed` and clears the
    /// map. Called exactly once, when stepping down (spec §4.2).
    pub fn depose(&mut self) {
        for (_, reply) in self.froms.drain() {
            let _ = reply.send(Err(CallError::Deposed));
        }
    }
}

#[derive(Debug)]
pub enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate(_))
    }
}
