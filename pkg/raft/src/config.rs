//! Ambient configuration surface (spec §6.4, SPEC_FULL.md §6.4). The
//! protocol's own numeric constants (`BATCH_SIZE`, the heartbeat/election
//! timeouts) are fixed by spec and live next to the code that uses them
//! (`consensus::BATCH_SIZE`, `clock::HEARTBEAT_INTERVAL`); `RaftConfig` only
//! carries the per-embedder wiring the protocol itself has no opinion on --
//! who this server is, who its peers are, and how long a client call should
//! wait before giving up. Shaped after
//! `michaelreda20-Distributed_project`'s `RaftConfig`.

use std::time::Duration;

use crate::types::ServerId;

/// Client call timeout, enforced by `Server`'s client-facing wrapper, never
/// observed inside the engine itself (spec §6.4, §7).
pub const CLIENT_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub server_id: ServerId,
    /// Every other member of the cohort. `server_id` is implicitly a member
    /// and must not be repeated here.
    pub peers: Vec<ServerId>,
    pub client_timeout: Duration,
}

impl RaftConfig {
    pub fn new(server_id: ServerId, peers: Vec<ServerId>) -> Self {
        RaftConfig {
            server_id,
            peers,
            client_timeout: CLIENT_TIMEOUT,
        }
    }

    /// The fixed cohort this instance participates in, self included
    /// (spec §3: "cohort ... fixed for the life of the instance").
    pub fn cohort(&self) -> Vec<ServerId> {
        let mut members = Vec::with_capacity(self.peers.len() + 1);
        members.push(self.server_id);
        members.extend(self.peers.iter().copied());
        members
    }
}
