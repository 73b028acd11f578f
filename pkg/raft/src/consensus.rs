//! The consensus engine itself (spec §4). `ConsensusModule` is the single
//! state machine that owns a server's role, persistent fields, and commit
//! bookkeeping. It is driven one `Event` at a time by `server.rs`'s actor
//! loop and never runs two handlers concurrently -- see spec §5.
//!
//! This generalizes `dennisss-repo`'s direct-call/callback shape
//! (`request_vote`, `append_entries`, `request_vote_callback`,
//! `append_entries_callback`, `cycle`) into the four-event-kind dispatch
//! skeleton spec §9 calls for, replacing its behaviour-callback structure.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};

use crate::clock::Clock;
use crate::errors::{CallError, Error};
use crate::messages::{
    AppendEntriesRequest, AppendEntriesResponse, Message, MessageBody, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::state::{CandidateState, FollowerState, LeaderState, PersistentState, ReplyHandle, Role, ServerProgress};
use crate::store::Store;
use crate::transport::Transport;
use crate::types::{LogEntry, LogIndex, ServerId, Term};

/// Maximum number of entries sent in a single `AppendEntriesRequest` (spec §6.4).
pub const BATCH_SIZE: usize = 10;

/// An inbound happening the engine may be asked to process (spec §2, §4.1).
/// "Enter-state" is not modeled as a queued variant here: role entry is
/// triggered synchronously by the handler that causes the transition (e.g.
/// `begin_election`, `enter_leader`), which is one of the two conformant
/// ways spec §9 allows for self-messaging/internal transitions -- direct
/// invocation rather than re-queueing.
pub enum Event {
    /// A message delivered by the transport from another cohort member.
    Peer(Message),
    /// A client's proposed command, with a handle to reply to once resolved.
    ClientCall { value: Bytes, reply: ReplyHandle },
    /// The single outstanding timer armed by the last dispatch has expired.
    Timer,
}

fn message_term(body: &MessageBody) -> Term {
    match body {
        MessageBody::RequestVoteRequest(r) => r.term,
        MessageBody::RequestVoteResponse(r) => r.term,
        MessageBody::AppendEntriesRequest(r) => r.term,
        MessageBody::AppendEntriesResponse(r) => r.term,
    }
}

/// The consensus engine for one cohort member. Generic over `Store`,
/// `Transport`, and `Clock` so tests can swap in in-memory/scripted doubles
/// without touching engine logic (spec §9: "deterministic tests replace the
/// timer source with a scripted one").
pub struct ConsensusModule<S, T, C> {
    id: ServerId,
    cohort: Vec<ServerId>,
    persistent: PersistentState,
    persistent_dirty: bool,
    role: Role,
    commit_index: LogIndex,
    last_applied: LogIndex,
    store: S,
    transport: T,
    clock: C,
}

impl<S, T, C> ConsensusModule<S, T, C>
where
    S: Store,
    T: Transport,
    C: Clock,
{
    /// Creates a new engine starting in `Follower`, per spec §3 "It starts
    /// in follower." Returns the initial timer arm duration alongside the
    /// module, since there is no prior dispatch to have produced one.
    pub fn new(
        id: ServerId,
        cohort: Vec<ServerId>,
        persistent: PersistentState,
        store: S,
        transport: T,
        clock: C,
    ) -> (Self, Duration) {
        let election_timeout = clock.follower_election_timeout();
        let module = ConsensusModule {
            id,
            cohort,
            persistent,
            persistent_dirty: false,
            role: Role::Follower(FollowerState {
                election_timeout,
                last_leader_id: None,
            }),
            commit_index: 0,
            last_applied: 0,
            store,
            transport,
            clock,
        };
        (module, election_timeout)
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn term(&self) -> Term {
        self.persistent.current_term
    }

    pub fn voted_for(&self) -> Option<ServerId> {
        self.persistent.voted_for
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Answers every pending client request with `Deposed` without
    /// otherwise touching role/term, for graceful shutdown (spec §6.3
    /// `stop`: "pending `froms` receive `{error, Deposed}`"). A full
    /// `enter_follower` would be wrong here -- shutdown is not a role
    /// transition driven by a message or timeout, just a drain of
    /// in-flight client promises before the actor loop exits.
    pub fn depose_pending(&mut self) {
        if let Role::Leader(ref mut ls) = self.role {
            ls.depose();
        }
    }

    fn majority_size(&self) -> usize {
        self.cohort.len() / 2 + 1
    }

    /// Top-level entry point: one event in, an optional new timer arm out.
    /// A `None` return means "keep whatever timer is already armed" -- the
    /// actor loop in `server.rs` only replaces its sleep deadline when it
    /// sees `Some(_)`.
    pub async fn dispatch(&mut self, event: Event) -> Result<Option<Duration>, Error> {
        match event {
            Event::Peer(msg) => self.handle_peer_message(msg).await,
            Event::ClientCall { value, reply } => self.handle_client_call(value, reply).await,
            Event::Timer => self.handle_timer().await.map(Some),
        }
    }

    // ---- persistence barrier (spec §4.1, §9) --------------------------

    /// Flushes `term`/`voted_for` to the store iff a handler actually
    /// touched them since the last flush. Must be awaited before any action
    /// that depends on the new values becomes externally observable.
    async fn persist_barrier(&mut self) -> Result<(), Error> {
        if self.persistent_dirty {
            self.store.save_state(&self.persistent).await?;
            self.persistent_dirty = false;
        }
        Ok(())
    }

    // ---- role entry (spec §4.2) ----------------------------------------

    /// Enters follower. If we were leader, every pending client reply is
    /// answered with `Deposed` first (spec §4.2). `votedFor` is left
    /// untouched here rather than cleared on every follower entry -- see
    /// DESIGN.md's Open Question 4 for why clearing it here (rather than
    /// only when `term` actually advances, per I7) would violate I2 when a
    /// candidate steps down to follower within the same term.
    fn enter_follower(&mut self) {
        if let Role::Leader(ref mut ls) = self.role {
            ls.depose();
        }
        let election_timeout = self.clock.follower_election_timeout();
        self.role = Role::Follower(FollowerState {
            election_timeout,
            last_leader_id: None,
        });
        debug!("{} entering follower (term {})", self.id, self.persistent.current_term);
    }

    /// Starts a new election (spec §4.4): increments `term`, votes for
    /// self, persists, then either wins immediately (single/two-node
    /// cohorts where self-vote already forms a majority) or broadcasts
    /// `RequestVoteRequest` and waits out the candidate timeout.
    async fn begin_election(&mut self) -> Result<Duration, Error> {
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.id);
        self.persistent_dirty = true;
        self.persist_barrier().await?;

        let mut votes_granted = HashSet::new();
        votes_granted.insert(self.id);
        let election_timeout = self.clock.candidate_election_timeout();
        self.role = Role::Candidate(CandidateState {
            votes_granted,
            election_timeout,
            election_start: Instant::now(),
        });
        info!(
            "{} starting election for term {}",
            self.id, self.persistent.current_term
        );

        if self.candidate_votes() >= self.majority_size() {
            return self.enter_leader().await;
        }

        let (last_log_index, last_log_term) = self.store.last().await;
        let req = RequestVoteRequest {
            term: self.persistent.current_term,
            source: self.id,
            last_log_index,
            last_log_term,
        };
        for peer in self.cohort.clone() {
            if peer == self.id {
                continue;
            }
            self.transport
                .cast(
                    peer,
                    Message {
                        to: peer,
                        body: MessageBody::RequestVoteRequest(req.clone()),
                    },
                )
                .await;
        }
        Ok(election_timeout)
    }

    fn candidate_votes(&self) -> usize {
        match &self.role {
            Role::Candidate(s) => s.votes_granted.len(),
            _ => 0,
        }
    }

    /// Enters leader (spec §4.2): seeds `nextIndex`/`matchIndex` for every
    /// peer and arms the heartbeat timer. Deliberately appends no no-op
    /// entry -- commit progress for prior-term entries waits for a
    /// current-term entry, per I4.
    async fn enter_leader(&mut self) -> Result<Duration, Error> {
        let (last_log_index, _) = self.store.last().await;
        let mut progress = HashMap::new();
        for peer in &self.cohort {
            if *peer == self.id {
                continue;
            }
            progress.insert(*peer, ServerProgress::new(last_log_index));
        }
        self.role = Role::Leader(LeaderState {
            progress,
            froms: HashMap::new(),
        });
        info!("{} became leader for term {}", self.id, self.persistent.current_term);
        Ok(self.clock.heartbeat_interval())
    }

    // ---- timer expiry (spec §4.4, §4.5) --------------------------------

    async fn handle_timer(&mut self) -> Result<Duration, Error> {
        match &self.role {
            Role::Follower(_) | Role::Candidate(_) => self.begin_election().await,
            Role::Leader(_) => self.on_heartbeat_tick().await,
        }
    }

    async fn on_heartbeat_tick(&mut self) -> Result<Duration, Error> {
        self.advance_leader_commit().await?;
        self.replicate_to_peers().await?;
        Ok(self.clock.heartbeat_interval())
    }

    /// Commit advancement (spec §4.5): `N` is the
    /// `⌊|cohort|/2⌋`-th element of `sort([last().index] ++ matchIndex values)`.
    /// Preserved literally including the upward bias for even-sized cohorts
    /// flagged as an Open Question in spec §9 -- see DESIGN.md.
    async fn advance_leader_commit(&mut self) -> Result<(), Error> {
        let (last_log_index, _) = self.store.last().await;
        let mut indexes = vec![last_log_index];
        match &self.role {
            Role::Leader(ls) => indexes.extend(ls.progress.values().map(|p| p.match_index)),
            _ => return Ok(()),
        }
        indexes.sort_unstable();
        let n = indexes[self.cohort.len() / 2];

        if n <= self.commit_index {
            return Ok(());
        }
        if self.store.term_at(n).await == Some(self.persistent.current_term) {
            self.commit_index = n;
            self.apply_committed().await?;
        }
        Ok(())
    }

    /// Leader replication loop (spec §4.5): for each peer, send the
    /// entries starting at its `nextIndex`, clamped to `BATCH_SIZE`, with
    /// the literal (and unusual) `+2` clamp on the outgoing `commitIndex`
    /// field -- see DESIGN.md's Open Question resolution.
    async fn replicate_to_peers(&mut self) -> Result<(), Error> {
        let (last_log_index, _) = self.store.last().await;
        let term = self.persistent.current_term;
        let commit_index = self.commit_index;
        let self_id = self.id;

        let peers: Vec<ServerId> = match &self.role {
            Role::Leader(ls) => ls.progress.keys().copied().collect(),
            _ => return Ok(()),
        };

        for peer in peers {
            let next_index = match &self.role {
                Role::Leader(ls) => ls.progress[&peer].next_index,
                _ => continue,
            };
            let prev_log_index = next_index.saturating_sub(1);
            let prev_log_term = self.store.term_at(prev_log_index).await.unwrap_or(0);
            let entries = self.store.range(prev_log_index + 1, BATCH_SIZE).await;

            // NOTE: the `+2` here is the literal, unusual clamp spec §9
            // flags: it can under-advance a follower's local commit index
            // on large batches. Safe (commit index never races ahead of
            // what's durable) and self-corrects on the next heartbeat.
            let clamped_commit = commit_index.min(last_log_index.min(prev_log_index + 2));

            let req = AppendEntriesRequest {
                term,
                source: self_id,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index: clamped_commit,
            };
            self.transport
                .cast(
                    peer,
                    Message {
                        to: peer,
                        body: MessageBody::AppendEntriesRequest(req),
                    },
                )
                .await;
        }
        Ok(())
    }

    // ---- apply loop (spec §4.7) -----------------------------------------

    async fn apply_committed(&mut self) -> Result<(), Error> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.store.lookup(index).await.ok_or_else(|| {
                crate::store::store_failure(format!(
                    "missing entry at index {} below commit_index",
                    index
                ))
            })?;
            let result = self.store.apply(entry.value).await?;
            if let Role::Leader(ref mut ls) = self.role {
                if let Some(reply) = ls.froms.remove(&index) {
                    let _ = reply.send(Ok(result));
                }
            }
            self.last_applied = index;
        }
        Ok(())
    }

    // ---- client requests (spec §4.6) ------------------------------------

    async fn handle_client_call(
        &mut self,
        value: Bytes,
        reply: ReplyHandle,
    ) -> Result<Option<Duration>, Error> {
        if !self.role.is_leader() {
            let leader_hint = match &self.role {
                Role::Follower(fs) => fs.last_leader_id,
                _ => None,
            };
            let _ = reply.send(Err(CallError::NotLeader { leader_hint }));
            return Ok(None);
        }

        let entry = LogEntry {
            term: self.persistent.current_term,
            value,
        };
        let index = self.store.append(vec![entry]).await?;
        if let Role::Leader(ref mut ls) = self.role {
            ls.froms.insert(index, reply);
        }
        Ok(None)
    }

    // ---- message dispatch (spec §4.1 precedence rule) --------------------

    async fn handle_peer_message(&mut self, msg: Message) -> Result<Option<Duration>, Error> {
        // Universal precedence rule (spec §4.1): any message carrying a
        // higher term bumps us to follower in that term before role-specific
        // handling runs.
        let incoming_term = message_term(&msg.body);
        if incoming_term > self.persistent.current_term {
            self.persistent.current_term = incoming_term;
            self.persistent.voted_for = None;
            self.persistent_dirty = true;
            self.enter_follower();
            self.persist_barrier().await?;
        }

        match msg.body {
            MessageBody::RequestVoteRequest(req) => self.on_request_vote_request(req).await,
            MessageBody::RequestVoteResponse(resp) => self.on_request_vote_response(resp).await,
            MessageBody::AppendEntriesRequest(req) => self.on_append_entries_request(req).await,
            MessageBody::AppendEntriesResponse(resp) => self.on_append_entries_response(resp).await,
        }
    }

    // ---- RequestVote (spec §4.4) -----------------------------------------

    async fn on_request_vote_request(
        &mut self,
        req: RequestVoteRequest,
    ) -> Result<Option<Duration>, Error> {
        let mut granted = false;

        if req.term == self.persistent.current_term {
            let (last_log_index, last_log_term) = self.store.last().await;
            let log_up_to_date = req.last_log_term > last_log_term
                || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);
            let can_vote = matches!(self.persistent.voted_for, None)
                || self.persistent.voted_for == Some(req.source);

            if log_up_to_date && can_vote {
                granted = true;
                self.persistent.voted_for = Some(req.source);
                self.persistent_dirty = true;
                self.persist_barrier().await?;
                debug!("{} granted vote to {} for term {}", self.id, req.source, req.term);
            }
        }

        let resp = RequestVoteResponse {
            term: self.persistent.current_term,
            source: self.id,
            vote_granted: granted,
        };
        self.transport
            .cast(
                req.source,
                Message {
                    to: req.source,
                    body: MessageBody::RequestVoteResponse(resp),
                },
            )
            .await;

        let rearm = if granted {
            match &self.role {
                Role::Follower(fs) => Some(fs.election_timeout),
                _ => None,
            }
        } else {
            None
        };
        Ok(rearm)
    }

    async fn on_request_vote_response(
        &mut self,
        resp: RequestVoteResponse,
    ) -> Result<Option<Duration>, Error> {
        if resp.term != self.persistent.current_term {
            // Stale response from a previous term/election -- ignored
            // (scenario 5).
            return Ok(None);
        }

        let became_leader = if let Role::Candidate(ref mut cs) = self.role {
            if resp.vote_granted {
                cs.votes_granted.insert(resp.source);
            }
            cs.votes_granted.len() >= self.majority_size()
        } else {
            false
        };

        if became_leader {
            return self.enter_leader().await.map(Some);
        }
        Ok(None)
    }

    // ---- AppendEntries (spec §4.3) ---------------------------------------

    /// Implements the full decision table from spec §4.3, recursing for
    /// each "re-dispatch" cell (candidate step-down, post-truncate retry,
    /// post-append retry). Recursion is bounded: stepping down recurses at
    /// most once, and a truncate-then-append chain recurses at most twice,
    /// since each recursive call strictly narrows to a later branch of the
    /// same table (no cycle is reachable).
    fn on_append_entries_request<'a>(
        &'a mut self,
        req: AppendEntriesRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<Duration>, Error>> + 'a>>
    {
        Box::pin(async move {
            if req.term < self.persistent.current_term {
                self.reply_append_entries(req.source, false, 0).await;
                return Ok(None);
            }

            if req.term == self.persistent.current_term && self.role.is_candidate() {
                self.enter_follower();
                return self.on_append_entries_request(req).await;
            }

            let last_leader_id = match &mut self.role {
                Role::Follower(fs) => {
                    fs.last_leader_id = Some(req.source);
                    fs.election_timeout
                }
                // A leader or a candidate that didn't step down above
                // should never legitimately reach this; ignore rather than
                // panic on adversarial/duplicate input (spec §7).
                _ => {
                    warn!(
                        "{} ignoring AppendEntries from {} while not a follower",
                        self.id, req.source
                    );
                    return Ok(None);
                }
            };
            let election_timeout = last_leader_id;

            let (last_log_index, _) = self.store.last().await;
            let log_ok = req.prev_log_index == 0
                || (req.prev_log_index <= last_log_index
                    && self.store.term_at(req.prev_log_index).await == Some(req.prev_log_term));

            if !log_ok {
                self.reply_append_entries(req.source, false, 0).await;
                return Ok(Some(election_timeout));
            }

            if req.entries.is_empty() {
                let new_commit = req.commit_index.min(last_log_index);
                self.advance_follower_commit(new_commit).await?;
                self.reply_append_entries(req.source, true, req.prev_log_index).await;
                return Ok(Some(election_timeout));
            }

            if last_log_index == req.prev_log_index {
                self.store.append(req.entries.clone()).await?;
                return self.on_append_entries_request(req).await;
            }

            // last_log_index > prev_log_index: an entry already exists at
            // prev_log_index + 1. Compare terms to decide match vs. conflict.
            let existing_term = self.store.term_at(req.prev_log_index + 1).await;
            if existing_term == Some(req.entries[0].term) {
                let match_index = req.prev_log_index + req.entries.len() as LogIndex;
                // Per spec §4.3's literal formula ("advance commit/apply as
                // above"), clamp against `last().index`, not `match_index` --
                // using `match_index` would under-advance commit when the
                // follower's log already extends past this (possibly
                // re-delivered, reordered) request's entries.
                let new_commit = req.commit_index.min(last_log_index);
                self.advance_follower_commit(new_commit).await?;
                self.reply_append_entries(req.source, true, match_index).await;
                Ok(Some(election_timeout))
            } else {
                // Conflict: truncate to prevLogIndex (spec §4.3's decision
                // table), not `LastIndex - 1` -- see DESIGN.md's Open
                // Question resolution for why this crate does not preserve
                // that variant.
                self.store.truncate(req.prev_log_index).await?;
                self.on_append_entries_request(req).await
            }
        })
    }

    async fn advance_follower_commit(&mut self, new_commit: LogIndex) -> Result<(), Error> {
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed().await?;
        }
        Ok(())
    }

    async fn reply_append_entries(&mut self, to: ServerId, success: bool, match_index: LogIndex) {
        let resp = AppendEntriesResponse {
            term: self.persistent.current_term,
            source: self.id,
            success,
            match_index,
        };
        self.transport
            .cast(
                to,
                Message {
                    to,
                    body: MessageBody::AppendEntriesResponse(resp),
                },
            )
            .await;
    }

    async fn on_append_entries_response(
        &mut self,
        resp: AppendEntriesResponse,
    ) -> Result<Option<Duration>, Error> {
        if resp.term != self.persistent.current_term {
            return Ok(None);
        }
        if let Role::Leader(ref mut ls) = self.role {
            if let Some(progress) = ls.progress.get_mut(&resp.source) {
                if resp.success {
                    if resp.match_index > progress.match_index {
                        progress.match_index = resp.match_index;
                    }
                    progress.next_index = resp.match_index + 1;
                } else {
                    progress.next_index = progress.next_index.saturating_sub(1).max(1);
                }
            }
        }
        Ok(None)
    }
}
