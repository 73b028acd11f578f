//! Shared test harness: an in-process cluster of `ConsensusModule`s wired
//! together by a recording `Transport`, driven by explicit ticks and
//! message deliveries rather than real wall-clock timers. This gives the
//! scenario and property tests full control over interleaving, which is
//! what spec.md §8's property-based traces need ("arbitrary event traces").

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use raft::clock::ScriptedClock;
use raft::consensus::{ConsensusModule, Event};
use raft::errors::{CallError, Error};
use raft::messages::{Message, MessageBody};
use raft::state::PersistentState;
use raft::store::MemoryStore;
use raft::transport::Transport;
use raft::types::ServerId;
use tokio::sync::oneshot;

/// The demo `apply` used by every test node: hands the appended value
/// straight back, so assertions can check applied results without pulling
/// in `state_machine::KeyValueStateMachine` for tests that don't care about
/// it.
pub fn echo(value: &Bytes) -> Result<Bytes, Error> {
    Ok(value.clone())
}

pub type TestStore = MemoryStore<fn(&Bytes) -> Result<Bytes, Error>>;
pub type TestModule = ConsensusModule<TestStore, TestTransport, ScriptedClock>;

pub fn new_store() -> TestStore {
    MemoryStore::new(echo as fn(&Bytes) -> Result<Bytes, Error>)
}

#[derive(Clone)]
pub struct TestTransport {
    outbox: Arc<Mutex<Vec<Message>>>,
}

impl TestTransport {
    pub fn new(outbox: Arc<Mutex<Vec<Message>>>) -> Self {
        TestTransport { outbox }
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn cast(&self, _peer: ServerId, msg: Message) {
        self.outbox.lock().unwrap().push(msg);
    }
}

fn message_source(body: &MessageBody) -> ServerId {
    match body {
        MessageBody::RequestVoteRequest(r) => r.source,
        MessageBody::RequestVoteResponse(r) => r.source,
        MessageBody::AppendEntriesRequest(r) => r.source,
        MessageBody::AppendEntriesResponse(r) => r.source,
    }
}

/// A fixed-membership cluster of in-process nodes sharing one recording
/// transport. Nothing here runs on a timer: every tick and delivery is
/// explicit, so tests are deterministic despite the engine's `async` API.
pub struct Cluster {
    outbox: Arc<Mutex<Vec<Message>>>,
    pub nodes: HashMap<ServerId, TestModule>,
    partitioned: HashSet<ServerId>,
}

impl Cluster {
    pub fn new(ids: &[ServerId]) -> Self {
        // `try_init` rather than `init`: every test file pulls in this
        // module, so the global logger would otherwise be initialized more
        // than once per test binary. Run with `RUST_LOG=raft=debug` to see
        // the engine's role-transition/vote/commit logging during a test.
        let _ = env_logger::try_init();

        let outbox = Arc::new(Mutex::new(Vec::new()));
        let mut nodes = HashMap::new();
        for &id in ids {
            let (module, _initial_timeout) = ConsensusModule::new(
                id,
                ids.to_vec(),
                PersistentState::default(),
                new_store(),
                TestTransport::new(outbox.clone()),
                ScriptedClock::default(),
            );
            nodes.insert(id, module);
        }
        Cluster {
            outbox,
            nodes,
            partitioned: HashSet::new(),
        }
    }

    pub async fn tick(&mut self, id: ServerId) {
        self.nodes
            .get_mut(&id)
            .expect("unknown node")
            .dispatch(Event::Timer)
            .await
            .expect("store never fails in tests");
    }

    pub async fn call(
        &mut self,
        id: ServerId,
        value: Bytes,
    ) -> oneshot::Receiver<Result<Bytes, CallError>> {
        let (tx, rx) = oneshot::channel();
        self.nodes
            .get_mut(&id)
            .expect("unknown node")
            .dispatch(Event::ClientCall { value, reply: tx })
            .await
            .expect("store never fails in tests");
        rx
    }

    pub fn partition(&mut self, id: ServerId) {
        self.partitioned.insert(id);
    }

    pub fn heal(&mut self, id: ServerId) {
        self.partitioned.remove(&id);
    }

    /// Delivers exactly one queued message, dropping it instead if either
    /// endpoint is currently partitioned -- this is "best-effort, may drop"
    /// (spec §2) rather than the harness pretending partitions queue up for
    /// later delivery.
    pub async fn deliver_one(&mut self) {
        let msg = {
            let mut outbox = self.outbox.lock().unwrap();
            if outbox.is_empty() {
                None
            } else {
                Some(outbox.remove(0))
            }
        };
        let Some(msg) = msg else { return };
        if self.partitioned.contains(&msg.to) || self.partitioned.contains(&message_source(&msg.body)) {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&msg.to) {
            let _ = node.dispatch(Event::Peer(msg)).await;
        }
    }

    /// Drains the outbox until empty, delivering every message (subject to
    /// partitions). Bounded so a test bug that causes unbounded ping-pong
    /// fails loudly instead of hanging.
    pub async fn settle(&mut self) {
        for _ in 0..256 {
            let pending: Vec<Message> = {
                let mut outbox = self.outbox.lock().unwrap();
                std::mem::take(&mut *outbox)
            };
            if pending.is_empty() {
                return;
            }
            for msg in pending {
                if self.partitioned.contains(&msg.to)
                    || self.partitioned.contains(&message_source(&msg.body))
                {
                    continue;
                }
                if let Some(node) = self.nodes.get_mut(&msg.to) {
                    let _ = node.dispatch(Event::Peer(msg)).await;
                }
            }
        }
        panic!("cluster did not settle within bound");
    }

    pub fn leaders(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self
            .nodes
            .iter()
            .filter(|(_, m)| m.is_leader())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
