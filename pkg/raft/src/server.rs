//! The server actor and client-facing API (SPEC_FULL.md §4.8, "added"
//! relative to spec.md's engine-only framing but required to make spec.md's
//! own §6.3 Client API and §5 single-actor model runnable). Generalizes
//! `dennisss-repo`'s `Node::start`/`redis::server::Server` split in
//! `main.rs` away from its Redis-specific bits.
//!
//! `Server::run` is the one FIFO event queue spec §5 requires: every
//! `Command` -- a delivered peer message, a client call, a stop request --
//! and every timer expiry are funneled through a single `tokio::select!`,
//! so the `ConsensusModule` never has two handlers in flight at once.

use std::time::Duration;

use bytes::Bytes;
use log::{error, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::clock::Clock;
use crate::config::RaftConfig;
use crate::consensus::{ConsensusModule, Event};
use crate::errors::CallError;
use crate::messages::Message;
use crate::state::PersistentState;
use crate::store::Store;
use crate::transport::Transport;

/// Everything that can arrive at the actor's queue besides a bare timer
/// expiry. `Deliver` is the transport's inbound hook (spec §2: the engine
/// receives "peer message" events); `Call`/`Stop` back `ServerHandle`'s
/// client-facing methods.
enum Command {
    Deliver(Message),
    Call {
        value: Bytes,
        reply: oneshot::Sender<Result<Bytes, CallError>>,
    },
    Stop(oneshot::Sender<()>),
}

/// Owns the `ConsensusModule` and its inbound queue. `run` consumes `self`
/// and should be spawned onto its own `tokio::task` -- nothing about this
/// type is `Clone`, matching "the store is owned exclusively by its engine"
/// (spec §5).
pub struct Server<S, T, C> {
    module: ConsensusModule<S, T, C>,
    commands: mpsc::Receiver<Command>,
    deadline: tokio::time::Instant,
}

/// A cheap, cloneable front for a running `Server`. This is `Client` from
/// spec §6.3: `call`/`stop` round-trip through the actor's queue via a
/// `oneshot` reply.
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<Command>,
    client_timeout: Duration,
}

/// Queue depth for inbound commands. Generous but bounded: a transport that
/// floods a slow peer should eventually feel backpressure rather than grow
/// memory without limit, which is the one exception to "the engine never
/// blocks" -- `deliver`/`call` awaiting queue space, not the dispatch loop
/// itself.
const COMMAND_QUEUE_DEPTH: usize = 256;

impl<S, T, C> Server<S, T, C>
where
    S: Store,
    T: Transport,
    C: Clock,
{
    /// Builds the actor and its handle. `persistent` is whatever the store
    /// reported on restart (spec §3: "initial persistent state loaded from
    /// the store"); a fresh instance passes `PersistentState::default()`.
    pub fn new(
        config: &RaftConfig,
        persistent: PersistentState,
        store: S,
        transport: T,
        clock: C,
    ) -> (Self, ServerHandle) {
        let (module, initial_timeout) =
            ConsensusModule::new(config.server_id, config.cohort(), persistent, store, transport, clock);
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let server = Server {
            module,
            commands: rx,
            deadline: tokio::time::Instant::now() + initial_timeout,
        };
        let handle = ServerHandle {
            commands: tx,
            client_timeout: config.client_timeout,
        };
        (server, handle)
    }

    /// Drains the command queue and the single outstanding timer to
    /// completion. Returns when told to stop or when the store reports a
    /// fatal failure (spec §3: "terminates ... on an unrecoverable store
    /// error").
    ///
    /// The timer is one `Sleep` pinned for the life of the loop and only
    /// `.reset()` when `dispatch` actually returns `Some(next)` -- spec §5
    /// says "any timer is implicitly cancelled by the next arm", which
    /// means *only* an explicit arm. Reconstructing a fresh `sleep(dur)`
    /// every iteration would instead restart the countdown from now on
    /// every processed event, including ones that return `Ok(None)` (e.g.
    /// `AppendEntriesResponse`/`RequestVoteResponse` handling), starving
    /// the heartbeat/election timer under a steady stream of such events.
    pub async fn run(mut self) {
        let sleep = tokio::time::sleep_until(self.deadline);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => {
                    match self.module.dispatch(Event::Timer).await {
                        Ok(Some(next)) => {
                            self.deadline = tokio::time::Instant::now() + next;
                            sleep.as_mut().reset(self.deadline);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("raft server {} stopping: {}", self.module.id(), e);
                            return;
                        }
                    }
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Deliver(msg)) => {
                            match self.module.dispatch(Event::Peer(msg)).await {
                                Ok(Some(next)) => {
                                    self.deadline = tokio::time::Instant::now() + next;
                                    sleep.as_mut().reset(self.deadline);
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    error!("raft server {} stopping: {}", self.module.id(), e);
                                    return;
                                }
                            }
                        }
                        Some(Command::Call { value, reply }) => {
                            match self.module.dispatch(Event::ClientCall { value, reply }).await {
                                Ok(Some(next)) => {
                                    self.deadline = tokio::time::Instant::now() + next;
                                    sleep.as_mut().reset(self.deadline);
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    error!("raft server {} stopping: {}", self.module.id(), e);
                                    return;
                                }
                            }
                        }
                        Some(Command::Stop(ack)) => {
                            self.module.depose_pending();
                            let _ = ack.send(());
                            return;
                        }
                        None => {
                            // Every handle dropped; nothing left to serve.
                            warn!("raft server {} stopping: no handles remain", self.module.id());
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl ServerHandle {
    /// Client API (spec §6.3): proposes `value` to this server. Returns
    /// `NotLeader`/`Deposed` per the engine's own handling (spec §4.6,
    /// §4.2), or `Timeout` if nothing comes back within
    /// `RaftConfig::client_timeout` -- client-side only, per spec §7 the
    /// engine itself never observes this case.
    pub async fn call(&self, value: Bytes) -> Result<Bytes, CallError> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Call { value, reply: tx })
            .await
            .is_err()
        {
            return Err(CallError::Deposed);
        }
        match timeout(self.client_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Deposed),
            Err(_) => Err(CallError::Timeout),
        }
    }

    /// Graceful shutdown (spec §6.3): pending `froms` receive `Deposed`
    /// before the actor loop exits.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// The transport's inbound hook: every `Message` a real transport
    /// receives for this server should be handed here. Best-effort --
    /// mirrors the fire-and-forget contract of `Transport::cast` itself; if
    /// the actor has already stopped this silently drops the message rather
    /// than erroring, since there is nothing a transport could usefully do
    /// about a dead local actor except log it.
    pub async fn deliver(&self, msg: Message) {
        let _ = self.commands.send(Command::Deliver(msg)).await;
    }
}

