//! The transport adapter contract (spec §2, §6.2). Best-effort, one-way,
//! fire-and-forget: may drop, duplicate, delay, or reorder. The engine
//! never blocks on `cast` (spec §5) -- it is an `async fn` purely so a real
//! implementation can perform I/O without blocking the caller's executor,
//! not because the engine waits on it.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::messages::Message;
use crate::types::ServerId;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort send of `msg` to `peer`. Errors are swallowed by the
    /// implementation (there is no delivery guarantee to violate); this
    /// returns nothing because the engine has nothing useful to do with a
    /// cast failure other than wait for the next heartbeat/retry.
    async fn cast(&self, peer: ServerId, msg: Message);
}

/// An in-process `Transport` built on `tokio::sync::mpsc`, for tests and
/// single-process demos. Each peer gets its own bounded channel; `cast`
/// drops the message silently if the peer's channel is full or gone,
/// matching the "best-effort" contract rather than propagating backpressure
/// into the sender.
pub struct ChannelTransport {
    peers: std::collections::HashMap<ServerId, mpsc::Sender<(ServerId, Message)>>,
    self_id: ServerId,
}

impl ChannelTransport {
    pub fn new(
        self_id: ServerId,
        peers: std::collections::HashMap<ServerId, mpsc::Sender<(ServerId, Message)>>,
    ) -> Self {
        ChannelTransport { peers, self_id }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn cast(&self, peer: ServerId, msg: Message) {
        if let Some(sender) = self.peers.get(&peer) {
            // A full channel means the peer is backed up; dropping here is
            // exactly the "may drop" clause of the contract.
            let _ = sender.try_send((self.self_id, msg));
        }
    }
}
