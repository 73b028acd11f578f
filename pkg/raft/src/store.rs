//! The durable store adapter contract (spec §6.1). Out of scope: this
//! crate never dictates an on-disk layout. `Store` is the seam; a real
//! embedder backs it with a write-ahead log and a durable metadata file.
//! `MemoryStore` below is the reference/test implementation.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::errors::{Error, ErrorKind};
use crate::state::PersistentState;
use crate::types::{LogEntry, LogIndex, Term};

/// The durable log + persistent metadata + user state machine, as seen by
/// the consensus engine. Every method here is one of the four permitted
/// blocking operations from spec §5, or one of the synchronous reads; the
/// actor loop in `server.rs` awaits each call to completion before
/// dequeuing the next event.
#[async_trait]
pub trait Store: Send + Sync {
    /// `(index, term)` of the last log entry, or `(0, 0)` for an empty log.
    async fn last(&self) -> (LogIndex, Term);

    /// Term at a given index, if present. `termAt(0)` is conventionally 0.
    async fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.lookup(index).await.map(|e| e.term)
    }

    /// The entry at `index`, if present.
    async fn lookup(&self, index: LogIndex) -> Option<LogEntry>;

    /// Up to `max` entries starting at `from_index`, in index order.
    async fn range(&self, from_index: LogIndex, max: usize) -> Vec<LogEntry>;

    /// Appends `entries` contiguously after `last().index`. Returns the
    /// index of the first appended entry.
    async fn append(&self, entries: Vec<LogEntry>) -> Result<LogIndex, Error>;

    /// Discards every entry with index > `keep_up_to`. Idempotent (R1).
    async fn truncate(&self, keep_up_to: LogIndex) -> Result<(), Error>;

    /// Hands `value` to the deterministic user state machine and returns
    /// its result.
    async fn apply(&self, value: Bytes) -> Result<Bytes, Error>;

    /// Durably persists `term`/`voted_for` before returning. Must complete
    /// before any action that depends on them is externally observable
    /// (the persist barrier in `consensus.rs`).
    async fn save_state(&self, state: &PersistentState) -> Result<(), Error>;
}

/// An in-memory `Store`, used by tests and as a reference implementation.
/// Not durable across process restarts -- that would defeat the point of a
/// test double that runs fast and resets cleanly between cases.
pub struct MemoryStore<F> {
    inner: Mutex<MemoryStoreInner>,
    apply_fn: F,
}

struct MemoryStoreInner {
    log: Vec<LogEntry>,
    persistent: PersistentState,
}

impl<F> MemoryStore<F>
where
    F: Fn(&Bytes) -> Result<Bytes, Error> + Send + Sync,
{
    pub fn new(apply_fn: F) -> Self {
        MemoryStore {
            inner: Mutex::new(MemoryStoreInner {
                log: Vec::new(),
                persistent: PersistentState::default(),
            }),
            apply_fn,
        }
    }

    pub async fn persistent_state(&self) -> PersistentState {
        self.inner.lock().await.persistent.clone()
    }
}

#[async_trait]
impl<F> Store for MemoryStore<F>
where
    F: Fn(&Bytes) -> Result<Bytes, Error> + Send + Sync,
{
    async fn last(&self) -> (LogIndex, Term) {
        let inner = self.inner.lock().await;
        match inner.log.last() {
            Some(e) => (inner.log.len() as LogIndex, e.term),
            None => (0, 0),
        }
    }

    async fn lookup(&self, index: LogIndex) -> Option<LogEntry> {
        if index == 0 {
            return None;
        }
        let inner = self.inner.lock().await;
        inner.log.get((index - 1) as usize).cloned()
    }

    async fn range(&self, from_index: LogIndex, max: usize) -> Vec<LogEntry> {
        if from_index == 0 {
            return Vec::new();
        }
        let inner = self.inner.lock().await;
        let start = (from_index - 1) as usize;
        if start >= inner.log.len() {
            return Vec::new();
        }
        let end = (start + max).min(inner.log.len());
        inner.log[start..end].to_vec()
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<LogIndex, Error> {
        let mut inner = self.inner.lock().await;
        let first = inner.log.len() as LogIndex + 1;
        inner.log.extend(entries);
        Ok(first)
    }

    async fn truncate(&self, keep_up_to: LogIndex) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.log.truncate(keep_up_to as usize);
        Ok(())
    }

    async fn apply(&self, value: Bytes) -> Result<Bytes, Error> {
        (self.apply_fn)(&value)
    }

    async fn save_state(&self, state: &PersistentState) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.persistent = state.clone();
        Ok(())
    }
}

/// Helper for wrapping a store failure as the engine's fatal `Error`.
pub fn store_failure(reason: impl Into<String>) -> Error {
    ErrorKind::StoreFailure(reason.into()).into()
}
