//! A small demo user state machine, used by the test suite and as a
//! reference for embedders -- the engine itself only ever sees `value:
//! Bytes` (spec §3) and has no idea a key-value store lives on the other
//! side of `Store::apply`. Grounded on `dennisss-repo`'s `key_value.rs`
//! usage from `main.rs` (`KeyValueOperation::{Set,Delete}`,
//! `MemoryKVStateMachine`), generalized off the Redis wire format and given
//! an explicit per-key sequence number so it can reject out-of-order
//! updates (spec §8 scenario 6), which the teacher's version did not track.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

/// A single write against the demo state machine. `sequence` is supplied by
/// the client and must be strictly increasing per `key`; this is how the
/// state machine -- not the consensus engine -- detects a replayed or
/// reordered update (spec §8 scenario 6, §7 `UpdatesOutOfOrder`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyValueOperation {
    Set { key: String, value: Vec<u8>, sequence: u64 },
    Delete { key: String, sequence: u64 },
}

/// The result `apply()` hands back to the caller of `call()`. Unlike
/// `consensus::Error`/`CallError`, this travels entirely inside the opaque
/// `Bytes` the engine transports -- "the engine merely transports the
/// value" (spec §8 scenario 6). `UpdatesOutOfOrder` is a normal successful
/// `apply()` outcome from the engine's point of view, not a store failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyValueResult {
    Set,
    Deleted,
    NotFound,
    UpdatesOutOfOrder,
}

struct Entry {
    value: Vec<u8>,
    sequence: u64,
}

/// In-memory key-value state machine. Deterministic: the same operation
/// sequence always produces the same entries and results, which is the one
/// hard requirement spec §4.7 places on any `apply()` target.
#[derive(Default)]
pub struct KeyValueStateMachine {
    entries: Mutex<HashMap<String, Entry>>,
}

impl KeyValueStateMachine {
    pub fn new() -> Self {
        KeyValueStateMachine {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(key).map(|e| e.value.clone())
    }

    /// Applies one operation, enforcing the per-key sequence check.
    /// Called synchronously from `Store::apply` (spec §4.7).
    pub fn apply(&self, op: KeyValueOperation) -> KeyValueResult {
        let mut entries = self.entries.lock().unwrap();
        match op {
            KeyValueOperation::Set { key, value, sequence } => {
                if let Some(existing) = entries.get(&key) {
                    if sequence <= existing.sequence {
                        return KeyValueResult::UpdatesOutOfOrder;
                    }
                }
                entries.insert(key, Entry { value, sequence });
                KeyValueResult::Set
            }
            KeyValueOperation::Delete { key, sequence } => {
                match entries.get(&key) {
                    Some(existing) if sequence <= existing.sequence => {
                        KeyValueResult::UpdatesOutOfOrder
                    }
                    Some(_) => {
                        entries.remove(&key);
                        KeyValueResult::Deleted
                    }
                    None => KeyValueResult::NotFound,
                }
            }
        }
    }

    /// Wraps `apply` as the closure `MemoryStore::new` expects: decode the
    /// opaque `Bytes` as a `KeyValueOperation`, apply it, encode the
    /// `KeyValueResult` back as `Bytes`. Decode/encode failures are treated
    /// as store failures -- a malformed value could only come from a buggy
    /// embedder, never from the protocol itself, since the engine never
    /// inspects `value`.
    pub fn apply_fn(
        self: std::sync::Arc<Self>,
    ) -> impl Fn(&Bytes) -> Result<Bytes, crate::errors::Error> + Send + Sync {
        move |value: &Bytes| {
            let op: KeyValueOperation = serde_json::from_slice(value)
                .map_err(|e| crate::store::store_failure(format!("bad operation: {}", e)))?;
            let result = self.apply(op);
            let encoded = serde_json::to_vec(&result)
                .map_err(|e| crate::store::store_failure(format!("bad result: {}", e)))?;
            Ok(Bytes::from(encoded))
        }
    }
}
