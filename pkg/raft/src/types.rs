//! Core identifiers and the log entry shape (spec §3).

use bytes::Bytes;

/// Uniquely identifies a cohort member. Assigned by the embedder; the
/// engine never allocates one itself (member addition is out of scope).
pub type ServerId = u64;

/// Monotonically nondecreasing election epoch (I1).
pub type Term = u64;

/// 1-based log position. Index 0 denotes "no entry".
pub type LogIndex = u64;

/// A single log entry: a term stamp and an opaque value handed to the user
/// state machine on apply. Immutable once durably appended, except by
/// truncation of a contiguous suffix (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub value: Bytes,
}

/// A `(term, index)` pair identifying a specific log position. Used both to
/// name a proposal and to describe `prevLogIndex`/`prevLogTerm` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub term: Term,
    pub index: LogIndex,
}
