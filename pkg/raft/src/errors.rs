//! Error types for the consensus engine.
//!
//! Only store failures and a defensive "this should never happen" case are
//! fatal to the engine (spec: StoreFailure, UnknownEvent). Everything else
//! -- stale terms, rejected votes, log conflicts -- is protocol-level noise
//! handled inline by the decision tables in `consensus.rs` and never
//! surfaced as an `Error`.

error_chain! {
    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        /// A store operation (`save_state`/`append`/`truncate`/`apply`/
        /// reads) failed. Fatal: the engine stops and the process must be
        /// restarted by its operator.
        StoreFailure(reason: String) {
            description("store operation failed")
            display("store failure: {}", reason)
        }

        /// An event arrived that does not match any handler. Defensive;
        /// should be unreachable given the four event kinds the engine
        /// accepts.
        UnknownEvent {
            description("event did not match any handler")
        }
    }
}

/// Errors returned to a client via the `call`/`stop` API (spec §6.3, §7).
/// Kept separate from `Error` because these cross the actor/client boundary
/// as plain values returned from `Server::call`, never propagated with `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The contacted server is not the current leader. Retry against
    /// another peer; `leader_hint` names the server we last believed (or
    /// currently believe) to be leader, if known.
    NotLeader { leader_hint: Option<crate::types::ServerId> },

    /// The server accepted the request while leader but lost leadership
    /// before the entry was applied. The client must retry; idempotence at
    /// the state machine layer is the caller's responsibility.
    Deposed,

    /// No reply arrived within `RaftConfig::client_timeout`. Client-side
    /// only -- the engine itself never observes this.
    Timeout,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::NotLeader { leader_hint } => {
                write!(f, "not leader (hint: {:?})", leader_hint)
            }
            CallError::Deposed => write!(f, "deposed before entry was applied"),
            CallError::Timeout => write!(f, "client call timed out"),
        }
    }
}

impl std::error::Error for CallError {}
