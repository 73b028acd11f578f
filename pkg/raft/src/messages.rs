//! Wire-level message schema (spec §6.2). Field names are normative.

use crate::types::{LogEntry, LogIndex, ServerId, Term};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub source: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub source: ServerId,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub source: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub commit_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub source: ServerId,
    pub success: bool,
    pub match_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    RequestVoteRequest(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

/// A single message bound for one peer, handed to `Transport::cast`
/// alongside its destination. `to` duplicates the recipient `cast` already
/// takes as an argument; it travels with the message anyway so a transport
/// whose `cast` is a generic sink (e.g. one `mpsc` queue shared by every
/// peer) can still route on the envelope alone.
#[derive(Debug, Clone)]
pub struct Message {
    pub to: ServerId,
    pub body: MessageBody,
}
