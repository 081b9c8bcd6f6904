//! Wire envelopes and outbound-message bookkeeping types.

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;

/// Peer identifier.
pub type NodeId = String;

/// Identifier the node assigns to each outbound message so late or
/// cancelled responses can be matched and discarded.
pub type MessageId = u64;

/// AppendEntries RPC arguments. A heartbeat is the same request with
/// whatever entries the follower is missing (possibly none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReq {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResp {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReq {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResp {
    pub term: u64,
    pub vote_granted: bool,
}

/// Snapshot transfer envelope; opaque to the core, delegated to the
/// configured snapshot installer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotReq {
    pub term: u64,
    pub leader_id: NodeId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResp {
    pub term: u64,
    pub success: bool,
}

/// A request envelope on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    AppendEntries(AppendEntriesReq),
    RequestVote(RequestVoteReq),
    InstallSnapshot(InstallSnapshotReq),
}

/// A response envelope on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    AppendEntries(AppendEntriesResp),
    RequestVote(RequestVoteResp),
    InstallSnapshot(InstallSnapshotResp),
}

/// An outbound message produced by a node handler, addressed and
/// tagged for response tracking. The server loop (or a test harness)
/// hands these to the bus adapter.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub id: MessageId,
    pub to: NodeId,
    pub message: Message,
}

/// Reply to a client submission, sent once the entry commits (or
/// immediately when this node is not the leader).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientResponse {
    pub leader_id: Option<NodeId>,
    pub entry_term: u64,
    pub entry_index: u64,
    pub success: bool,
}
