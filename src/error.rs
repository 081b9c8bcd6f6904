//! Crate-wide error type.
//!
//! Every fallible operation in the crate reports one of these kinds.
//! RPC-level kinds (`InvalidTerm`, `InvalidIndex`, `TermMismatch`,
//! `NotLeader`) are surfaced to callers; storage failures fold into
//! `Internal` and abort the in-flight operation without corrupting
//! on-disk state (every mutation is a single atomic batch).

use crate::core::NodeId;

/// Errors produced by the command log, the properties store, the role
/// machine, and the message bus.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum Error {
    /// Request term is behind ours, or an entry's term exceeds the
    /// request term. Reported, not retried.
    #[error("invalid term: {0}")]
    InvalidTerm(String),

    /// Non-monotonic entry index, or a commit index ahead of the log
    /// tail.
    #[error("invalid index: {0}")]
    InvalidIndex(String),

    /// Consistency check failed: no entry at `prev_index`, or its term
    /// differs from `prev_term`. The leader retries at a lower index.
    #[error("term mismatch: {0}")]
    TermMismatch(String),

    /// A client contacted a non-leader. Carries the best-known leader.
    #[error("not the leader")]
    NotLeader { leader_hint: Option<NodeId> },

    /// Component used before initialization completed.
    #[error("not ready")]
    NotReady,

    /// Backing-store I/O failure, or an attempted truncation at or
    /// below the state machine's commit index. Fatal to the operation,
    /// not to the node.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Internal(format!("sled: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("codec: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
