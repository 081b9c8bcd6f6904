//! Command-log abstraction.
//!
//! The log stores entries densely indexed from 0 and tracks the chain
//! of `Configure` entries. Appends carry the leader's consistency-check
//! coordinates; each accepted entry is durable before the next is
//! processed. Implementations serialize `append` calls (`&mut self`);
//! `slice` is read-only and observes a consistent prefix.

use async_trait::async_trait;

use super::entry::{ClusterConfig, LogEntry};
use crate::error::Result;

/// Lazy, bounded, single-pass sequence of entries.
pub type EntryIter = Box<dyn Iterator<Item = Result<LogEntry>> + Send>;

/// An append request, shaped like the entries section of an
/// AppendEntries RPC.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    /// Term of the request; no entry may carry a term beyond it.
    pub term: u64,
    /// Index of the entry immediately preceding `entries`.
    pub prev_index: u64,
    /// Term of the entry at `prev_index`.
    pub prev_term: u64,
    /// Entries to store, indexed contiguously from `prev_index + 1`.
    pub entries: Vec<LogEntry>,
    /// The sender's commit index; must not run ahead of our tail once
    /// the entries are stored.
    pub commit_index: u64,
}

/// The replicated command log.
#[async_trait]
pub trait CommandLog: Send {
    /// Append `req.entries` after the consistency check at
    /// `(prev_index, prev_term)`, truncating a diverged tail by
    /// overwrite. See the append algorithm notes on the durable
    /// implementation.
    async fn append(&mut self, req: AppendRequest) -> Result<()>;

    /// Entries with `start <= index < min(end, last.index + 1)`, in
    /// order. Empty when `end <= start`.
    fn slice(&self, start: u64, end: Option<u64>) -> Result<EntryIter>;

    /// Point read. Indexes beyond the tail read as absent, even when a
    /// stale row from an overwrite-truncation remains in the store.
    async fn entry(&self, index: u64) -> Result<Option<LogEntry>>;

    /// Snapshot of the last entry. `None` only for a log opened without
    /// bootstrap state (awaiting snapshot install).
    fn last(&self) -> Option<LogEntry>;

    /// The membership installed by the latest `Configure` entry.
    fn cluster_config(&self) -> Option<ClusterConfig>;

    /// Release the backing store. Idempotent.
    async fn close(&mut self) -> Result<()>;
}
