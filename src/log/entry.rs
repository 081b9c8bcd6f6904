//! Log entry and cluster-membership types.
//!
//! Entries are totally ordered by `index`. Index 0 is a sentinel
//! bootstrap entry (`term = 0`) carrying the initial membership as a
//! `Configure` command, which removes the first-entry special case from
//! the consistency check. `Configure` entries form a backward chain via
//! `prev_config_index`, walkable for safe truncation under membership
//! churn.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::NodeId;
use crate::error::{Error, Result};

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log; dense from 0.
    pub index: u64,
    /// Election term the entry was created in.
    pub term: u64,
    /// Command carried by the entry.
    pub command: Command,
}

/// Command stored in a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Opaque client payload, forwarded to the state machine on commit.
    User(String),
    /// Cluster membership change. `prev_config_index` links to the
    /// previous `Configure` entry; the log fills it in at write time.
    Configure {
        members: BTreeMap<NodeId, Peer>,
        prev_config_index: Option<u64>,
    },
}

impl Command {
    /// True for membership-change commands.
    pub fn is_configure(&self) -> bool {
        matches!(self, Command::Configure { .. })
    }
}

/// A cluster member as recorded in a `Configure` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Whether this peer's vote and replication ack count toward
    /// majorities. Demoted peers still receive entries.
    pub voting: bool,
}

impl Peer {
    pub fn voting() -> Self {
        Peer { voting: true }
    }

    pub fn non_voting() -> Self {
        Peer { voting: false }
    }
}

/// The membership installed by the most recent `Configure` entry at or
/// below the log tail, together with the index that installed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub members: BTreeMap<NodeId, Peer>,
    /// Index of the `Configure` entry that installed this membership.
    pub clog_index: u64,
    /// Index of the previous `Configure` entry, absent at index 0.
    pub prev_config_index: Option<u64>,
}

impl ClusterConfig {
    /// Build from a `Configure` entry. Returns `Internal` if the entry
    /// carries a user command.
    pub fn from_entry(entry: &LogEntry) -> Result<Self> {
        match &entry.command {
            Command::Configure {
                members,
                prev_config_index,
            } => Ok(ClusterConfig {
                members: members.clone(),
                clog_index: entry.index,
                prev_config_index: *prev_config_index,
            }),
            Command::User(_) => Err(Error::Internal(format!(
                "entry {} is not a membership entry",
                entry.index
            ))),
        }
    }

    /// Ids of peers whose votes and acks count toward majority, in
    /// sorted order.
    pub fn voting_ids(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|(_, p)| p.voting)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_voting(&self, id: &str) -> bool {
        self.members.get(id).map(|p| p.voting).unwrap_or(false)
    }

    /// Smallest count that constitutes a majority of voting members.
    pub fn majority(&self) -> usize {
        self.voting_ids().len() / 2 + 1
    }
}

/// The bootstrap sentinel: index 0, term 0, installing `members`.
pub fn sentinel(members: BTreeMap<NodeId, Peer>) -> LogEntry {
    LogEntry {
        index: 0,
        term: 0,
        command: Command::Configure {
            members,
            prev_config_index: None,
        },
    }
}

/// Per-entry invariant check shared by both log backends: the incoming
/// entry must sit exactly at `expected`, terms must be nondecreasing
/// from `last_term`, and no entry may carry a term beyond the request's.
pub fn validate_entry(
    entry: &LogEntry,
    expected: u64,
    last_term: u64,
    request_term: u64,
) -> Result<()> {
    if entry.index != expected {
        return Err(Error::InvalidIndex(format!(
            "entry index {} where {} expected",
            entry.index, expected
        )));
    }
    if entry.term < last_term {
        return Err(Error::InvalidTerm(format!(
            "entry {} term {} below preceding term {}",
            entry.index, entry.term, last_term
        )));
    }
    if entry.term > request_term {
        return Err(Error::InvalidTerm(format!(
            "entry {} term {} beyond request term {}",
            entry.index, entry.term, request_term
        )));
    }
    Ok(())
}
