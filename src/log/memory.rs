//! In-memory command log.
//!
//! Same contract as the durable log over an ordered map: no disk I/O,
//! no persistence across restarts. Used by tests and by nodes awaiting
//! a snapshot install.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::entry::{sentinel, validate_entry, ClusterConfig, Command, LogEntry, Peer};
use super::pairs::Pairs;
use super::traits::{AppendRequest, CommandLog, EntryIter};
use crate::core::NodeId;
use crate::error::{Error, Result};
use crate::state_machine::SharedStateMachine;

pub struct MemoryLog {
    entries: Option<BTreeMap<u64, LogEntry>>,
    last_entry: Option<LogEntry>,
    cluster_config: Option<ClusterConfig>,
    state_machine: SharedStateMachine,
}

impl MemoryLog {
    /// Open an empty log, optionally seeded with the index-0 sentinel.
    pub fn open(
        state_machine: SharedStateMachine,
        bootstrap: Option<BTreeMap<NodeId, Peer>>,
    ) -> Self {
        let mut entries = BTreeMap::new();
        let mut last_entry = None;
        let mut cluster_config = None;
        if let Some(members) = bootstrap {
            let entry = sentinel(members);
            cluster_config = ClusterConfig::from_entry(&entry).ok();
            entries.insert(0, entry.clone());
            last_entry = Some(entry);
        }
        MemoryLog {
            entries: Some(entries),
            last_entry,
            cluster_config,
            state_machine,
        }
    }

    fn entries(&self) -> Result<&BTreeMap<u64, LogEntry>> {
        self.entries.as_ref().ok_or(Error::NotReady)
    }

    fn config_at(&self, index: u64) -> Result<ClusterConfig> {
        let entry = self.entries()?.get(&index).ok_or_else(|| {
            Error::Internal(format!("membership chain entry {index} missing"))
        })?;
        ClusterConfig::from_entry(entry)
    }
}

#[async_trait]
impl CommandLog for MemoryLog {
    async fn append(&mut self, req: AppendRequest) -> Result<()> {
        let last = self.last_entry.clone().ok_or(Error::NotReady)?;
        let mut config = self.cluster_config.clone().ok_or(Error::NotReady)?;

        if req.prev_index > last.index {
            return Err(Error::TermMismatch(format!(
                "no entry at {}",
                req.prev_index
            )));
        }
        let prev = self
            .entries()?
            .get(&req.prev_index)
            .cloned()
            .ok_or_else(|| Error::TermMismatch(format!("no entry at {}", req.prev_index)))?;
        if prev.term != req.prev_term {
            return Err(Error::TermMismatch(format!(
                "entry {} has term {}, not {}",
                req.prev_index, prev.term, req.prev_term
            )));
        }

        let mut expected = req.prev_index + 1;
        let mut last_term = prev.term;
        let mut truncated = false;
        let mut latest_config_index = config.clog_index;

        let incoming = req.entries.into_iter().map(Ok);
        let existing = self.slice(expected, Some(last.index + 1))?;

        for pair in Pairs::new(incoming, existing) {
            let (incoming, existing) = pair?;
            let Some(entry) = incoming else {
                continue;
            };
            validate_entry(&entry, expected, last_term, req.term)?;
            expected = entry.index + 1;
            last_term = entry.term;

            if let Some(existing) = existing {
                if !truncated && existing.term == entry.term {
                    continue;
                }
                if !truncated {
                    let commit_index = self.state_machine.lock().commit_index();
                    if commit_index >= entry.index {
                        return Err(Error::Internal(format!(
                            "truncate at {} before commit {}",
                            entry.index, commit_index
                        )));
                    }
                    while entry.index <= config.clog_index {
                        let prev_index = config.prev_config_index.ok_or_else(|| {
                            Error::Internal(format!(
                                "membership chain ends at {} above truncation point {}",
                                config.clog_index, entry.index
                            ))
                        })?;
                        config = self.config_at(prev_index)?;
                    }
                    latest_config_index = config.clog_index;
                    self.cluster_config = Some(config.clone());
                    truncated = true;
                }
            }

            let mut entry = entry;
            if entry.command.is_configure() && entry.index > latest_config_index {
                if let Command::Configure {
                    prev_config_index, ..
                } = &mut entry.command
                {
                    *prev_config_index = Some(latest_config_index);
                }
                latest_config_index = entry.index;
                config = ClusterConfig::from_entry(&entry)?;
                self.cluster_config = Some(config.clone());
            }
            self.entries
                .as_mut()
                .ok_or(Error::NotReady)?
                .insert(entry.index, entry.clone());
            self.last_entry = Some(entry);
        }

        let tail = self.last_entry.as_ref().map(|e| e.index).unwrap_or(0);
        if req.commit_index > tail {
            return Err(Error::InvalidIndex(format!(
                "commit ahead of last entry: {} > {}",
                req.commit_index, tail
            )));
        }
        Ok(())
    }

    fn slice(&self, start: u64, end: Option<u64>) -> Result<EntryIter> {
        let entries = self.entries()?;
        let limit = self.last_entry.as_ref().map(|e| e.index + 1).unwrap_or(0);
        let end = end.unwrap_or(u64::MAX).min(limit);
        if end <= start {
            return Ok(Box::new(std::iter::empty()));
        }
        let snapshot: Vec<Result<LogEntry>> = entries
            .range(start..end)
            .map(|(_, e)| Ok(e.clone()))
            .collect();
        Ok(Box::new(snapshot.into_iter()))
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        let entries = self.entries()?;
        match &self.last_entry {
            Some(last) if index <= last.index => Ok(entries.get(&index).cloned()),
            _ => Ok(None),
        }
    }

    fn last(&self) -> Option<LogEntry> {
        self.last_entry.clone()
    }

    fn cluster_config(&self) -> Option<ClusterConfig> {
        self.cluster_config.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.entries = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::shared_register;

    fn members(ids: &[&str]) -> BTreeMap<NodeId, Peer> {
        ids.iter()
            .map(|id| (id.to_string(), Peer::voting()))
            .collect()
    }

    fn user(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            command: Command::User(format!("cmd-{index}")),
        }
    }

    fn request(prev_index: u64, prev_term: u64, entries: Vec<LogEntry>) -> AppendRequest {
        let term = entries.iter().map(|e| e.term).max().unwrap_or(prev_term);
        AppendRequest {
            term,
            prev_index,
            prev_term,
            entries,
            commit_index: 0,
        }
    }

    fn fresh_log() -> MemoryLog {
        MemoryLog::open(shared_register(), Some(members(&["r0", "r1", "r2"])))
    }

    #[tokio::test]
    async fn test_bootstrap_sentinel() {
        let log = fresh_log();
        assert_eq!(log.last().unwrap().index, 0);
        assert_eq!(log.cluster_config().unwrap().clog_index, 0);
    }

    #[tokio::test]
    async fn test_append_and_slice() {
        let mut log = fresh_log();
        log.append(request(0, 0, vec![user(1, 1), user(2, 1)]))
            .await
            .unwrap();
        let indexes: Vec<_> = log
            .slice(0, None)
            .unwrap()
            .map(|e| e.unwrap().index)
            .collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(log.entry(2).await.unwrap().is_some());
        assert!(log.entry(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consistency_check() {
        let mut log = fresh_log();
        let err = log
            .append(request(3, 1, vec![user(4, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TermMismatch(_)));
    }

    #[tokio::test]
    async fn test_truncation_matches_durable_contract() {
        let mut log = fresh_log();
        log.append(request(0, 0, vec![user(1, 1), user(2, 1)]))
            .await
            .unwrap();
        log.append(request(0, 0, vec![user(1, 2), user(2, 2)]))
            .await
            .unwrap();
        let terms: Vec<_> = log
            .slice(0, None)
            .unwrap()
            .map(|e| e.unwrap().term)
            .collect();
        assert_eq!(terms, vec![0, 2, 2]);
    }

    #[tokio::test]
    async fn test_unbootstrapped_rejects_appends() {
        let mut log = MemoryLog::open(shared_register(), None);
        assert!(log.last().is_none());
        let err = log.append(request(0, 0, vec![user(1, 1)])).await.unwrap_err();
        assert_eq!(err, Error::NotReady);
    }

    #[tokio::test]
    async fn test_close_releases_store() {
        let mut log = fresh_log();
        log.close().await.unwrap();
        log.close().await.unwrap();
        assert_eq!(log.slice(0, None).err(), Some(Error::NotReady));
    }
}
