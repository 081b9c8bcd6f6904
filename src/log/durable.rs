//! Durable command log over a sled tree.
//!
//! One ordered keyspace holds both the entries (`log/<index-be64>`) and
//! the two cached properties `last_log_index` and `cluster_config_index`
//! (see [`super::keys`]). Every mutation is a single `sled::Batch`
//! applied and flushed before the next begins, so the log is consistent
//! at every durable point: an interrupted append leaves it at the last
//! committed entry.
//!
//! Truncation is by overwrite. Rows beyond the cached tail may be stale
//! leftovers of a shortened log and read as absent.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::entry::{sentinel, validate_entry, ClusterConfig, Command, LogEntry, Peer};
use super::keys::{log_key, log_span, prop_key, CLUSTER_CONFIG_INDEX, LAST_LOG_INDEX};
use super::pairs::Pairs;
use super::traits::{AppendRequest, CommandLog, EntryIter};
use crate::core::NodeId;
use crate::error::{Error, Result};
use crate::state_machine::SharedStateMachine;

pub struct DurableLog {
    tree: Option<sled::Tree>,
    last_entry: Option<LogEntry>,
    cluster_config: Option<ClusterConfig>,
    state_machine: SharedStateMachine,
}

impl DurableLog {
    /// Open the log. Existing state wins; otherwise `bootstrap`
    /// membership seeds the index-0 sentinel; otherwise the log stays
    /// empty and rejects appends until a snapshot install populates the
    /// tree and it is reopened.
    pub async fn open(
        tree: sled::Tree,
        state_machine: SharedStateMachine,
        bootstrap: Option<BTreeMap<NodeId, Peer>>,
    ) -> Result<Self> {
        let last_index: Option<u64> = tree
            .get(prop_key(LAST_LOG_INDEX))?
            .map(|v| serde_json::from_slice(&v))
            .transpose()?;

        if let Some(last_index) = last_index {
            return Self::recover(tree, state_machine, last_index).await;
        }

        let Some(members) = bootstrap else {
            debug!("command log opened empty, awaiting snapshot install");
            return Ok(DurableLog {
                tree: Some(tree),
                last_entry: None,
                cluster_config: None,
                state_machine,
            });
        };

        let entry = sentinel(members);
        let mut batch = sled::Batch::default();
        batch.insert(log_key(0).to_vec(), serde_json::to_vec(&entry)?);
        batch.insert(prop_key(LAST_LOG_INDEX), serde_json::to_vec(&0u64)?);
        batch.insert(prop_key(CLUSTER_CONFIG_INDEX), serde_json::to_vec(&0u64)?);
        tree.apply_batch(batch)?;
        tree.flush_async().await?;
        info!("command log bootstrapped with initial membership");

        let config = ClusterConfig::from_entry(&entry)?;
        Ok(DurableLog {
            tree: Some(tree),
            last_entry: Some(entry),
            cluster_config: Some(config),
            state_machine,
        })
    }

    async fn recover(
        tree: sled::Tree,
        state_machine: SharedStateMachine,
        last_index: u64,
    ) -> Result<Self> {
        let last_entry = read_entry(&tree, last_index)?.ok_or_else(|| {
            Error::Internal(format!("tail entry {last_index} missing from store"))
        })?;

        // The cluster_config_index property is a cache of the chain
        // head; verify it names a membership entry and rebuild from the
        // tail otherwise.
        let cached: Option<u64> = tree
            .get(prop_key(CLUSTER_CONFIG_INDEX))?
            .map(|v| serde_json::from_slice(&v))
            .transpose()?;
        let config = match cached {
            Some(index) if index <= last_index => match read_entry(&tree, index)? {
                Some(entry) if entry.command.is_configure() => {
                    Some(ClusterConfig::from_entry(&entry)?)
                }
                _ => None,
            },
            _ => None,
        };
        let config = match config {
            Some(config) => config,
            None => {
                warn!("cluster config cache invalid, rescanning log");
                let config = rebuild_config(&tree, last_index)?;
                tree.insert(
                    prop_key(CLUSTER_CONFIG_INDEX),
                    serde_json::to_vec(&config.clog_index)?,
                )?;
                tree.flush_async().await?;
                config
            }
        };

        debug!(
            last_index,
            config_index = config.clog_index,
            "command log recovered"
        );
        Ok(DurableLog {
            tree: Some(tree),
            last_entry: Some(last_entry),
            cluster_config: Some(config),
            state_machine,
        })
    }

    fn tree(&self) -> Result<&sled::Tree> {
        self.tree.as_ref().ok_or(Error::NotReady)
    }

    /// Load the membership entry at `index` from the chain.
    fn config_at(&self, index: u64) -> Result<ClusterConfig> {
        let entry = read_entry(self.tree()?, index)?.ok_or_else(|| {
            Error::Internal(format!("membership chain entry {index} missing"))
        })?;
        ClusterConfig::from_entry(&entry)
    }
}

#[async_trait]
impl CommandLog for DurableLog {
    async fn append(&mut self, req: AppendRequest) -> Result<()> {
        let last = self.last_entry.clone().ok_or(Error::NotReady)?;
        let mut config = self.cluster_config.clone().ok_or(Error::NotReady)?;

        // Consistency check. Indexes beyond the tail count as missing
        // even when a stale row is still in the store.
        if req.prev_index > last.index {
            return Err(Error::TermMismatch(format!(
                "no entry at {}",
                req.prev_index
            )));
        }
        let prev = read_entry(self.tree()?, req.prev_index)?.ok_or_else(|| {
            Error::TermMismatch(format!("no entry at {}", req.prev_index))
        })?;
        if prev.term != req.prev_term {
            return Err(Error::TermMismatch(format!(
                "entry {} has term {}, not {}",
                req.prev_index, prev.term, req.prev_term
            )));
        }

        let mut expected = req.prev_index + 1;
        let mut last_term = prev.term;
        let mut truncated = false;
        // Highest membership index whose batch has committed in this
        // call; new Configure entries link back to it.
        let mut latest_config_index = config.clog_index;
        // Set when truncation walks the chain back: the next batch must
        // rewrite the cached cluster_config_index.
        let mut config_rewrite: Option<u64> = None;

        let incoming = req.entries.into_iter().map(Ok);
        let existing = self.slice(expected, Some(last.index + 1))?;

        for pair in Pairs::new(incoming, existing) {
            let (incoming, existing) = pair?;
            let Some(entry) = incoming else {
                // Entries past the incoming stream; left in place
                // unless a truncation moved the tail below them.
                continue;
            };
            validate_entry(&entry, expected, last_term, req.term)?;
            expected = entry.index + 1;
            last_term = entry.term;

            if let Some(existing) = existing {
                if !truncated && existing.term == entry.term {
                    // Already present; nothing to write.
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
                    config_rewrite = Some(config.clog_index);
                    truncated = true;
                    info!(
                        from = entry.index,
                        config_index = config.clog_index,
                        "truncating diverged tail"
                    );
                }
            }

            // Build the durable batch for this entry.
            let mut entry = entry;
            let mut batch = sled::Batch::default();
            if let Some(index) = config_rewrite.take() {
                batch.insert(prop_key(CLUSTER_CONFIG_INDEX), serde_json::to_vec(&index)?);
            }
            let mut new_config = None;
            if entry.command.is_configure() && entry.index > latest_config_index {
                if let Command::Configure {
                    prev_config_index, ..
                } = &mut entry.command
                {
                    *prev_config_index = Some(latest_config_index);
                }
                batch.insert(
                    prop_key(CLUSTER_CONFIG_INDEX),
                    serde_json::to_vec(&entry.index)?,
                );
                latest_config_index = entry.index;
                new_config = Some(ClusterConfig::from_entry(&entry)?);
            }
            batch.insert(log_key(entry.index).to_vec(), serde_json::to_vec(&entry)?);
            batch.insert(prop_key(LAST_LOG_INDEX), serde_json::to_vec(&entry.index)?);

            let tree = self.tree()?;
            tree.apply_batch(batch)?;
            tree.flush_async().await?;

            // Cache updates land only after the batch is durable.
            self.last_entry = Some(entry);
            if let Some(new_config) = new_config {
                config = new_config.clone();
                self.cluster_config = Some(new_config);
            } else if truncated {
                self.cluster_config = Some(config.clone());
            }
        }

        // The sender must not have committed past our tail.
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
        let tree = self.tree()?.clone();
        let limit = self.last_entry.as_ref().map(|e| e.index + 1).unwrap_or(0);
        let end = end.unwrap_or(u64::MAX).min(limit);
        if end <= start {
            return Ok(Box::new(std::iter::empty()));
        }
        let iter = tree.range(log_span(start, end)).map(|kv| -> Result<LogEntry> {
            let (_, value) = kv.map_err(Error::from)?;
            Ok(serde_json::from_slice(&value)?)
        });
        Ok(Box::new(iter))
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        let tree = self.tree()?;
        match &self.last_entry {
            Some(last) if index <= last.index => read_entry(tree, index),
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
        if let Some(tree) = self.tree.take() {
            tree.flush_async().await?;
        }
        Ok(())
    }
}

fn read_entry(tree: &sled::Tree, index: u64) -> Result<Option<LogEntry>> {
    tree.get(log_key(index))?
        .map(|v| serde_json::from_slice(&v).map_err(Error::from))
        .transpose()
}

/// Scan backward from the tail for the latest membership entry. Used
/// when the cached `cluster_config_index` does not survive verification.
fn rebuild_config(tree: &sled::Tree, last_index: u64) -> Result<ClusterConfig> {
    for kv in tree.range(log_span(0, last_index + 1)).rev() {
        let (_, value) = kv?;
        let entry: LogEntry = serde_json::from_slice(&value)?;
        if entry.command.is_configure() {
            return ClusterConfig::from_entry(&entry);
        }
    }
    Err(Error::Internal(
        "no membership entry found in log".to_string(),
    ))
}
