//! Durable small key/value for node properties.
//!
//! Holds `currentTerm` and `votedFor`. Writes are atomic over the
//! patch: either every key in it commits or none does. Durable
//! implementations flush before signalling completion. Every operation
//! fails `NotReady` until `open` has completed.

use async_trait::async_trait;

use crate::error::Result;

/// A set of key/value assignments committed together.
pub type Patch = Vec<(String, serde_json::Value)>;

#[async_trait]
pub trait Properties: Send + Sync {
    /// Signal readiness. Idempotent.
    async fn open(&mut self) -> Result<()>;

    /// Commit every assignment in `patch` atomically, durably for
    /// durable implementations.
    async fn write(&self, patch: Patch) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn delete(&self, key: &str) -> Result<()>;
}
