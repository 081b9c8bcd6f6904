//! In-memory properties store for tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{Patch, Properties};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct MemoryProps {
    values: Mutex<Option<BTreeMap<String, serde_json::Value>>>,
}

impl MemoryProps {
    /// An unopened store; operations fail `NotReady` until `open`.
    pub fn new() -> Self {
        MemoryProps::default()
    }

    /// An already-opened store, for tests that skip the open step.
    pub fn ready() -> Self {
        MemoryProps {
            values: Mutex::new(Some(BTreeMap::new())),
        }
    }
}

#[async_trait]
impl Properties for MemoryProps {
    async fn open(&mut self) -> Result<()> {
        let mut values = self.values.lock();
        if values.is_none() {
            *values = Some(BTreeMap::new());
        }
        Ok(())
    }

    async fn write(&self, patch: Patch) -> Result<()> {
        let mut values = self.values.lock();
        let values = values.as_mut().ok_or(Error::NotReady)?;
        for (key, value) in patch {
            values.insert(key, value);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let values = self.values.lock();
        let values = values.as_ref().ok_or(Error::NotReady)?;
        Ok(values.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock();
        let values = values.as_mut().ok_or(Error::NotReady)?;
        values.remove(key);
        Ok(())
    }
}
