//! Sled-backed properties store.

use async_trait::async_trait;

use super::traits::{Patch, Properties};
use crate::error::{Error, Result};

pub struct DurableProps {
    tree: sled::Tree,
    ready: bool,
}

impl DurableProps {
    /// Wrap a tree. The store stays unusable until [`Properties::open`].
    pub fn new(tree: sled::Tree) -> Self {
        DurableProps { tree, ready: false }
    }

    fn tree(&self) -> Result<&sled::Tree> {
        if self.ready {
            Ok(&self.tree)
        } else {
            Err(Error::NotReady)
        }
    }
}

#[async_trait]
impl Properties for DurableProps {
    async fn open(&mut self) -> Result<()> {
        if !self.ready {
            self.tree.flush_async().await?;
            self.ready = true;
        }
        Ok(())
    }

    async fn write(&self, patch: Patch) -> Result<()> {
        let tree = self.tree()?;
        let mut batch = sled::Batch::default();
        for (key, value) in &patch {
            batch.insert(key.as_bytes(), serde_json::to_vec(value)?);
        }
        tree.apply_batch(batch)?;
        tree.flush_async().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.tree()?
            .get(key.as_bytes())?
            .map(|v| serde_json::from_slice(&v).map_err(Error::from))
            .transpose()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let tree = self.tree()?;
        tree.remove(key.as_bytes())?;
        tree.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (sled::Db, sled::Tree) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("props").unwrap();
        (db, tree)
    }

    #[tokio::test]
    async fn test_not_ready_before_open() {
        let (_db, tree) = store();
        let props = DurableProps::new(tree);
        assert_eq!(props.get("currentTerm").await, Err(Error::NotReady));
        assert_eq!(props.write(vec![]).await, Err(Error::NotReady));
        assert_eq!(props.delete("votedFor").await, Err(Error::NotReady));
    }

    #[tokio::test]
    async fn test_patch_round_trip() {
        let (_db, tree) = store();
        let mut props = DurableProps::new(tree);
        props.open().await.unwrap();
        props
            .write(vec![
                ("currentTerm".to_string(), json!(3)),
                ("votedFor".to_string(), json!("r1")),
            ])
            .await
            .unwrap();
        assert_eq!(props.get("currentTerm").await.unwrap(), Some(json!(3)));
        assert_eq!(props.get("votedFor").await.unwrap(), Some(json!("r1")));
        assert_eq!(props.get("missing").await.unwrap(), None);

        props.delete("votedFor").await.unwrap();
        assert_eq!(props.get("votedFor").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reopen_recovers_values() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let mut props = DurableProps::new(db.open_tree("props").unwrap());
            props.open().await.unwrap();
            props
                .write(vec![("currentTerm".to_string(), json!(7))])
                .await
                .unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let mut props = DurableProps::new(db.open_tree("props").unwrap());
        props.open().await.unwrap();
        assert_eq!(props.get("currentTerm").await.unwrap(), Some(json!(7)));
    }
}
