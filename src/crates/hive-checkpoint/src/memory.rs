//! In-memory checkpoint storage for development and testing.
//!
//! Stores all checkpoints in a `RwLock<HashMap>` keyed by session id.
//! Ephemeral: data is lost on restart. Includes [`MemoryCheckpointStore::clear`]
//! for test isolation.

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, Result};
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe in-memory checkpoint store.
///
/// Cloning is cheap; clones share the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    sessions: Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all checkpoints across all sessions.
    pub fn clear(&self) {
        self.sessions.write().clear();
    }

    /// Total number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.sessions.read().values().map(Vec::len).sum()
    }

    /// True if no checkpoints are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut sessions = self.sessions.write();
        let entries = sessions
            .entry(checkpoint.session_id.clone())
            .or_default();

        if entries
            .iter()
            .any(|c| c.checkpoint_id == checkpoint.checkpoint_id)
        {
            return Err(CheckpointError::AlreadyExists {
                session_id: checkpoint.session_id,
                checkpoint_id: checkpoint.checkpoint_id,
            });
        }

        entries.push(checkpoint);
        Ok(())
    }

    async fn get(&self, session_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|c| c.checkpoint_id == checkpoint_id)
                    .cloned()
            }))
    }

    async fn list(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, session_id: &str, checkpoint_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.write();
        let Some(entries) = sessions.get_mut(session_id) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|c| c.checkpoint_id != checkpoint_id);
        Ok(entries.len() != before)
    }

    async fn delete_session(&self, session_id: &str) -> Result<usize> {
        Ok(self
            .sessions
            .write()
            .remove(session_id)
            .map(|entries| entries.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(session: &str) -> Checkpoint {
        Checkpoint::new(session, "exec-1")
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryCheckpointStore::new();
        let cp = checkpoint("s1");
        let id = cp.checkpoint_id.clone();

        store.put(cp).await.unwrap();

        let restored = store.get("s1", &id).await.unwrap().unwrap();
        assert_eq!(restored.checkpoint_id, id);
        assert!(store.get("s1", "missing").await.unwrap().is_none());
        assert!(store.get("other", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_rejects_duplicate_id() {
        let store = MemoryCheckpointStore::new();
        let cp = checkpoint("s1");

        store.put(cp.clone()).await.unwrap();
        let err = store.put(cp).await.unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_list_returns_creation_order() {
        let store = MemoryCheckpointStore::new();
        let first = checkpoint("s1");
        let second = checkpoint("s1");
        let ids = vec![first.checkpoint_id.clone(), second.checkpoint_id.clone()];

        store.put(first).await.unwrap();
        store.put(second).await.unwrap();

        let listed: Vec<String> = store
            .list("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.checkpoint_id)
            .collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_latest() {
        let store = MemoryCheckpointStore::new();
        assert!(store.latest("s1").await.unwrap().is_none());

        let first = checkpoint("s1");
        let second = checkpoint("s1");
        let last_id = second.checkpoint_id.clone();
        store.put(first).await.unwrap();
        store.put(second).await.unwrap();

        let latest = store.latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, last_id);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryCheckpointStore::new();
        let cp = checkpoint("s1");
        let id = cp.checkpoint_id.clone();
        store.put(cp).await.unwrap();

        assert!(store.delete("s1", &id).await.unwrap());
        assert!(!store.delete("s1", &id).await.unwrap());
        assert!(store.get("s1", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_session() {
        let store = MemoryCheckpointStore::new();
        store.put(checkpoint("s1")).await.unwrap();
        store.put(checkpoint("s1")).await.unwrap();
        store.put(checkpoint("s2")).await.unwrap();

        assert_eq!(store.delete_session("s1").await.unwrap(), 2);
        assert_eq!(store.delete_session("s1").await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }
}
