//! JSON-file checkpoint storage.
//!
//! Persists each checkpoint as a single JSON file under
//! `{root}/{session_id}/{checkpoint_id}.json`. Writes are atomic: the
//! snapshot is written to a temp file in the same directory and renamed into
//! place. Listing parses the session directory and sorts by creation
//! timestamp. When a TTL is configured, [`FileCheckpointStore::evict_expired`]
//! removes snapshots past their lifetime.

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, Result};
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Checkpoint store backed by per-session JSON files.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
    ttl: Option<Duration>,
}

impl FileCheckpointStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ttl: None,
        }
    }

    /// Evict checkpoints older than `ttl` during [`Self::evict_expired`].
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        validate_component(session_id)?;
        Ok(self.root.join(session_id))
    }

    fn checkpoint_path(&self, session_id: &str, checkpoint_id: &str) -> Result<PathBuf> {
        validate_component(checkpoint_id)?;
        Ok(self.session_dir(session_id)?.join(format!("{checkpoint_id}.json")))
    }

    /// Remove checkpoints whose age exceeds the configured TTL.
    ///
    /// Returns the number of evicted snapshots. No-op when no TTL is set.
    pub async fn evict_expired(&self) -> Result<usize> {
        let Some(ttl) = self.ttl else { return Ok(0) };
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CheckpointError::Storage(format!("invalid ttl: {e}")))?;
        let cutoff = chrono::Utc::now() - ttl;

        let mut evicted = 0;
        let mut sessions = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = sessions.next_entry().await? {
            let session_id = entry.file_name().to_string_lossy().into_owned();
            for checkpoint in self.list(&session_id).await? {
                if checkpoint.created_at < cutoff {
                    if self.delete(&session_id, &checkpoint.checkpoint_id).await? {
                        evicted += 1;
                    }
                }
            }
        }
        if evicted > 0 {
            tracing::info!(evicted, "evicted expired checkpoints");
        }
        Ok(evicted)
    }
}

/// Reject ids that would escape the store's directory.
fn validate_component(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(CheckpointError::Storage(format!(
            "invalid checkpoint path component: '{id}'"
        )));
    }
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        let dir = self.session_dir(&checkpoint.session_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.checkpoint_path(&checkpoint.session_id, &checkpoint.checkpoint_id)?;
        if tokio::fs::try_exists(&path).await? {
            return Err(CheckpointError::AlreadyExists {
                session_id: checkpoint.session_id,
                checkpoint_id: checkpoint.checkpoint_id,
            });
        }

        // Atomic write: temp file in the same directory, then rename.
        let tmp = dir.join(format!("{}.json.tmp", checkpoint.checkpoint_id));
        let encoded = serde_json::to_vec_pretty(&checkpoint)?;
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(
            session_id = %checkpoint.session_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            "checkpoint written"
        );
        Ok(())
    }

    async fn get(&self, session_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path(session_id, checkpoint_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        let dir = self.session_dir(session_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Checkpoint>(&bytes) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
                }
            }
        }

        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(checkpoints)
    }

    async fn delete(&self, session_id: &str, checkpoint_id: &str) -> Result<bool> {
        let path = self.checkpoint_path(session_id, checkpoint_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<usize> {
        let count = self.list(session_id).await?.len();
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
