//! The storage trait checkpoint backends implement.
//!
//! [`CheckpointStore`] abstracts over where snapshots live. The runtime ships
//! two backends: [`crate::MemoryCheckpointStore`] for tests and development,
//! and [`crate::FileCheckpointStore`] for per-session JSON files on disk.
//! Custom backends (databases, object storage) implement the same trait.
//!
//! All backends must preserve two invariants:
//!
//! - checkpoints are write-once: `put` with an existing id fails with
//!   [`crate::CheckpointError::AlreadyExists`];
//! - `list` returns checkpoints in creation order.

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use async_trait::async_trait;

/// Storage backend for execution checkpoints.
///
/// Operations on a single session are serialized by the backend; callers may
/// invoke them concurrently.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint.
    ///
    /// Fails with `AlreadyExists` if the `(session_id, checkpoint_id)` pair
    /// is already present. Checkpoints are never overwritten.
    async fn put(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Fetch one checkpoint, or `None` if absent.
    async fn get(&self, session_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>>;

    /// List a session's checkpoints in creation order.
    async fn list(&self, session_id: &str) -> Result<Vec<Checkpoint>>;

    /// Fetch the most recently created checkpoint for a session.
    async fn latest(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.list(session_id).await?.pop())
    }

    /// Delete one checkpoint. Returns `true` if it existed.
    async fn delete(&self, session_id: &str, checkpoint_id: &str) -> Result<bool>;

    /// Delete all checkpoints for a session, returning how many were removed.
    async fn delete_session(&self, session_id: &str) -> Result<usize>;
}
