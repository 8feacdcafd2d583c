//! Checkpoint persistence for the hive agent runtime.
//!
//! A checkpoint is an immutable snapshot of one execution's state: the
//! shared-state map, the in-flight node conversations, the current node, and
//! the per-node visit counts. Checkpoints make executions pausable,
//! resumable, and replayable.
//!
//! The crate provides:
//!
//! - [`Checkpoint`] - the snapshot type, keyed by `(session_id, checkpoint_id)`
//! - [`CheckpointStore`] - the storage trait backends implement
//! - [`MemoryCheckpointStore`] - in-memory backend for development and tests
//! - [`FileCheckpointStore`] - JSON-file backend with atomic writes and
//!   optional TTL eviction
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use hive_checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
//!
//! let store = MemoryCheckpointStore::new();
//!
//! let checkpoint = Checkpoint::new("session-1", "exec-1")
//!     .with_current_node("summarize")
//!     .with_state_entry("draft", serde_json::json!("..."));
//!
//! store.put(checkpoint.clone()).await?;
//!
//! let restored = store.get("session-1", &checkpoint.checkpoint_id).await?;
//! assert!(restored.is_some());
//! ```
//!
//! Checkpoints are write-once: a second `put` with the same id is rejected
//! with [`CheckpointError::AlreadyExists`]. Listing returns checkpoints in
//! creation order.

pub mod checkpoint;
pub mod error;
pub mod fs;
pub mod memory;
pub mod traits;

pub use checkpoint::Checkpoint;
pub use error::{CheckpointError, Result};
pub use fs::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use traits::CheckpointStore;
