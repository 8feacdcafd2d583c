//! Error types for checkpoint operations.

use thiserror::Error;

/// Convenience result type using [`CheckpointError`].
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur while persisting or loading checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A checkpoint with this id already exists for the session.
    ///
    /// Checkpoints are immutable once written; overwriting is never allowed.
    #[error("checkpoint '{checkpoint_id}' already exists in session '{session_id}'")]
    AlreadyExists {
        session_id: String,
        checkpoint_id: String,
    },

    /// The requested checkpoint does not exist.
    #[error("checkpoint '{checkpoint_id}' not found in session '{session_id}'")]
    NotFound {
        session_id: String,
        checkpoint_id: String,
    },

    /// Snapshot could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying storage I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific failure.
    #[error("storage error: {0}")]
    Storage(String),
}
