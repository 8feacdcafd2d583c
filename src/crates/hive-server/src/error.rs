//! Server-side error type, mapped onto HTTP responses by the API layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors surfaced by the session manager and runtimes.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session '{0}' has no worker loaded")]
    NoWorker(String),

    #[error("entry point '{0}' not found")]
    EntryPointNotFound(String),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("graph '{0}' not found")]
    GraphNotFound(String),

    #[error("checkpoint '{0}' not found")]
    CheckpointNotFound(String),

    #[error("no worker input pending and the queen is not accepting chat")]
    ChatUndeliverable,

    #[error("nothing to resume")]
    NothingToResume,

    #[error(transparent)]
    Engine(#[from] hive_core::EngineError),

    #[error(transparent)]
    Checkpoint(#[from] hive_checkpoint::CheckpointError),
}
