//! Error types for the execution engine.
//!
//! Every failure mode the engine distinguishes maps to a variant here, and
//! each surfaces as a distinct event on the bus:
//!
//! | Variant | Surfaced as |
//! |---|---|
//! | `TransientLlm` | `node_retry`, then `execution_failed` on exhaustion |
//! | `Tool` | `tool_call_completed { is_error: true }` |
//! | `Pathology` | `node_stalled` / `node_tool_doom_loop` |
//! | `Validation` | retried with synthesized judge feedback |
//! | `Cancelled` | no terminal success/fail event |
//! | `VisitCap` | `execution_failed { error: "visit cap exceeded" }` |
//! | `StateConflict` | `state_conflict` + `execution_failed` |
//! | `Config` | rejected at load time, before any execution |

use thiserror::Error;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Which pathology terminated a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathologyKind {
    /// Assistant output byte-identical across consecutive turns.
    Stall,
    /// Same tool called with argument-equal input across consecutive
    /// iterations with non-error results.
    ToolDoomLoop,
}

impl std::fmt::Display for PathologyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathologyKind::Stall => write!(f, "stall"),
            PathologyKind::ToolDoomLoop => write!(f, "tool doom loop"),
        }
    }
}

/// Errors raised by the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad agent spec, missing entry node, unknown edge endpoints, and
    /// similar structural problems. Rejected at load time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A retryable LLM failure (timeout, rate limit, connection reset).
    #[error("transient LLM error: {message}")]
    TransientLlm {
        message: String,
        /// False when the provider classified the failure as permanent
        /// (bad request, auth); permanent failures skip the retry budget.
        retryable: bool,
    },

    /// A tool invocation failed outright (as opposed to returning an
    /// error-flagged result the LLM can react to).
    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// The node exhibited a detectable pathology and was terminated.
    #[error("node pathology ({kind}): {detail}")]
    Pathology { kind: PathologyKind, detail: String },

    /// Declared output keys unset at judge ACCEPT.
    #[error("validation error: {0}")]
    Validation(String),

    /// The execution was cancelled by the user or session teardown.
    #[error("execution cancelled")]
    Cancelled,

    /// A node's visit count would exceed its cap.
    #[error("visit cap exceeded for node '{node}'")]
    VisitCap { node: String },

    /// Parallel branches wrote the same key under incompatible isolation.
    #[error("state conflict on key '{key}'")]
    StateConflict { key: String },

    /// Checkpoint persistence failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] hive_checkpoint::CheckpointError),

    /// State or event could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation exceeded its time limit.
    #[error("operation timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// General execution failure without a more specific category.
    #[error("execution failed: {0}")]
    Execution(String),
}

impl EngineError {
    /// Create a transient, retryable LLM error.
    pub fn transient_llm(message: impl Into<String>) -> Self {
        Self::TransientLlm {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a permanent LLM error that bypasses the retry budget.
    pub fn permanent_llm(message: impl Into<String>) -> Self {
        Self::TransientLlm {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a tool failure.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// True when the retry budget applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientLlm { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::transient_llm("rate limited").is_retryable());
        assert!(!EngineError::permanent_llm("bad api key").is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = EngineError::VisitCap {
            node: "plan".to_string(),
        };
        assert_eq!(err.to_string(), "visit cap exceeded for node 'plan'");

        let err = EngineError::Pathology {
            kind: PathologyKind::Stall,
            detail: "3 identical turns".to_string(),
        };
        assert!(err.to_string().contains("stall"));
    }
}
