//! Error types for LLM provider implementations.

use thiserror::Error;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur when working with LLM providers.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API authentication failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// API key not found in the environment.
    #[error("API key not found: {0}")]
    ApiKeyNotFound(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// Provider overloaded or unavailable (e.g. Ollama not running, 5xx).
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The provider returned something unparsable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// General provider error.
    #[error("provider error: {0}")]
    Provider(String),
}

impl LlmError {
    /// True when the engine's retry budget applies: the same request may
    /// succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::RateLimited(_) | LlmError::ServiceUnavailable(_) => true,
            LlmError::Authentication(_)
            | LlmError::ApiKeyNotFound(_)
            | LlmError::InvalidRequest(_)
            | LlmError::InvalidResponse(_)
            | LlmError::Provider(_) => false,
        }
    }
}

impl From<LlmError> for hive_core::EngineError {
    fn from(error: LlmError) -> Self {
        hive_core::EngineError::TransientLlm {
            retryable: error.is_transient(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::RateLimited("429".to_string()).is_transient());
        assert!(LlmError::ServiceUnavailable("529".to_string()).is_transient());
        assert!(!LlmError::Authentication("401".to_string()).is_transient());
        assert!(!LlmError::InvalidRequest("400".to_string()).is_transient());
    }

    #[test]
    fn test_converts_to_engine_error() {
        let engine: hive_core::EngineError = LlmError::RateLimited("slow down".to_string()).into();
        assert!(engine.is_retryable());

        let engine: hive_core::EngineError =
            LlmError::Authentication("bad key".to_string()).into();
        assert!(!engine.is_retryable());
    }
}
