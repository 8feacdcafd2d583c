//! Common configuration structures for LLM providers.

use crate::error::{LlmError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for local LLM providers (Ollama and similar).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalLlmConfig {
    /// Base URL of the local server, e.g. "http://localhost:11434".
    pub base_url: String,
    /// Model name.
    pub model: String,
    /// Request timeout.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

impl LocalLlmConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            timeout: default_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Configuration for remote LLM providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Base URL, e.g. "https://api.anthropic.com".
    pub base_url: String,
    /// Model name.
    pub model: String,
    /// Request timeout.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

impl RemoteLlmConfig {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            timeout: default_timeout(),
        }
    }

    /// Read the API key from an environment variable.
    pub fn from_env(
        env_var: &str,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let api_key = std::env::var(env_var)
            .map_err(|_| LlmError::ApiKeyNotFound(format!("environment variable {env_var}")))?;
        Ok(Self::new(api_key, base_url, model))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(120)
}
