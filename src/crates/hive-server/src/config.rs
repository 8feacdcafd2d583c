//! Server configuration: TOML file with environment overrides.

use hive_core::state::IsolationPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which LLM provider backs the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Claude,
    Ollama,
}

/// Provider selection and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    /// Base URL override; defaults per provider.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key (remote providers).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Claude,
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: None,
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Hive home directory; `None` means `~/.hive`.
    pub data_dir: Option<PathBuf>,
    pub provider: ProviderConfig,
    /// Shared-state isolation for new sessions.
    pub isolation: IsolationPolicy,
    /// Write every event to a JSONL debug log.
    pub event_log: bool,
    /// Per-SSE-client queue capacity.
    pub sse_queue_capacity: usize,
    /// SSE keepalive comment interval, seconds.
    pub keepalive_secs: u64,
    /// Health judge tick interval, seconds.
    pub health_interval_secs: u64,
    /// Checkpoint TTL in seconds; `None` disables eviction.
    pub checkpoint_ttl_secs: Option<u64>,
    /// Max concurrent LLM calls; excess calls queue FIFO.
    pub llm_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9187,
            data_dir: None,
            provider: ProviderConfig::default(),
            isolation: IsolationPolicy::Shared,
            event_log: false,
            sse_queue_capacity: 1_000,
            keepalive_secs: 15,
            health_interval_secs: 30,
            checkpoint_ttl_secs: None,
            llm_concurrency: 4,
        }
    }
}

impl ServerConfig {
    /// Load from an explicit path, or `HIVE_CONFIG`, or defaults. `HIVE_HOST`
    /// and `HIVE_PORT` override the file.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match path
            .map(PathBuf::from)
            .or_else(|| std::env::var("HIVE_CONFIG").ok().map(PathBuf::from))
        {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };

        if let Ok(host) = std::env::var("HIVE_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("HIVE_PORT") {
            config.port = port.parse()?;
        }
        Ok(config)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn checkpoint_ttl(&self) -> Option<Duration> {
        self.checkpoint_ttl_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 9187);
        assert_eq!(config.sse_queue_capacity, 1_000);
        assert_eq!(config.keepalive_secs, 15);
        assert_eq!(config.isolation, IsolationPolicy::Shared);
        assert!(!config.event_log);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 8099
            event_log = true

            [provider]
            kind = "ollama"
            model = "llama3"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 8099);
        assert!(config.event_log);
        assert_eq!(config.provider.kind, ProviderKind::Ollama);
        // Untouched fields keep their defaults.
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.llm_concurrency, 4);
    }
}
