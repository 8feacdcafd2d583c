//! LLM provider implementations for the hive agent runtime.
//!
//! This crate provides concrete implementations of the
//! [`hive_core::llm::CompletionModel`] trait:
//!
//! - [`remote::ClaudeClient`] - Anthropic's messages API with SSE streaming
//! - [`local::OllamaClient`] - Ollama's chat API with NDJSON streaming
//!
//! Both stream token deltas and assemble tool calls into the final
//! [`hive_core::llm::CompletionTurn`]. Provider failures are classified as
//! transient or permanent (see [`LlmError::is_transient`]) so the engine's
//! backoff budget applies only where a retry can help.
//!
//! # Example
//!
//! ```rust,ignore
//! use hive_llm::{remote::ClaudeClient, RemoteLlmConfig};
//! use hive_core::llm::{ChatMessage, CompletionModel, CompletionRequest};
//!
//! let config = RemoteLlmConfig::from_env(
//!     "ANTHROPIC_API_KEY",
//!     "https://api.anthropic.com",
//!     "claude-sonnet-4-20250514",
//! )?;
//! let client = ClaudeClient::new(config);
//!
//! let turn = client
//!     .complete(CompletionRequest::new(vec![ChatMessage::user("Hello!")]))
//!     .await?;
//! println!("{}", turn.text);
//! ```

pub mod config;
pub mod error;
pub mod local;
pub mod remote;

pub use config::{LocalLlmConfig, RemoteLlmConfig};
pub use error::{LlmError, Result};
