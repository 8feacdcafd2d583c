//! Remote (cloud-hosted) LLM providers.

pub mod claude;

pub use claude::ClaudeClient;
