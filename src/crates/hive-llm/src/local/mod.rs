//! Local (self-hosted) LLM providers.

pub mod ollama;

pub use ollama::OllamaClient;
