//! Session management and the HTTP/SSE surface of the hive agent runtime.
//!
//! A session pairs an always-on conversational executor (the queen) with an
//! optional graph executor (the worker) and a scheduled health evaluator
//! (the judge). The [`manager::SessionManager`] owns the session map; the
//! [`api`] module exposes it over HTTP with Server-Sent-Events fan-out.
//!
//! Layout:
//!
//! - [`config`] - TOML + env server configuration
//! - [`paths`] - the `~/.hive` directory layout
//! - [`agent`] - agent spec loading and validation
//! - [`session`] / [`manager`] - session lifecycle and routing
//! - [`queen`] / [`worker`] / [`health`] - the three per-session executors
//! - [`eventlog`] - opt-in JSONL event debug log
//! - [`api`] - axum routes, handlers, SSE

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod eventlog;
pub mod health;
pub mod manager;
pub mod paths;
pub mod queen;
pub mod session;
pub mod worker;

pub use agent::AgentSpec;
pub use config::{ProviderConfig, ProviderKind, ServerConfig};
pub use error::{Result, ServerError};
pub use manager::SessionManager;
pub use session::{ChatTarget, Session};
