//! # hive-core - Execution engine for the hive agent runtime
//!
//! Hive executes LLM-driven agents defined as directed graphs of nodes. This
//! crate is the engine: it walks node graphs, runs each node's bounded
//! LLM + tool iteration loop, publishes every internal state change as a
//! typed event, and keeps executions pausable, resumable, and replayable
//! through shared state and checkpoints.
//!
//! ## Architecture
//!
//! ```text
//!  trigger ──▶ ExecutionStream ──▶ GraphExecutor ──▶ EventLoopNode
//!                  │ scope-stamped bus    │ edges, retries,   │ LLM stream + tools
//!                  │                      │ fan-out, caps     │ + judge gating
//!                  ▼                      ▼                   ▼
//!              EventBus ◀───────── every component publishes events
//!                  │
//!                  ▼
//!              SharedState ──▶ CheckpointStore (hive-checkpoint)
//! ```
//!
//! ## Module map
//!
//! - [`event`] / [`bus`] - the typed event envelope and the filtered
//!   pub/sub bus with bounded subscriber queues and scope stamping
//! - [`state`] - per-session key/value state with isolation policies
//! - [`conversation`] - the append-only turn log of one node invocation
//! - [`graph`] - the immutable graph spec, edge conditions, validation
//! - [`node`] - the event-loop node: iteration loop, pathology detection,
//!   synthetic tools, client-input blocking
//! - [`executor`] - the graph walk: edge selection, retries, parallel
//!   fan-out with staged state merges
//! - [`execution`] / [`stream`] - the execution record and the live
//!   stream handle (pause / resume / cancel / inject)
//! - [`judge`] - triangulated verdicts: rules, LLM, implicit CONTINUE
//! - [`llm`] - the provider-agnostic streaming completion trait
//! - [`tool`] - tool registry and invocation contract
//! - [`retry`] - exponential backoff for transient failures
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use hive_core::prelude::*;
//! use std::sync::Arc;
//!
//! let graph = Arc::new(
//!     Graph::new("pipeline", "draft")
//!         .with_node(NodeSpec::event_loop("draft").with_system_prompt("Draft the reply."))
//!         .with_node(NodeSpec::event_loop("review"))
//!         .with_edge(EdgeSpec::new("draft", "review", EdgeCondition::OnSuccess)),
//! );
//! graph.validate()?;
//!
//! let bus = EventBus::new();
//! let state = SharedState::with_bus(IsolationPolicy::Shared, bus.clone());
//! let runtime = NodeRuntime::new(model); // any Arc<dyn CompletionModel>
//!
//! let stream = ExecutionStream::new(
//!     graph, runtime, "manual", "draft",
//!     serde_json::Map::new(), state, &bus, InjectionRouter::new(),
//! );
//! stream.start();
//! ```

pub mod bus;
pub mod conversation;
pub mod error;
pub mod event;
pub mod execution;
pub mod executor;
pub mod graph;
pub mod judge;
pub mod llm;
pub mod node;
pub mod retry;
pub mod state;
pub mod stream;
pub mod tool;

pub use bus::{EventBus, EventFilter, EventScope, EventSubscription, DEFAULT_QUEUE_CAPACITY};
pub use conversation::{NodeConversation, Turn, TurnRole};
pub use error::{EngineError, PathologyKind, Result};
pub use event::{AgentEvent, EventType};
pub use execution::{Execution, ExecutionStatus};
pub use executor::{ExecutionEnv, GraphExecutor};
pub use graph::{
    Condition, ConditionContext, EdgeCondition, EdgeSpec, EntryPointSpec, Graph, NodeKind,
    NodeSpec, OutputKeySpec, TriggerSource,
};
pub use judge::{
    EvaluationRule, JudgeContext, JudgeKind, JudgeOutcome, JudgeProtocol, RuleAction, Verdict,
};
pub use llm::{
    ChatMessage, ChatRole, CompletionChunk, CompletionModel, CompletionRequest, CompletionStream,
    CompletionTurn, ThrottledModel, ToolCallRequest, Usage,
};
pub use node::{
    run_function_node, EventLoopNode, ExecutionControls, FunctionRegistry, InjectionRouter,
    NodeResult, NodeRuntime, NodeStatus,
};
pub use retry::BackoffPolicy;
pub use state::{IsolationPolicy, ScopedState, SharedState, StateSnapshot};
pub use stream::ExecutionStream;
pub use tool::{
    is_synthetic, synthetic_definitions, Tool, ToolDefinition, ToolOutcome, ToolRegistry,
    ESCALATE_TO_CODER, SET_OUTPUT,
};

/// Commonly used types in one import.
pub mod prelude {
    pub use crate::bus::{EventBus, EventFilter, EventScope};
    pub use crate::error::{EngineError, Result};
    pub use crate::event::{AgentEvent, EventType};
    pub use crate::execution::{Execution, ExecutionStatus};
    pub use crate::executor::{ExecutionEnv, GraphExecutor};
    pub use crate::graph::{
        Condition, EdgeCondition, EdgeSpec, EntryPointSpec, Graph, NodeKind, NodeSpec,
        OutputKeySpec, TriggerSource,
    };
    pub use crate::judge::{EvaluationRule, JudgeProtocol, RuleAction, Verdict};
    pub use crate::llm::{CompletionModel, CompletionRequest};
    pub use crate::node::{FunctionRegistry, InjectionRouter, NodeRuntime, NodeStatus};
    pub use crate::state::{IsolationPolicy, SharedState};
    pub use crate::stream::ExecutionStream;
    pub use crate::tool::{Tool, ToolRegistry};
}
