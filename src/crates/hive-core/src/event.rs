//! Typed events and the envelope that carries them.
//!
//! Every internal state change in the runtime is published as an
//! [`AgentEvent`]: an envelope pairing a closed [`EventType`] with the scope
//! tuple `(graph_id, stream_id, node_id, execution_id)` that uniquely locates
//! it, a free-form JSON payload, and a timestamp. Events are what SSE
//! subscribers see, what the health judge inspects, and what the debug log
//! records, so the envelope round-trips through JSON losslessly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

/// The closed set of event types the runtime emits.
///
/// `StreamStarted` and `ContextCompacted` are reserved: they are part of the
/// wire format today, but their emitters are gated behind the
/// `reserved-events` feature until wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionPaused,
    ExecutionResumed,
    NodeLoopStarted,
    NodeLoopIteration,
    NodeLoopCompleted,
    LlmTextDelta,
    LlmReasoningDelta,
    ToolCallStarted,
    ToolCallCompleted,
    ClientOutputDelta,
    ClientInputRequested,
    NodeInternalOutput,
    NodeInputBlocked,
    NodeStalled,
    NodeRetry,
    NodeToolDoomLoop,
    JudgeVerdict,
    OutputKeySet,
    EdgeTraversed,
    StateChanged,
    StateConflict,
    GoalProgress,
    GoalAchieved,
    ConstraintViolation,
    WorkerEscalationTicket,
    QueenInterventionRequested,
    EscalationRequested,
    WebhookReceived,
    StreamStarted,
    ContextCompacted,
    Custom,
}

impl EventType {
    /// Snake_case wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionStarted => "execution_started",
            EventType::ExecutionCompleted => "execution_completed",
            EventType::ExecutionFailed => "execution_failed",
            EventType::ExecutionPaused => "execution_paused",
            EventType::ExecutionResumed => "execution_resumed",
            EventType::NodeLoopStarted => "node_loop_started",
            EventType::NodeLoopIteration => "node_loop_iteration",
            EventType::NodeLoopCompleted => "node_loop_completed",
            EventType::LlmTextDelta => "llm_text_delta",
            EventType::LlmReasoningDelta => "llm_reasoning_delta",
            EventType::ToolCallStarted => "tool_call_started",
            EventType::ToolCallCompleted => "tool_call_completed",
            EventType::ClientOutputDelta => "client_output_delta",
            EventType::ClientInputRequested => "client_input_requested",
            EventType::NodeInternalOutput => "node_internal_output",
            EventType::NodeInputBlocked => "node_input_blocked",
            EventType::NodeStalled => "node_stalled",
            EventType::NodeRetry => "node_retry",
            EventType::NodeToolDoomLoop => "node_tool_doom_loop",
            EventType::JudgeVerdict => "judge_verdict",
            EventType::OutputKeySet => "output_key_set",
            EventType::EdgeTraversed => "edge_traversed",
            EventType::StateChanged => "state_changed",
            EventType::StateConflict => "state_conflict",
            EventType::GoalProgress => "goal_progress",
            EventType::GoalAchieved => "goal_achieved",
            EventType::ConstraintViolation => "constraint_violation",
            EventType::WorkerEscalationTicket => "worker_escalation_ticket",
            EventType::QueenInterventionRequested => "queen_intervention_requested",
            EventType::EscalationRequested => "escalation_requested",
            EventType::WebhookReceived => "webhook_received",
            EventType::StreamStarted => "stream_started",
            EventType::ContextCompacted => "context_compacted",
            EventType::Custom => "custom",
        }
    }

    /// The canonical set of client-relevant types, used as the default SSE
    /// subscription filter when a client does not name its own.
    pub fn client_default_set() -> Vec<EventType> {
        vec![
            EventType::ExecutionStarted,
            EventType::ExecutionCompleted,
            EventType::ExecutionFailed,
            EventType::ExecutionPaused,
            EventType::ExecutionResumed,
            EventType::NodeLoopStarted,
            EventType::NodeLoopCompleted,
            EventType::ClientOutputDelta,
            EventType::ClientInputRequested,
            EventType::ToolCallStarted,
            EventType::ToolCallCompleted,
            EventType::JudgeVerdict,
            EventType::EdgeTraversed,
            EventType::GoalProgress,
            EventType::GoalAchieved,
            EventType::ConstraintViolation,
            EventType::WorkerEscalationTicket,
            EventType::QueenInterventionRequested,
            EventType::EscalationRequested,
        ]
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type: '{s}'"))
    }
}

/// The envelope carrying one runtime event.
///
/// The identity tuple `(graph_id, stream_id, node_id, execution_id)` uniquely
/// locates an event; every event published by an execution carries that
/// execution's id (the bus stamps missing scope fields, see
/// [`crate::bus::EventBus::child`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub stream_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AgentEvent {
    /// Create an event with the current timestamp and empty payload.
    pub fn new(event_type: EventType, stream_id: impl Into<String>) -> Self {
        Self {
            event_type,
            stream_id: stream_id.into(),
            node_id: None,
            execution_id: None,
            graph_id: None,
            data: Map::new(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Set the node id.
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set the execution id.
    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Set the graph id.
    pub fn with_graph(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = Some(graph_id.into());
        self
    }

    /// Add one payload entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Serialize to a single JSON line (the SSE and debug-log format).
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
