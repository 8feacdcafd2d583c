//! The execution record: one live run of a graph from an entry point.
//!
//! [`Execution`] tracks identity (`execution_id`, `graph_id`, `stream_id`),
//! the trigger input, the executor's position, per-node visit counts, and
//! accumulated outputs. Lifecycle:
//! `Pending -> Running -> (Paused <-> Running)* -> {Completed | Failed | Cancelled}`.
//! Terminal states are sticky: once reached, [`Execution::set_status`]
//! refuses further transitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are write-once.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// One live run of a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub graph_id: String,
    /// Entry-point id that triggered this run.
    pub stream_id: String,
    pub input: Map<String, Value>,
    pub current_node: Option<String>,
    visit_counts: HashMap<String, u32>,
    pub outputs: Map<String, Value>,
    status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    /// Create a pending execution with a fresh UUID.
    pub fn new(
        graph_id: impl Into<String>,
        stream_id: impl Into<String>,
        input: Map<String, Value>,
    ) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            graph_id: graph_id.into(),
            stream_id: stream_id.into(),
            input,
            current_node: None,
            visit_counts: HashMap::new(),
            outputs: Map::new(),
            status: ExecutionStatus::Pending,
            error: None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Transition to `status`. Returns `false` (and leaves the record
    /// untouched) when the current status is already terminal.
    pub fn set_status(&mut self, status: ExecutionStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    /// Visit count for one node.
    pub fn visit_count(&self, node: &str) -> u32 {
        self.visit_counts.get(node).copied().unwrap_or(0)
    }

    /// Increment and return the visit count for one node.
    pub fn record_visit(&mut self, node: &str) -> u32 {
        let count = self.visit_counts.entry(node.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Add externally accumulated visits (parallel branch merge).
    pub fn add_visits(&mut self, increments: &HashMap<String, u32>) {
        for (node, increment) in increments {
            *self.visit_counts.entry(node.clone()).or_insert(0) += increment;
        }
    }

    pub fn visit_counts(&self) -> &HashMap<String, u32> {
        &self.visit_counts
    }

    /// Replace visit counts (checkpoint restore).
    pub fn set_visit_counts(&mut self, counts: HashMap<String, u32>) {
        self.visit_counts = counts;
    }
}
