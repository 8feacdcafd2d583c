//! The worker: a session's graph executor runtime.
//!
//! A worker holds the graphs of one loaded agent and runs them on demand as
//! [`ExecutionStream`]s. One injection router is shared across all streams
//! so chat routing can find any node blocked on `client_input_requested`.

use crate::agent::AgentSpec;
use crate::error::{Result, ServerError};
use dashmap::DashMap;
use hive_core::bus::EventBus;
use hive_core::judge::JudgeProtocol;
use hive_core::llm::CompletionModel;
use hive_core::node::{InjectionRouter, NodeRuntime};
use hive_core::state::SharedState;
use hive_core::stream::ExecutionStream;
use hive_core::tool::ToolRegistry;
use hive_core::{Execution, Graph};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Graph executor runtime for one loaded agent.
pub struct WorkerRuntime {
    pub worker_id: String,
    pub agent: AgentSpec,
    graphs: HashMap<String, Arc<Graph>>,
    node_runtime: NodeRuntime,
    bus: EventBus,
    state: SharedState,
    injections: InjectionRouter,
    streams: DashMap<String, Arc<ExecutionStream>>,
}

impl WorkerRuntime {
    /// Build a worker from a validated agent spec.
    pub fn new(
        worker_id: impl Into<String>,
        agent: AgentSpec,
        model: Arc<dyn CompletionModel>,
        model_name: Option<String>,
        tools: ToolRegistry,
        bus: EventBus,
        state: SharedState,
    ) -> Self {
        let mut judge = JudgeProtocol::new()
            .with_rules(agent.judge_rules.clone())
            .with_model(Arc::clone(&model));
        if let Some(threshold) = agent.judge_confidence_threshold {
            judge = judge.with_confidence_threshold(threshold);
        }

        let graphs = agent
            .graphs
            .iter()
            .map(|graph| (graph.id.clone(), Arc::new(graph.clone())))
            .collect();

        Self {
            worker_id: worker_id.into(),
            agent,
            graphs,
            node_runtime: NodeRuntime::new(model)
                .with_model_name(model_name)
                .with_tools(tools)
                .with_judge(judge),
            bus,
            state,
            injections: InjectionRouter::new(),
            streams: DashMap::new(),
        }
    }

    /// Start an execution from a named entry point. Returns the execution id.
    pub fn trigger(&self, entry_point_id: &str, input: Map<String, Value>) -> Result<String> {
        let (graph, entry_point) = self
            .agent
            .resolve_entry_point(entry_point_id)
            .ok_or_else(|| ServerError::EntryPointNotFound(entry_point_id.to_string()))?;
        let graph = Arc::clone(
            self.graphs
                .get(&graph.id)
                .expect("resolved graph is registered"),
        );

        if matches!(entry_point.trigger, hive_core::TriggerSource::Webhook) {
            self.bus.publish(
                hive_core::AgentEvent::new(hive_core::EventType::WebhookReceived, &entry_point.id)
                    .with_data("entry_point_id", entry_point.id.clone())
                    .with_data("input", Value::Object(input.clone())),
            );
        }

        let stream = ExecutionStream::new(
            graph,
            self.node_runtime.clone(),
            &entry_point.id,
            &entry_point.target_node,
            input,
            self.state.clone(),
            &self.bus,
            self.injections.clone(),
        );
        let execution_id = stream.execution_id();
        stream.start();
        tracing::info!(
            worker_id = %self.worker_id,
            entry_point = entry_point_id,
            execution_id = %execution_id,
            "execution triggered"
        );
        self.streams.insert(execution_id.clone(), Arc::new(stream));
        Ok(execution_id)
    }

    /// Start an execution positioned at a checkpoint's snapshot.
    pub fn start_restored(
        &self,
        graph_id: &str,
        stream_id: &str,
        current_node: Option<String>,
        visit_counts: HashMap<String, u32>,
        conversations: &std::collections::BTreeMap<String, Value>,
    ) -> Result<String> {
        let graph = self
            .graphs
            .get(graph_id)
            .cloned()
            .ok_or_else(|| ServerError::GraphNotFound(graph_id.to_string()))?;
        let start = current_node
            .clone()
            .unwrap_or_else(|| graph.entry_node.clone());

        let stream = ExecutionStream::new(
            graph,
            self.node_runtime.clone(),
            stream_id,
            start,
            Map::new(),
            self.state.clone(),
            &self.bus,
            self.injections.clone(),
        );
        stream.restore(current_node, visit_counts, conversations);
        let execution_id = stream.execution_id();
        stream.start();
        self.streams.insert(execution_id.clone(), Arc::new(stream));
        Ok(execution_id)
    }

    pub fn stream(&self, execution_id: &str) -> Option<Arc<ExecutionStream>> {
        self.streams.get(execution_id).map(|s| Arc::clone(&s))
    }

    /// Snapshots of every known execution, newest last.
    pub fn executions(&self) -> Vec<Execution> {
        let mut executions: Vec<Execution> = self
            .streams
            .iter()
            .map(|entry| entry.value().execution_snapshot())
            .collect();
        executions.sort_by_key(|e| e.execution_id.clone());
        executions
    }

    /// Streams that have not reached a terminal state.
    pub fn active_streams(&self) -> Vec<Arc<ExecutionStream>> {
        self.streams
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Deliver input to a blocked node on any stream.
    pub fn inject(&self, node_id: &str, content: &str) -> bool {
        self.injections.deliver(node_id, content)
    }

    /// Nodes currently blocked on client input.
    pub fn blocked_nodes(&self) -> Vec<String> {
        self.injections.blocked_nodes()
    }

    pub fn any_blocked(&self) -> bool {
        self.injections.any_blocked()
    }

    pub fn graph(&self, graph_id: &str) -> Option<Arc<Graph>> {
        self.graphs.get(graph_id).cloned()
    }

    pub fn graph_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.graphs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Aggregate visit counts for one graph across all executions.
    pub fn visit_counts_for(&self, graph_id: &str) -> HashMap<String, u32> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for entry in self.streams.iter() {
            let snapshot = entry.value().execution_snapshot();
            if snapshot.graph_id == graph_id {
                for (node, count) in snapshot.visit_counts() {
                    *counts.entry(node.clone()).or_insert(0) += count;
                }
            }
        }
        counts
    }

    /// Cancel every stream. Used at unload and session teardown.
    pub fn shutdown(&self) {
        for entry in self.streams.iter() {
            if !entry.value().status().is_terminal() {
                entry.value().cancel();
            }
        }
        tracing::info!(worker_id = %self.worker_id, "worker shut down");
    }

    /// Count of executions by terminality, for session detail responses.
    pub fn execution_counts(&self) -> (usize, usize) {
        let mut active = 0;
        let mut finished = 0;
        for entry in self.streams.iter() {
            if entry.value().status().is_terminal() {
                finished += 1;
            } else {
                active += 1;
            }
        }
        (active, finished)
    }
}
