//! Walks a graph for one execution: node runs, edge selection, retries,
//! parallel fan-out.
//!
//! The executor is single-threaded within an execution except at declared
//! fan-out points: a node with multiple `always`/`on_success` outgoing edges
//! of equal priority spawns one task per branch. Branches run against a
//! private copy of the shared state; their writes are staged and merged when
//! every branch reaches the nearest common descendant. Overlapping writes
//! raise `state_conflict` and fail the execution under `Shared`/`Isolated`
//! isolation; under `Synchronized` they are serialized by key and the later
//! branch wins.
//!
//! Edge selection walks outgoing edges in ascending priority (declaration
//! order on ties) and takes the first match. An edge whose target is at its
//! visit cap fails that edge and the next is tried; if a matching edge was
//! only blocked by a cap and nothing else fired, the execution fails with
//! `"visit cap exceeded"` rather than completing.
//!
//! Node-level retry is distinct from LLM-level retry: a failed node
//! re-enters from scratch with a fresh conversation, up to its
//! `max_retries`, before `on_failure` edges are consulted.
//!
//! The execution record lives behind a mutex so the owning
//! [`crate::stream::ExecutionStream`] can read status, position, and visit
//! counts (for checkpoints) while the walk is in flight. The lock is only
//! held for synchronous bookkeeping, never across an await.

use crate::bus::EventBus;
use crate::conversation::NodeConversation;
use crate::error::{EngineError, Result};
use crate::event::{AgentEvent, EventType};
use crate::execution::{Execution, ExecutionStatus};
use crate::graph::{ConditionContext, EdgeCondition, EdgeSpec, Graph, NodeKind, NodeSpec};
use crate::llm::{ChatMessage, CompletionRequest};
use crate::node::{
    run_function_node, EventLoopNode, ExecutionControls, InjectionRouter, NodeResult, NodeRuntime,
    NodeStatus,
};
use crate::state::{IsolationPolicy, ScopedState, SharedState, StateSnapshot};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Live node conversations of one execution, keyed by node id. Kept
/// reachable so a paused execution can be checkpointed mid-node.
pub type ConversationMap = Arc<Mutex<HashMap<String, Arc<Mutex<NodeConversation>>>>>;

/// Everything an execution runs inside.
#[derive(Clone)]
pub struct ExecutionEnv {
    pub state: SharedState,
    /// Scope-stamping bus for this execution.
    pub bus: EventBus,
    pub controls: ExecutionControls,
    pub injections: InjectionRouter,
    pub conversations: ConversationMap,
}

impl ExecutionEnv {
    pub fn new(
        state: SharedState,
        bus: EventBus,
        controls: ExecutionControls,
        injections: InjectionRouter,
    ) -> Self {
        Self {
            state,
            bus,
            controls,
            injections,
            conversations: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Result of probing a node's outgoing edges.
enum EdgeSelection {
    /// This edge fires.
    Selected(EdgeSpec),
    /// No edge condition matched at all.
    NoneMatched,
    /// At least one edge matched but every match was blocked by its
    /// target's visit cap.
    CapBlocked,
}

struct BranchOutcome {
    succeeded: bool,
    cancelled: bool,
    error: Option<String>,
    visits: HashMap<String, u32>,
    outputs: Map<String, Value>,
    final_state: StateSnapshot,
}

/// Executes a graph for one execution record.
#[derive(Clone)]
pub struct GraphExecutor {
    graph: Arc<Graph>,
    runtime: NodeRuntime,
}

impl GraphExecutor {
    pub fn new(graph: Arc<Graph>, runtime: NodeRuntime) -> Self {
        Self { graph, runtime }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Run the execution to a terminal state. Lifecycle events
    /// (`execution_started`, `execution_completed`, `execution_failed`) are
    /// published here; a cancelled execution publishes no terminal event
    /// beyond its cause.
    pub async fn execute(
        &self,
        execution: &Mutex<Execution>,
        env: &ExecutionEnv,
    ) -> Result<Map<String, Value>> {
        let back_edges = self.graph.back_edges();
        let (execution_id, is_pending, input, resume_node) = {
            let mut exec = execution.lock();
            let is_pending = exec.status() == ExecutionStatus::Pending;
            exec.set_status(ExecutionStatus::Running);
            (
                exec.execution_id.clone(),
                is_pending,
                exec.input.clone(),
                exec.current_node.clone(),
            )
        };
        let scoped = env.state.scoped(&execution_id);

        if is_pending {
            for (key, value) in input.clone() {
                scoped.set(key, value);
            }
            env.bus.publish(
                AgentEvent::new(EventType::ExecutionStarted, "")
                    .with_data("input", Value::Object(input)),
            );
        }

        let mut current = resume_node.unwrap_or_else(|| self.graph.entry_node.clone());

        loop {
            // Pause also gates between nodes, so graphs of function nodes
            // suspend just like event-loop iterations do.
            if env.controls.wait_while_paused().await.is_err()
                || env.controls.cancel.is_cancelled()
            {
                execution.lock().set_status(ExecutionStatus::Cancelled);
                return Err(EngineError::Cancelled);
            }
            execution.lock().current_node = Some(current.clone());

            let Some(spec) = self.graph.node(&current).cloned() else {
                let message = format!("unknown node '{current}'");
                self.fail_execution(execution, env, &message);
                return Err(EngineError::Config(message));
            };

            {
                let mut exec = execution.lock();
                if spec.max_node_visits > 0 && exec.visit_count(&current) >= spec.max_node_visits {
                    drop(exec);
                    self.fail_execution(execution, env, "visit cap exceeded");
                    return Err(EngineError::VisitCap { node: current });
                }
                exec.record_visit(&current);
            }

            let result = self
                .run_node_with_retries(
                    &spec,
                    &scoped,
                    &env.bus,
                    &env.controls,
                    &env.injections,
                    Some(&env.conversations),
                )
                .await;

            if result.status == NodeStatus::Cancelled {
                execution.lock().set_status(ExecutionStatus::Cancelled);
                return Err(EngineError::Cancelled);
            }
            let succeeded = result.succeeded();
            if succeeded {
                execution.lock().outputs.extend(result.outputs.clone());
            } else {
                tracing::warn!(
                    node = %spec.id,
                    status = result.status.as_str(),
                    error = result.error.as_deref().unwrap_or(""),
                    "node did not succeed"
                );
            }

            let selection = match self
                .select_edge(&current, succeeded, &scoped, |node| {
                    execution.lock().visit_count(node)
                })
                .await
            {
                Ok(selection) => selection,
                Err(e) => {
                    self.fail_execution(execution, env, &e.to_string());
                    return Err(e);
                }
            };

            match selection {
                EdgeSelection::Selected(edge) => {
                    // Equal-priority always/on_success siblings fan out in
                    // parallel instead of taking the single edge.
                    if let Some(group) = self.fanout_group(&edge, succeeded) {
                        match self.run_parallel(&group, execution, env, &back_edges).await {
                            Ok(Some(join)) => {
                                current = join;
                                continue;
                            }
                            Ok(None) => {
                                self.complete_execution(execution, env);
                                return Ok(execution.lock().outputs.clone());
                            }
                            Err(EngineError::Cancelled) => {
                                execution.lock().set_status(ExecutionStatus::Cancelled);
                                return Err(EngineError::Cancelled);
                            }
                            Err(e) => {
                                self.fail_execution(execution, env, &e.to_string());
                                return Err(e);
                            }
                        }
                    }

                    self.emit_edge(env, &edge, &back_edges, false);
                    current = edge.target;
                }
                EdgeSelection::NoneMatched => {
                    if succeeded {
                        self.complete_execution(execution, env);
                        return Ok(execution.lock().outputs.clone());
                    }
                    let message = result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("node '{}' failed", spec.id));
                    self.fail_execution(execution, env, &message);
                    return Err(EngineError::Execution(message));
                }
                EdgeSelection::CapBlocked => {
                    self.fail_execution(execution, env, "visit cap exceeded");
                    return Err(EngineError::VisitCap { node: current });
                }
            }
        }
    }

    fn complete_execution(&self, execution: &Mutex<Execution>, env: &ExecutionEnv) {
        let outputs = {
            let mut exec = execution.lock();
            exec.set_status(ExecutionStatus::Completed);
            exec.outputs.clone()
        };
        env.bus.publish(
            AgentEvent::new(EventType::ExecutionCompleted, "")
                .with_data("output", Value::Object(outputs)),
        );
        tracing::info!(execution_id = %execution.lock().execution_id, "execution completed");
    }

    fn fail_execution(&self, execution: &Mutex<Execution>, env: &ExecutionEnv, error: &str) {
        {
            let mut exec = execution.lock();
            exec.error = Some(error.to_string());
            exec.set_status(ExecutionStatus::Failed);
        }
        env.bus
            .publish(AgentEvent::new(EventType::ExecutionFailed, "").with_data("error", error));
        tracing::warn!(execution_id = %execution.lock().execution_id, error, "execution failed");
    }

    fn emit_edge(
        &self,
        env: &ExecutionEnv,
        edge: &EdgeSpec,
        back_edges: &HashSet<(String, String)>,
        parallel: bool,
    ) {
        let mut event = AgentEvent::new(EventType::EdgeTraversed, "")
            .with_data("source", edge.source.clone())
            .with_data("target", edge.target.clone())
            .with_data("edge_condition", edge.condition.as_str());
        if back_edges.contains(&(edge.source.clone(), edge.target.clone())) {
            event = event.with_data("back_edge", true);
        }
        if parallel {
            event = event.with_data("parallel", true);
        }
        env.bus.publish(event);
    }

    /// Run one node, honoring its node-level retry budget: a failed node
    /// re-enters from scratch with a fresh conversation.
    async fn run_node_with_retries(
        &self,
        spec: &NodeSpec,
        scoped: &ScopedState,
        bus: &EventBus,
        controls: &ExecutionControls,
        injections: &InjectionRouter,
        conversations: Option<&ConversationMap>,
    ) -> NodeResult {
        if spec.kind == NodeKind::Function {
            return run_function_node(spec, &self.runtime, scoped, bus).await;
        }

        let mut attempt: u32 = 0;
        loop {
            let conversation = match conversations {
                Some(map) => Arc::clone(
                    map.lock()
                        .entry(spec.id.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(NodeConversation::new()))),
                ),
                None => Arc::new(Mutex::new(NodeConversation::new())),
            };

            let node = EventLoopNode::new(spec.clone());
            let result = node
                .run(&self.runtime, &conversation, scoped, bus, controls, injections)
                .await;

            match result.status {
                // Keep the conversation around: a cancelled (or paused then
                // stopped) node may be checkpointed.
                NodeStatus::Cancelled => return result,
                NodeStatus::Failed if attempt < spec.max_retries => {
                    attempt += 1;
                    if let Some(map) = conversations {
                        map.lock().remove(&spec.id);
                    }
                    tracing::info!(
                        node = %spec.id,
                        attempt,
                        max_retries = spec.max_retries,
                        "re-entering failed node with a fresh conversation"
                    );
                }
                _ => {
                    if let Some(map) = conversations {
                        map.lock().remove(&spec.id);
                    }
                    return result;
                }
            }
        }
    }

    async fn select_edge(
        &self,
        current: &str,
        succeeded: bool,
        scoped: &ScopedState,
        visit_count: impl Fn(&str) -> u32,
    ) -> Result<EdgeSelection> {
        let mut router_choice: Option<Option<String>> = None;
        let mut cap_blocked = false;

        for edge in self.graph.outgoing_edges(current) {
            let matched = match &edge.condition {
                EdgeCondition::Always => true,
                EdgeCondition::OnSuccess => succeeded,
                EdgeCondition::OnFailure => !succeeded,
                EdgeCondition::Conditional { condition } => {
                    let ctx = ConditionContext {
                        state: scoped,
                        text: "",
                    };
                    condition.evaluate(&ctx)?
                }
                EdgeCondition::Router => {
                    if router_choice.is_none() {
                        router_choice = Some(self.route_with_llm(current).await);
                    }
                    router_choice.as_ref().and_then(|c| c.as_deref())
                        == Some(edge.target.as_str())
                }
            };
            if !matched {
                continue;
            }

            if let Some(target) = self.graph.node(&edge.target) {
                if target.max_node_visits > 0 && visit_count(&edge.target) >= target.max_node_visits
                {
                    tracing::debug!(
                        source = %edge.source,
                        target = %edge.target,
                        "edge target at visit cap, trying next edge"
                    );
                    cap_blocked = true;
                    continue;
                }
            }
            return Ok(EdgeSelection::Selected(edge.clone()));
        }

        Ok(if cap_blocked {
            EdgeSelection::CapBlocked
        } else {
            EdgeSelection::NoneMatched
        })
    }

    /// Ask the LLM to pick among the router-edge targets of `current`.
    async fn route_with_llm(&self, current: &str) -> Option<String> {
        let targets: Vec<String> = self
            .graph
            .outgoing_edges(current)
            .into_iter()
            .filter(|e| matches!(e.condition, EdgeCondition::Router))
            .map(|e| e.target.clone())
            .collect();
        if targets.is_empty() {
            return None;
        }

        let mut listing = String::new();
        for target in &targets {
            let description = self
                .graph
                .node(target)
                .and_then(|n| n.system_prompt.clone())
                .unwrap_or_default();
            listing.push_str(&format!("- {target}: {description}\n"));
        }
        let request = CompletionRequest::new(vec![
            ChatMessage::system(
                "You are a router inside an agent graph. Pick the single next node. \
                 Reply with exactly one node id and nothing else.",
            ),
            ChatMessage::user(format!("Candidate nodes:\n{listing}")),
        ]);

        let reply = match self.runtime.model.complete(request).await {
            Ok(turn) => turn.text,
            Err(e) => {
                tracing::warn!(node = current, error = %e, "router LLM call failed");
                return None;
            }
        };
        targets.into_iter().find(|t| reply.contains(t.as_str()))
    }

    /// The equal-priority `always`/`on_success` sibling group of a selected
    /// edge, when it forms a parallel fan-out.
    fn fanout_group(&self, selected: &EdgeSpec, succeeded: bool) -> Option<Vec<EdgeSpec>> {
        if !succeeded
            || !matches!(
                selected.condition,
                EdgeCondition::Always | EdgeCondition::OnSuccess
            )
        {
            return None;
        }
        let group: Vec<EdgeSpec> = self
            .graph
            .outgoing_edges(&selected.source)
            .into_iter()
            .filter(|e| {
                e.priority == selected.priority
                    && matches!(e.condition, EdgeCondition::Always | EdgeCondition::OnSuccess)
            })
            .cloned()
            .collect();
        (group.len() >= 2).then_some(group)
    }

    /// Run the branches of a fan-out group concurrently, join at the
    /// nearest common descendant, merge staged writes. Returns the join
    /// node, or `None` when the branches have no common descendant (the
    /// execution then completes).
    async fn run_parallel(
        &self,
        group: &[EdgeSpec],
        execution: &Mutex<Execution>,
        env: &ExecutionEnv,
        back_edges: &HashSet<(String, String)>,
    ) -> Result<Option<String>> {
        let targets: Vec<&str> = group.iter().map(|e| e.target.as_str()).collect();
        let join_node = self.graph.nearest_common_descendant(&targets);
        let base_snapshot = env.state.snapshot();
        let (execution_id, base_visits) = {
            let exec = execution.lock();
            (exec.execution_id.clone(), exec.visit_counts().clone())
        };

        tracing::info!(
            source = %group[0].source,
            branches = group.len(),
            join = join_node.as_deref().unwrap_or("(none)"),
            "parallel fan-out"
        );
        for edge in group {
            self.emit_edge(env, edge, back_edges, true);
        }

        let mut handles = Vec::new();
        for edge in group {
            let executor = self.clone();
            let branch_state = SharedState::new(env.state.policy());
            branch_state.restore(base_snapshot.clone());
            let bus = env.bus.clone();
            let controls = env.controls.clone();
            let injections = env.injections.clone();
            let branch_execution_id = execution_id.clone();
            let stop = join_node.clone();
            let start = edge.target.clone();
            let visits = base_visits.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .walk_branch(
                        start,
                        stop,
                        branch_state,
                        bus,
                        controls,
                        injections,
                        branch_execution_id,
                        visits,
                    )
                    .await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    return Err(EngineError::Execution(format!("branch task failed: {e}")))
                }
            }
        }

        if outcomes.iter().any(|o| o.cancelled) {
            return Err(EngineError::Cancelled);
        }
        if let Some(failed) = outcomes.iter().find(|o| !o.succeeded) {
            return Err(EngineError::Execution(
                failed
                    .error
                    .clone()
                    .unwrap_or_else(|| "parallel branch failed".to_string()),
            ));
        }

        // Merge staged writes. Key overlap is a conflict unless the session
        // is SYNCHRONIZED, where later branches win in declaration order.
        let policy = env.state.policy();
        let mut merged: BTreeMap<String, Value> = BTreeMap::new();
        let mut written: HashSet<String> = HashSet::new();
        for outcome in &outcomes {
            for (key, value) in staged_writes(&base_snapshot, &outcome.final_state) {
                if written.contains(&key) && policy != IsolationPolicy::Synchronized {
                    env.bus.publish(
                        AgentEvent::new(EventType::StateConflict, "")
                            .with_data("key", key.clone()),
                    );
                    return Err(EngineError::StateConflict { key });
                }
                written.insert(key.clone());
                merged.insert(key, value);
            }
            let mut exec = execution.lock();
            exec.add_visits(&outcome.visits);
            exec.outputs.extend(outcome.outputs.clone());
        }

        let scoped = env.state.scoped(&execution_id);
        for (key, value) in merged {
            if policy == IsolationPolicy::Synchronized {
                let _guard = env.state.lock_key(&key).await;
                scoped.set(key, value);
            } else {
                scoped.set(key, value);
            }
        }

        Ok(join_node)
    }

    /// Sequentially walk one branch of a fan-out until the join node (not
    /// executed here), a dead end, or a failure. Branch state is private;
    /// writes are staged for the merge at join. Nested fan-out groups are
    /// walked sequentially along their first matching edge.
    #[allow(clippy::too_many_arguments)]
    async fn walk_branch(
        &self,
        start: String,
        stop: Option<String>,
        state: SharedState,
        bus: EventBus,
        controls: ExecutionControls,
        injections: InjectionRouter,
        execution_id: String,
        base_visits: HashMap<String, u32>,
    ) -> BranchOutcome {
        let scoped = state.scoped(&execution_id);
        let mut visits: HashMap<String, u32> = HashMap::new();
        let mut outputs = Map::new();
        let mut current = start;

        macro_rules! outcome {
            ($succeeded:expr, $cancelled:expr, $error:expr) => {
                BranchOutcome {
                    succeeded: $succeeded,
                    cancelled: $cancelled,
                    error: $error,
                    visits,
                    outputs,
                    final_state: state.snapshot(),
                }
            };
        }

        loop {
            if stop.as_deref() == Some(current.as_str()) {
                return outcome!(true, false, None);
            }
            if controls.wait_while_paused().await.is_err() || controls.cancel.is_cancelled() {
                return outcome!(false, true, None);
            }

            let Some(spec) = self.graph.node(&current).cloned() else {
                return outcome!(false, false, Some(format!("unknown node '{current}'")));
            };
            let seen = base_visits.get(&current).copied().unwrap_or(0)
                + visits.get(&current).copied().unwrap_or(0);
            if spec.max_node_visits > 0 && seen >= spec.max_node_visits {
                return outcome!(false, false, Some("visit cap exceeded".to_string()));
            }
            *visits.entry(current.clone()).or_insert(0) += 1;

            let result = self
                .run_node_with_retries(&spec, &scoped, &bus, &controls, &injections, None)
                .await;
            if result.status == NodeStatus::Cancelled {
                return outcome!(false, true, None);
            }
            let succeeded = result.succeeded();
            if succeeded {
                outputs.extend(result.outputs.clone());
            }

            let selection = match self
                .select_edge(&current, succeeded, &scoped, |node| {
                    base_visits.get(node).copied().unwrap_or(0)
                        + visits.get(node).copied().unwrap_or(0)
                })
                .await
            {
                Ok(selection) => selection,
                Err(e) => return outcome!(false, false, Some(e.to_string())),
            };
            match selection {
                EdgeSelection::Selected(edge) => {
                    bus.publish(
                        AgentEvent::new(EventType::EdgeTraversed, "")
                            .with_data("source", edge.source.clone())
                            .with_data("target", edge.target.clone())
                            .with_data("edge_condition", edge.condition.as_str())
                            .with_data("parallel", true),
                    );
                    current = edge.target;
                }
                EdgeSelection::NoneMatched => {
                    let error = result.error;
                    return outcome!(succeeded, false, error);
                }
                EdgeSelection::CapBlocked => {
                    return outcome!(false, false, Some("visit cap exceeded".to_string()));
                }
            }
        }
    }
}

/// Keys whose value differs between the fan-out base snapshot and a
/// branch's final state.
fn staged_writes(base: &StateSnapshot, final_state: &StateSnapshot) -> Vec<(String, Value)> {
    final_state
        .iter()
        .filter(|(key, value)| base.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
