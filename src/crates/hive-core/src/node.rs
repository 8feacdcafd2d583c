//! The per-node event loop: bounded LLM + tool iteration with judge gating.
//!
//! [`EventLoopNode::run`] drives one node invocation. Each iteration:
//!
//! 1. waits out a pause, honors cancellation, and checks the iteration
//!    budget;
//! 2. assembles the prompt: system prompt + declared input values from
//!    shared state + prior turns;
//! 3. streams one LLM turn, publishing `client_output_delta` (client-facing
//!    nodes) or `llm_text_delta` per delta, retrying transient failures
//!    with exponential backoff (`node_retry`);
//! 4. dispatches tool calls (`tool_call_started` / `tool_call_completed`),
//!    short-circuiting the synthetic `set_output` and `escalate_to_coder`
//!    tools into the runtime;
//! 5. for a text-only turn on a client-facing node, blocks on
//!    `client_input_requested` until input is injected;
//! 6. otherwise consults the judge (`judge_verdict`): ACCEPT verifies that
//!    every non-nullable output key was set, RETRY feeds the feedback back
//!    as a turn, ESCALATE exits the node as escalated, CONTINUE iterates.
//!
//! Two pathologies terminate the node as failed: a *stall* (assistant text
//! byte-identical to its previous two turns, `node_stalled`) and a *tool
//! doom loop* (argument-equal calls of one tool across three consecutive
//! iterations with non-error results; a corrective turn is injected once,
//! `node_tool_doom_loop`, and a recurrence fails the node).
//!
//! All blocking points (LLM stream, tool call, input await, pause) honor
//! the execution's cancellation token and return a `cancelled` result.

use crate::bus::EventBus;
use crate::conversation::NodeConversation;
use crate::error::{EngineError, Result};
use crate::event::{AgentEvent, EventType};
use crate::graph::{NodeSpec, OutputKeySpec};
use crate::judge::{JudgeContext, JudgeProtocol, Verdict};
use crate::llm::{
    ChatMessage, CompletionChunk, CompletionModel, CompletionRequest, CompletionTurn,
    ToolCallRequest,
};
use crate::retry::BackoffPolicy;
use crate::state::ScopedState;
use crate::tool::{self, ToolOutcome, ToolRegistry};
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Default timeout for one LLM streaming turn.
pub const DEFAULT_LLM_TURN_TIMEOUT: Duration = Duration::from_secs(120);

/// Consecutive argument-equal tool calls before the doom-loop correction.
const DOOM_LOOP_THRESHOLD: u32 = 3;
/// Identical assistant turns (including the current one) that count as a stall.
const STALL_WINDOW: usize = 3;

/// Terminal status of one node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Success,
    Failed,
    Escalated,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Escalated => "escalated",
            NodeStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of one node invocation.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub outputs: Map<String, Value>,
    pub status: NodeStatus,
    pub iterations: u32,
    pub error: Option<String>,
}

impl NodeResult {
    fn new(status: NodeStatus, outputs: Map<String, Value>, iterations: u32) -> Self {
        Self {
            outputs,
            status,
            iterations,
            error: None,
        }
    }

    fn failed(message: impl Into<String>, outputs: Map<String, Value>, iterations: u32) -> Self {
        Self {
            outputs,
            status: NodeStatus::Failed,
            iterations,
            error: Some(message.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

/// Cancellation and pause signals shared by every blocking point of an
/// execution.
#[derive(Clone)]
pub struct ExecutionControls {
    pub cancel: CancellationToken,
    pub pause: watch::Receiver<bool>,
}

impl ExecutionControls {
    /// Controls that never pause nor cancel (tests, the queen loop).
    pub fn unrestricted() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause: rx,
        }
    }

    /// Wait while paused; error on cancellation.
    pub async fn wait_while_paused(&self) -> Result<()> {
        let mut pause = self.pause.clone();
        loop {
            if !*pause.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                changed = pause.changed() => {
                    if changed.is_err() {
                        // Pause controller gone; treat as resumed.
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Routes injected client input to nodes blocked on
/// `client_input_requested`.
#[derive(Clone, Default)]
pub struct InjectionRouter {
    waiting: Arc<Mutex<HashMap<String, mpsc::Sender<String>>>>,
}

impl InjectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node as blocked; the node awaits the returned receiver.
    pub fn register(&self, node_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(1);
        self.waiting.lock().insert(node_id.to_string(), tx);
        rx
    }

    /// Remove a node's mailbox.
    pub fn unregister(&self, node_id: &str) {
        self.waiting.lock().remove(node_id);
    }

    /// Deliver input to a blocked node. Returns `false` when no node of
    /// that id is waiting.
    pub fn deliver(&self, node_id: &str, content: impl Into<String>) -> bool {
        let sender = self.waiting.lock().get(node_id).cloned();
        match sender {
            Some(sender) => sender.try_send(content.into()).is_ok(),
            None => false,
        }
    }

    /// Ids of currently blocked nodes.
    pub fn blocked_nodes(&self) -> Vec<String> {
        self.waiting.lock().keys().cloned().collect()
    }

    /// True when any node is blocked on input.
    pub fn any_blocked(&self) -> bool {
        !self.waiting.lock().is_empty()
    }
}

/// Async function body of a `function` node: inputs map to outputs map.
pub type NodeFunction = Arc<
    dyn Fn(Map<String, Value>) -> BoxFuture<'static, std::result::Result<Map<String, Value>, String>>
        + Send
        + Sync,
>;

/// Registered function-node handlers, keyed by node id.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, NodeFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, node_id: impl Into<String>, function: F)
    where
        F: Fn(Map<String, Value>) -> BoxFuture<'static, std::result::Result<Map<String, Value>, String>>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(node_id.into(), Arc::new(function));
    }

    pub fn get(&self, node_id: &str) -> Option<NodeFunction> {
        self.functions.get(node_id).cloned()
    }
}

/// Shared dependencies for running nodes.
#[derive(Clone)]
pub struct NodeRuntime {
    pub model: Arc<dyn CompletionModel>,
    /// Provider-specific model name override, forwarded on every request.
    pub model_name: Option<String>,
    pub tools: ToolRegistry,
    pub judge: JudgeProtocol,
    pub functions: FunctionRegistry,
    pub backoff: BackoffPolicy,
    pub llm_turn_timeout: Duration,
}

impl NodeRuntime {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self {
            model,
            model_name: None,
            tools: ToolRegistry::new(),
            judge: JudgeProtocol::new(),
            functions: FunctionRegistry::new(),
            backoff: BackoffPolicy::default(),
            llm_turn_timeout: DEFAULT_LLM_TURN_TIMEOUT,
        }
    }

    pub fn with_model_name(mut self, model_name: Option<String>) -> Self {
        self.model_name = model_name;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_judge(mut self, judge: JudgeProtocol) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Tracks argument-equal tool calls across iterations.
struct DoomLoopDetector {
    last_signature: Option<String>,
    consecutive: u32,
    corrected: bool,
}

impl DoomLoopDetector {
    fn new() -> Self {
        Self {
            last_signature: None,
            consecutive: 0,
            corrected: false,
        }
    }

    /// Feed one iteration's non-synthetic calls. Returns the repeat count
    /// when all calls share one signature repeated from last iteration.
    fn observe(&mut self, calls: &[(String, Value, bool)]) -> u32 {
        // Only non-error repeats count.
        let signature = match calls {
            [(name, input, false)] => Some(format!("{name}:{input}")),
            _ => None,
        };
        match (signature, &self.last_signature) {
            (Some(sig), Some(last)) if &sig == last => {
                self.consecutive += 1;
            }
            (Some(sig), _) => {
                self.last_signature = Some(sig);
                self.consecutive = 1;
            }
            (None, _) => {
                self.last_signature = None;
                self.consecutive = 0;
            }
        }
        self.consecutive
    }

    fn reset_after_correction(&mut self) {
        self.corrected = true;
        self.consecutive = 0;
        self.last_signature = None;
    }
}

/// Executes one node invocation.
pub struct EventLoopNode {
    spec: NodeSpec,
}

impl EventLoopNode {
    pub fn new(spec: NodeSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    fn emit(&self, bus: &EventBus, event: AgentEvent) {
        bus.publish(event.with_node(&self.spec.id));
    }

    /// Run the node loop to completion.
    ///
    /// The conversation lives behind a mutex so the owning execution can
    /// snapshot it for checkpoints while the node is paused; the lock is
    /// only ever held for synchronous appends and reads, never across an
    /// await.
    pub async fn run(
        &self,
        runtime: &NodeRuntime,
        conversation: &Mutex<NodeConversation>,
        state: &ScopedState,
        bus: &EventBus,
        controls: &ExecutionControls,
        injections: &InjectionRouter,
    ) -> NodeResult {
        let mut outputs = Map::new();
        let mut doom = DoomLoopDetector::new();
        let max_iterations = self.spec.max_iterations;
        let mut iteration: u32 = 0;

        loop {
            iteration += 1;

            if controls.wait_while_paused().await.is_err() || controls.cancel.is_cancelled() {
                return NodeResult::new(NodeStatus::Cancelled, outputs, iteration - 1);
            }

            if max_iterations > 0 && iteration > max_iterations {
                let result =
                    NodeResult::failed("iteration budget exhausted", outputs, iteration - 1);
                self.emit_completed(bus, &result);
                return result;
            }

            if iteration == 1 {
                self.emit(
                    bus,
                    AgentEvent::new(EventType::NodeLoopStarted, "")
                        .with_data("max_iterations", max_iterations),
                );
            }
            self.emit(
                bus,
                AgentEvent::new(EventType::NodeLoopIteration, "").with_data("iteration", iteration),
            );

            let request = self.build_request(runtime, conversation, state);
            let turn = match self
                .stream_with_retry(runtime, request, bus, controls, iteration)
                .await
            {
                Ok(turn) => turn,
                Err(EngineError::Cancelled) => {
                    return NodeResult::new(NodeStatus::Cancelled, outputs, iteration);
                }
                Err(e) => {
                    let result = NodeResult::failed(e.to_string(), outputs, iteration);
                    self.emit_completed(bus, &result);
                    return result;
                }
            };

            // Stall: the new text matches the previous two assistant turns
            // byte for byte and no tool work was requested.
            if turn.is_text_only() && !turn.text.is_empty() {
                let stalled = {
                    let conversation = conversation.lock();
                    let previous = conversation.last_assistant_contents(STALL_WINDOW - 1);
                    previous.len() == STALL_WINDOW - 1
                        && previous.iter().all(|text| *text == turn.text)
                };
                if stalled {
                    self.emit(
                        bus,
                        AgentEvent::new(EventType::NodeStalled, "").with_data(
                            "reason",
                            format!(
                                "assistant output identical across {STALL_WINDOW} turns"
                            ),
                        ),
                    );
                    let result = NodeResult::failed("node stalled", outputs, iteration);
                    self.emit_completed(bus, &result);
                    return result;
                }
            }

            conversation.lock().push_assistant(&turn.text, &turn.tool_calls);

            let mut made_non_synthetic = false;
            let mut observed_calls: Vec<(String, Value, bool)> = Vec::new();

            for call in &turn.tool_calls {
                if call.name == tool::SET_OUTPUT {
                    let outcome = self.handle_set_output(call, &mut outputs, state, bus);
                    conversation.lock().push_tool_result(
                        &call.id,
                        outcome.to_content_string(),
                        outcome.is_error,
                    );
                } else if call.name == tool::ESCALATE_TO_CODER {
                    let reason = call
                        .input
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified");
                    let context = call.input.get("context").and_then(Value::as_str);
                    self.emit(
                        bus,
                        AgentEvent::new(EventType::EscalationRequested, "")
                            .with_data("reason", reason)
                            .with_data("context", context.unwrap_or_default()),
                    );
                    conversation.lock().push_tool_result(&call.id, "escalation recorded", false);
                    let mut result =
                        NodeResult::new(NodeStatus::Escalated, outputs, iteration);
                    result.error = Some(reason.to_string());
                    self.emit_completed(bus, &result);
                    return result;
                } else {
                    made_non_synthetic = true;
                    self.emit(
                        bus,
                        AgentEvent::new(EventType::ToolCallStarted, "")
                            .with_data("tool_use_id", call.id.clone())
                            .with_data("tool_name", call.name.clone())
                            .with_data("tool_input", call.input.clone()),
                    );
                    let outcome = tokio::select! {
                        _ = controls.cancel.cancelled() => {
                            return NodeResult::new(NodeStatus::Cancelled, outputs, iteration);
                        }
                        outcome = self.dispatch_tool(runtime, call) => outcome,
                    };
                    self.emit(
                        bus,
                        AgentEvent::new(EventType::ToolCallCompleted, "")
                            .with_data("tool_use_id", call.id.clone())
                            .with_data("tool_name", call.name.clone())
                            .with_data("result", outcome.content.clone())
                            .with_data("is_error", outcome.is_error),
                    );
                    observed_calls.push((call.name.clone(), call.input.clone(), outcome.is_error));
                    conversation.lock().push_tool_result(
                        &call.id,
                        outcome.to_content_string(),
                        outcome.is_error,
                    );
                }
            }

            // Doom loop: the same tool with argument-equal input across
            // consecutive iterations, with non-error results.
            if made_non_synthetic {
                let repeats = doom.observe(&observed_calls);
                let threshold = if doom.corrected { 1 } else { DOOM_LOOP_THRESHOLD };
                if repeats >= threshold {
                    let description = format!(
                        "tool '{}' called with identical input {} consecutive times",
                        observed_calls
                            .first()
                            .map(|(name, _, _)| name.as_str())
                            .unwrap_or("?"),
                        repeats
                    );
                    self.emit(
                        bus,
                        AgentEvent::new(EventType::NodeToolDoomLoop, "")
                            .with_data("description", description.clone()),
                    );
                    if doom.corrected {
                        let result = NodeResult::failed(description, outputs, iteration);
                        self.emit_completed(bus, &result);
                        return result;
                    }
                    conversation.lock().push_assistant(
                        "I have been repeating the same tool call without new information. \
                         I will change my approach instead of calling it again.",
                        &[],
                    );
                    doom.reset_after_correction();
                }
            }

            // Text-only turn on a client-facing node: block for input.
            if turn.is_text_only() && self.spec.client_facing {
                match self
                    .await_client_input(&turn.text, bus, controls, injections)
                    .await
                {
                    Ok(input) => {
                        conversation.lock().push_user(input);
                        continue;
                    }
                    Err(_) => {
                        return NodeResult::new(NodeStatus::Cancelled, outputs, iteration);
                    }
                }
            }

            // Judge the iteration. The judge sees a clone so no lock is
            // held across its (possibly LLM-backed) evaluation.
            let judged_conversation = conversation.lock().clone();
            let judge_ctx = JudgeContext {
                conversation: &judged_conversation,
                state,
                success_criteria: self.spec.success_criteria.as_deref(),
                iteration,
                made_tool_calls: made_non_synthetic,
            };
            let outcome = match runtime.judge.evaluate(&judge_ctx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let result = NodeResult::failed(
                        format!("judge evaluation failed: {e}"),
                        outputs,
                        iteration,
                    );
                    self.emit_completed(bus, &result);
                    return result;
                }
            };

            let (verdict, feedback) = match outcome.verdict {
                Verdict::Accept => {
                    let missing = self.missing_output_keys(&outputs);
                    if missing.is_empty() {
                        (Verdict::Accept, outcome.feedback)
                    } else {
                        (
                            Verdict::Retry,
                            Some(format!("missing keys: {}", missing.join(", "))),
                        )
                    }
                }
                other => (other, outcome.feedback),
            };

            let mut verdict_event = AgentEvent::new(EventType::JudgeVerdict, "")
                .with_data("action", verdict.as_str())
                .with_data("judge_type", outcome.judge_type.as_str())
                .with_data("iteration", iteration);
            if let Some(feedback) = &feedback {
                verdict_event = verdict_event.with_data("feedback", feedback.clone());
            }
            if let Some(confidence) = outcome.confidence {
                verdict_event = verdict_event.with_data("confidence", confidence);
            }
            self.emit(bus, verdict_event);

            match verdict {
                Verdict::Accept => {
                    if !self.spec.client_facing && !turn.text.is_empty() {
                        self.emit(
                            bus,
                            AgentEvent::new(EventType::NodeInternalOutput, "")
                                .with_data("content", turn.text.clone()),
                        );
                    }
                    let result = NodeResult::new(NodeStatus::Success, outputs, iteration);
                    self.emit_completed(bus, &result);
                    return result;
                }
                Verdict::Retry => {
                    if let Some(feedback) = feedback {
                        conversation
                            .lock()
                            .push_user(format!("Reviewer feedback: {feedback}"));
                    }
                }
                Verdict::Escalate => {
                    self.emit(
                        bus,
                        AgentEvent::new(EventType::EscalationRequested, "").with_data(
                            "reason",
                            feedback.clone().unwrap_or_else(|| "judge escalation".to_string()),
                        ),
                    );
                    let mut result = NodeResult::new(NodeStatus::Escalated, outputs, iteration);
                    result.error = feedback;
                    self.emit_completed(bus, &result);
                    return result;
                }
                Verdict::Continue => {}
            }
        }
    }

    fn build_request(
        &self,
        runtime: &NodeRuntime,
        conversation: &Mutex<NodeConversation>,
        state: &ScopedState,
    ) -> CompletionRequest {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.spec.system_prompt {
            messages.push(ChatMessage::system(prompt));
        }
        if !self.spec.input_keys.is_empty() {
            let mut inputs = String::from("Inputs:\n");
            for key in &self.spec.input_keys {
                let value = state
                    .get(key)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "(unset)".to_string());
                inputs.push_str(&format!("{key}: {value}\n"));
            }
            messages.push(ChatMessage::user(inputs));
        }
        messages.extend(conversation.lock().to_chat_messages());
        if !messages
            .iter()
            .any(|m| m.role == crate::llm::ChatRole::User)
        {
            messages.push(ChatMessage::user("Begin."));
        }

        let mut request = CompletionRequest::new(messages)
            .with_tools(runtime.tools.definitions_for(&self.spec.tools));
        if let Some(model_name) = &runtime.model_name {
            request = request.with_model(model_name);
        }
        request
    }

    /// Stream one LLM turn, publishing delta events, retrying transient
    /// failures within the backoff budget.
    async fn stream_with_retry(
        &self,
        runtime: &NodeRuntime,
        request: CompletionRequest,
        bus: &EventBus,
        controls: &ExecutionControls,
        iteration: u32,
    ) -> Result<CompletionTurn> {
        let mut retry_count: u32 = 0;
        loop {
            match self
                .stream_once(runtime, request.clone(), bus, controls, iteration)
                .await
            {
                Ok(turn) => return Ok(turn),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) if e.is_retryable() => {
                    retry_count += 1;
                    if !runtime.backoff.allows(retry_count) {
                        return Err(e);
                    }
                    self.emit(
                        bus,
                        AgentEvent::new(EventType::NodeRetry, "")
                            .with_data("retry_count", retry_count)
                            .with_data("max_retries", runtime.backoff.max_retries)
                            .with_data("error", e.to_string()),
                    );
                    let delay = runtime.backoff.delay_for(retry_count);
                    tracing::warn!(
                        node = %self.spec.id,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient LLM error, backing off"
                    );
                    tokio::select! {
                        _ = controls.cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_once(
        &self,
        runtime: &NodeRuntime,
        request: CompletionRequest,
        bus: &EventBus,
        controls: &ExecutionControls,
        iteration: u32,
    ) -> Result<CompletionTurn> {
        let delta_type = if self.spec.client_facing {
            EventType::ClientOutputDelta
        } else {
            EventType::LlmTextDelta
        };

        let consume = async {
            let mut stream = runtime.model.stream(request).await?;
            let mut accumulated = String::new();
            loop {
                let chunk = tokio::select! {
                    _ = controls.cancel.cancelled() => return Err(EngineError::Cancelled),
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(CompletionChunk::TextDelta(delta))) => {
                        accumulated.push_str(&delta);
                        self.emit(
                            bus,
                            AgentEvent::new(delta_type, "")
                                .with_data("content", delta)
                                .with_data("snapshot", accumulated.clone())
                                .with_data("iteration", iteration),
                        );
                    }
                    Some(Ok(CompletionChunk::ReasoningDelta(delta))) => {
                        self.emit(
                            bus,
                            AgentEvent::new(EventType::LlmReasoningDelta, "")
                                .with_data("content", delta)
                                .with_data("iteration", iteration),
                        );
                    }
                    Some(Ok(CompletionChunk::Completed(turn))) => return Ok(turn),
                    Some(Err(e)) => return Err(e),
                    None => {
                        // Provider closed without a Completed chunk.
                        return Ok(CompletionTurn {
                            text: accumulated,
                            ..CompletionTurn::default()
                        });
                    }
                }
            }
        };

        match tokio::time::timeout(runtime.llm_turn_timeout, consume).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::transient_llm(format!(
                "LLM streaming turn exceeded {:?}",
                runtime.llm_turn_timeout
            ))),
        }
    }

    fn handle_set_output(
        &self,
        call: &ToolCallRequest,
        outputs: &mut Map<String, Value>,
        state: &ScopedState,
        bus: &EventBus,
    ) -> ToolOutcome {
        let Some(key) = call.input.get("key").and_then(Value::as_str) else {
            return ToolOutcome::error("set_output requires a 'key' string");
        };
        if !self.spec.output_keys.iter().any(|spec| spec.key == key) {
            return ToolOutcome::error(format!(
                "'{key}' is not a declared output key of node '{}'",
                self.spec.id
            ));
        }
        let value = call.input.get("value").cloned().unwrap_or(Value::Null);
        outputs.insert(key.to_string(), value.clone());
        state.set(key, value.clone());
        self.emit(
            bus,
            AgentEvent::new(EventType::OutputKeySet, "")
                .with_data("key", key)
                .with_data("value", value),
        );
        ToolOutcome::ok(json!({"ok": true, "key": key}))
    }

    async fn dispatch_tool(&self, runtime: &NodeRuntime, call: &ToolCallRequest) -> ToolOutcome {
        if !self.spec.tools.iter().any(|name| name == &call.name) {
            return ToolOutcome::error(format!(
                "tool '{}' is not permitted for node '{}'",
                call.name, self.spec.id
            ));
        }
        match runtime.tools.get(&call.name) {
            Some(tool) => tool.execute(call.input.clone()).await,
            None => ToolOutcome::error(format!("tool '{}' is not registered", call.name)),
        }
    }

    async fn await_client_input(
        &self,
        prompt: &str,
        bus: &EventBus,
        controls: &ExecutionControls,
        injections: &InjectionRouter,
    ) -> Result<String> {
        let mut receiver = injections.register(&self.spec.id);
        self.emit(
            bus,
            AgentEvent::new(EventType::NodeInputBlocked, "").with_data("prompt", prompt),
        );
        self.emit(
            bus,
            AgentEvent::new(EventType::ClientInputRequested, "").with_data("prompt", prompt),
        );

        let input = tokio::select! {
            _ = controls.cancel.cancelled() => {
                injections.unregister(&self.spec.id);
                return Err(EngineError::Cancelled);
            }
            input = receiver.recv() => input,
        };
        injections.unregister(&self.spec.id);
        input.ok_or(EngineError::Cancelled)
    }

    fn missing_output_keys(&self, outputs: &Map<String, Value>) -> Vec<String> {
        self.spec
            .output_keys
            .iter()
            .filter(|OutputKeySpec { key, nullable }| !nullable && !outputs.contains_key(key))
            .map(|spec| spec.key.clone())
            .collect()
    }

    fn emit_completed(&self, bus: &EventBus, result: &NodeResult) {
        let mut event = AgentEvent::new(EventType::NodeLoopCompleted, "")
            .with_data("iterations", result.iterations)
            .with_data("status", result.status.as_str());
        if let Some(error) = &result.error {
            event = event.with_data("error", error.clone());
        }
        self.emit(bus, event);
    }
}

/// Run a `function` node. Synchronous from the graph's point of view, but
/// still publishes `node_loop_started` / `node_loop_completed` with
/// `iterations = 1`.
pub async fn run_function_node(
    spec: &NodeSpec,
    runtime: &NodeRuntime,
    state: &ScopedState,
    bus: &EventBus,
) -> NodeResult {
    bus.publish(
        AgentEvent::new(EventType::NodeLoopStarted, "")
            .with_node(&spec.id)
            .with_data("max_iterations", 1),
    );

    let Some(function) = runtime.functions.get(&spec.id) else {
        let result = NodeResult::failed(
            format!("no function registered for node '{}'", spec.id),
            Map::new(),
            1,
        );
        emit_function_completed(spec, bus, &result);
        return result;
    };

    let mut inputs = Map::new();
    for key in &spec.input_keys {
        if let Some(value) = state.get(key) {
            inputs.insert(key.clone(), value);
        }
    }

    let result = match function(inputs).await {
        Ok(outputs) => {
            for (key, value) in &outputs {
                state.set(key, value.clone());
                bus.publish(
                    AgentEvent::new(EventType::OutputKeySet, "")
                        .with_node(&spec.id)
                        .with_data("key", key.clone())
                        .with_data("value", value.clone()),
                );
            }
            NodeResult::new(NodeStatus::Success, outputs, 1)
        }
        Err(message) => NodeResult::failed(message, Map::new(), 1),
    };
    emit_function_completed(spec, bus, &result);
    result
}

fn emit_function_completed(spec: &NodeSpec, bus: &EventBus, result: &NodeResult) {
    bus.publish(
        AgentEvent::new(EventType::NodeLoopCompleted, "")
            .with_node(&spec.id)
            .with_data("iterations", 1)
            .with_data("status", result.status.as_str()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use crate::graph::{Condition, NodeSpec, OutputKeySpec};
    use crate::judge::{EvaluationRule, RuleAction};
    use crate::llm::testing::{ScriptedModel, ScriptedTurn};
    use crate::state::{IsolationPolicy, SharedState};
    use crate::tool::Tool;

    fn runtime_with(model: ScriptedModel) -> NodeRuntime {
        let mut tools = ToolRegistry::new();
        tools.register(Tool::new("echo", "Echo input", |input| {
            Box::pin(async move { Ok(json!({"echo": input})) })
        }));
        tools.register(Tool::new("flaky", "Fails twice then succeeds", {
            let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
            move |_input| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n < 2 {
                        Err(format!("transient failure {n}"))
                    } else {
                        Ok(json!({"attempt": n}))
                    }
                })
            }
        }));
        NodeRuntime::new(Arc::new(model))
            .with_tools(tools)
            .with_backoff(BackoffPolicy::new(3).with_initial_interval(0.001).with_jitter(false))
    }

    async fn run_node(
        spec: NodeSpec,
        runtime: &NodeRuntime,
    ) -> (NodeResult, Vec<AgentEvent>, SharedState) {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::new());
        let state = SharedState::new(IsolationPolicy::Shared);
        let scoped = state.scoped("exec-1");
        let conversation = Mutex::new(NodeConversation::new());
        let controls = ExecutionControls::unrestricted();
        let injections = InjectionRouter::new();

        let node = EventLoopNode::new(spec);
        let result = node
            .run(runtime, &conversation, &scoped, &bus, &controls, &injections)
            .await;

        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        (result, events, state)
    }

    fn event_types(events: &[AgentEvent]) -> Vec<EventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn test_text_only_accept_completes() {
        let runtime = runtime_with(ScriptedModel::new(vec![ScriptedTurn::text("done")]));
        let (result, events, _) = run_node(NodeSpec::event_loop("n"), &runtime).await;

        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.iterations, 1);
        let types = event_types(&events);
        assert_eq!(types[0], EventType::NodeLoopStarted);
        assert_eq!(types[1], EventType::NodeLoopIteration);
        assert!(types.contains(&EventType::LlmTextDelta));
        assert!(types.contains(&EventType::JudgeVerdict));
        assert_eq!(*types.last().unwrap(), EventType::NodeLoopCompleted);
    }

    #[tokio::test]
    async fn test_set_output_flow() {
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::tool_call("set_output", json!({"key": "answer", "value": 42})),
            ScriptedTurn::text("all set"),
        ]));
        let spec = NodeSpec::event_loop("n")
            .with_output_keys(vec![OutputKeySpec::required("answer")]);
        let (result, events, state) = run_node(spec, &runtime).await;

        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.outputs.get("answer"), Some(&json!(42)));
        assert_eq!(state.get("answer"), Some(json!(42)));
        assert!(event_types(&events).contains(&EventType::OutputKeySet));
    }

    #[tokio::test]
    async fn test_accept_with_missing_keys_retries() {
        // First accept attempt lacks the required key; feedback loops the
        // model into setting it.
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::text("I think I'm done"),
            ScriptedTurn::tool_call("set_output", json!({"key": "answer", "value": "x"})),
        ]));
        let spec = NodeSpec::event_loop("n")
            .with_output_keys(vec![OutputKeySpec::required("answer")]);
        let (result, events, _) = run_node(spec, &runtime).await;

        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.iterations, 2);
        let missing_feedback = events.iter().any(|e| {
            e.event_type == EventType::JudgeVerdict
                && e.data
                    .get("feedback")
                    .and_then(Value::as_str)
                    .map(|f| f.contains("missing keys: answer"))
                    .unwrap_or(false)
        });
        assert!(missing_feedback);
    }

    #[tokio::test]
    async fn test_nullable_keys_not_required() {
        let runtime = runtime_with(ScriptedModel::new(vec![ScriptedTurn::text("done")]));
        let spec = NodeSpec::event_loop("n")
            .with_output_keys(vec![OutputKeySpec::nullable("maybe")]);
        let (result, _, _) = run_node(spec, &runtime).await;
        assert_eq!(result.status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_escalate_synthetic_tool() {
        let runtime = runtime_with(ScriptedModel::new(vec![ScriptedTurn::tool_call(
            "escalate_to_coder",
            json!({"reason": "credentials missing", "context": "tried twice"}),
        )]));
        let (result, events, _) = run_node(NodeSpec::event_loop("n"), &runtime).await;

        assert_eq!(result.status, NodeStatus::Escalated);
        let escalation = events
            .iter()
            .find(|e| e.event_type == EventType::EscalationRequested)
            .unwrap();
        assert_eq!(
            escalation.data.get("reason"),
            Some(&json!("credentials missing"))
        );
    }

    #[tokio::test]
    async fn test_tool_calls_emit_started_and_completed() {
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::tool_call("echo", json!({"q": 1})),
            ScriptedTurn::text("used the tool"),
        ]));
        let spec = NodeSpec::event_loop("n").with_tools(["echo"]);
        let (result, events, _) = run_node(spec, &runtime).await;

        assert_eq!(result.status, NodeStatus::Success);
        let types = event_types(&events);
        let started = types
            .iter()
            .position(|t| *t == EventType::ToolCallStarted)
            .unwrap();
        let completed = types
            .iter()
            .position(|t| *t == EventType::ToolCallCompleted)
            .unwrap();
        assert!(started < completed);
        // Implicit CONTINUE verdict for the tool-calling iteration.
        let implicit = events.iter().any(|e| {
            e.event_type == EventType::JudgeVerdict
                && e.data.get("judge_type") == Some(&json!("implicit"))
                && e.data.get("action") == Some(&json!("CONTINUE"))
        });
        assert!(implicit);
    }

    #[tokio::test]
    async fn test_unpermitted_tool_is_error_result() {
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::tool_call("echo", json!({})),
            ScriptedTurn::text("ok"),
        ]));
        // Node does not permit "echo".
        let (result, events, _) = run_node(NodeSpec::event_loop("n"), &runtime).await;

        assert_eq!(result.status, NodeStatus::Success);
        let completed = events
            .iter()
            .find(|e| e.event_type == EventType::ToolCallCompleted)
            .unwrap();
        assert_eq!(completed.data.get("is_error"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_stall_detection() {
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::text("same words"),
            ScriptedTurn::text("same words"),
            ScriptedTurn::text("same words"),
        ]))
        .with_judge(JudgeProtocol::new().with_rules(vec![EvaluationRule::new(
            "keep-going",
            Condition::TextMatches {
                pattern: ".*".to_string(),
            },
            RuleAction::Retry,
        )]));
        let (result, events, _) = run_node(NodeSpec::event_loop("n"), &runtime).await;

        assert_eq!(result.status, NodeStatus::Failed);
        assert!(event_types(&events).contains(&EventType::NodeStalled));
        assert_eq!(result.iterations, 3);
    }

    #[tokio::test]
    async fn test_doom_loop_corrects_then_fails() {
        let same_call = json!({"q": "identical"});
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::tool_call("echo", same_call.clone()),
            ScriptedTurn::tool_call("echo", same_call.clone()),
            ScriptedTurn::tool_call("echo", same_call.clone()),
            // After the corrective message the model repeats anyway.
            ScriptedTurn::tool_call("echo", same_call.clone()),
        ]));
        let spec = NodeSpec::event_loop("n").with_tools(["echo"]);
        let (result, events, _) = run_node(spec, &runtime).await;

        assert_eq!(result.status, NodeStatus::Failed);
        let doom_events = events
            .iter()
            .filter(|e| e.event_type == EventType::NodeToolDoomLoop)
            .count();
        assert_eq!(doom_events, 2);
    }

    #[tokio::test]
    async fn test_doom_loop_not_triggered_by_varied_input() {
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::tool_call("echo", json!({"q": 1})),
            ScriptedTurn::tool_call("echo", json!({"q": 2})),
            ScriptedTurn::tool_call("echo", json!({"q": 3})),
            ScriptedTurn::tool_call("echo", json!({"q": 4})),
            ScriptedTurn::text("done"),
        ]));
        let spec = NodeSpec::event_loop("n").with_tools(["echo"]);
        let (result, events, _) = run_node(spec, &runtime).await;

        assert_eq!(result.status, NodeStatus::Success);
        assert!(!event_types(&events).contains(&EventType::NodeToolDoomLoop));
    }

    #[tokio::test]
    async fn test_transient_retry_then_success() {
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::transient_error("rate limited"),
            ScriptedTurn::transient_error("rate limited again"),
            ScriptedTurn::text("recovered"),
        ]));
        let (result, events, _) = run_node(NodeSpec::event_loop("n"), &runtime).await;

        assert_eq!(result.status, NodeStatus::Success);
        let retries: Vec<&AgentEvent> = events
            .iter()
            .filter(|e| e.event_type == EventType::NodeRetry)
            .collect();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].data.get("retry_count"), Some(&json!(1)));
        assert_eq!(retries[1].data.get("retry_count"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails() {
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::transient_error("down"),
            ScriptedTurn::transient_error("down"),
            ScriptedTurn::transient_error("down"),
            ScriptedTurn::transient_error("down"),
        ]));
        let (result, events, _) = run_node(NodeSpec::event_loop("n"), &runtime).await;

        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == EventType::NodeRetry)
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_iteration_budget_exhaustion() {
        let runtime = runtime_with(ScriptedModel::new(vec![ScriptedTurn::text("working...")]))
            .with_judge(JudgeProtocol::new().with_rules(vec![EvaluationRule::new(
                "never-done",
                Condition::TextMatches {
                    pattern: ".*".to_string(),
                },
                RuleAction::Retry,
            )]));
        let spec = NodeSpec::event_loop("n").with_max_iterations(2);
        let (result, _, _) = run_node(spec, &runtime).await;

        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("iteration budget exhausted"));
        assert_eq!(result.iterations, 2);
    }

    #[tokio::test]
    async fn test_precancelled_returns_cancelled() {
        let runtime = runtime_with(ScriptedModel::always("hi"));
        let bus = EventBus::new();
        let state = SharedState::new(IsolationPolicy::Shared);
        let scoped = state.scoped("exec-1");
        let conversation = Mutex::new(NodeConversation::new());
        let controls = ExecutionControls::unrestricted();
        controls.cancel.cancel();

        let node = EventLoopNode::new(NodeSpec::event_loop("n"));
        let result = node
            .run(
                &runtime,
                &conversation,
                &scoped,
                &bus,
                &controls,
                &InjectionRouter::new(),
            )
            .await;
        assert_eq!(result.status, NodeStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_client_facing_blocks_for_input() {
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::text("What is your name?"),
            ScriptedTurn::tool_call("set_output", json!({"key": "name", "value": "Alice"})),
            ScriptedTurn::text("Nice to meet you, Alice."),
        ]));
        let spec = NodeSpec::event_loop("greet")
            .with_output_keys(vec![OutputKeySpec::required("name")])
            .client_facing();

        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::new());
        let state = SharedState::new(IsolationPolicy::Shared);
        let scoped = state.scoped("exec-1");
        let controls = ExecutionControls::unrestricted();
        let injections = InjectionRouter::new();

        let injections_clone = injections.clone();
        let injector = tokio::spawn(async move {
            // Wait until the node registers as blocked, then answer.
            for _ in 0..200 {
                if injections_clone.deliver("greet", "Alice") {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            false
        });

        let node = EventLoopNode::new(spec);
        let conversation = Mutex::new(NodeConversation::new());
        let result = node
            .run(&runtime, &conversation, &scoped, &bus, &controls, &injections)
            .await;

        assert!(injector.await.unwrap());
        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.outputs.get("name"), Some(&json!("Alice")));

        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        let types = event_types(&events);
        assert!(types.contains(&EventType::ClientInputRequested));
        assert!(types.contains(&EventType::NodeInputBlocked));
        // Client-facing nodes stream client deltas, not internal ones.
        assert!(types.contains(&EventType::ClientOutputDelta));
        assert!(!types.contains(&EventType::LlmTextDelta));
        // The injected input became a user turn.
        assert!(conversation
            .lock()
            .turns()
            .iter()
            .any(|t| t.role == crate::conversation::TurnRole::User && t.content == "Alice"));
    }

    #[tokio::test]
    async fn test_tool_error_results_fed_back_to_model() {
        // Spec scenario: tool errors twice, succeeds on the third call.
        let runtime = runtime_with(ScriptedModel::new(vec![
            ScriptedTurn::tool_call("flaky", json!({"attempt": 1})),
            ScriptedTurn::tool_call("flaky", json!({"attempt": 2})),
            ScriptedTurn::tool_call("flaky", json!({"attempt": 3})),
            ScriptedTurn::text("third time lucky"),
        ]));
        let spec = NodeSpec::event_loop("n").with_tools(["flaky"]);
        let (result, events, _) = run_node(spec, &runtime).await;

        assert_eq!(result.status, NodeStatus::Success);
        let completions: Vec<bool> = events
            .iter()
            .filter(|e| e.event_type == EventType::ToolCallCompleted)
            .map(|e| e.data.get("is_error") == Some(&json!(true)))
            .collect();
        assert_eq!(completions, vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_function_node_runs_and_emits() {
        let mut functions = FunctionRegistry::new();
        functions.register("double", |inputs: Map<String, Value>| {
            Box::pin(async move {
                let n = inputs.get("n").and_then(Value::as_i64).unwrap_or(0);
                let mut outputs = Map::new();
                outputs.insert("doubled".to_string(), json!(n * 2));
                Ok(outputs)
            })
        });
        let runtime = NodeRuntime::new(Arc::new(ScriptedModel::always("")))
            .with_functions(functions);

        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::new());
        let state = SharedState::new(IsolationPolicy::Shared);
        state.set("n", json!(21));
        let scoped = state.scoped("exec-1");

        let spec = NodeSpec::function("double").with_input_keys(["n"]);
        let result = run_function_node(&spec, &runtime, &scoped, &bus).await;

        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.iterations, 1);
        assert_eq!(state.get("doubled"), Some(json!(42)));

        let mut types = Vec::new();
        while let Some(event) = sub.try_recv() {
            types.push(event.event_type);
        }
        assert_eq!(types.first(), Some(&EventType::NodeLoopStarted));
        assert_eq!(types.last(), Some(&EventType::NodeLoopCompleted));
    }
}
