//! One live execution of a graph for a given entry point.
//!
//! An [`ExecutionStream`] generates the execution id, owns the cancellation
//! token and pause signal, derives the scope-stamping child bus, and runs
//! the [`GraphExecutor`] walk as a background task. It exposes the control
//! surface: `start`, `pause`, `resume`, `cancel`, `inject`, `status`.
//!
//! `pause` suspends (the node loop halts between iterations and awaits
//! resume); `cancel` is terminal. `execution_paused` / `execution_resumed`
//! are published at the boundary; a cancelled execution's final event is
//! its cause.

use crate::bus::{EventBus, EventScope};
use crate::conversation::NodeConversation;
use crate::event::{AgentEvent, EventType};
use crate::execution::{Execution, ExecutionStatus};
use crate::executor::{ExecutionEnv, GraphExecutor};
use crate::graph::Graph;
use crate::node::{ExecutionControls, InjectionRouter, NodeRuntime};
use crate::state::SharedState;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to one live execution.
pub struct ExecutionStream {
    execution: Arc<Mutex<Execution>>,
    executor: GraphExecutor,
    env: ExecutionEnv,
    pause_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionStream {
    /// Create a stream for one run of `graph` starting at `start_node`
    /// (the entry point's target). The bus is derived from `session_bus`
    /// and stamps graph, stream, and execution scope on every event.
    pub fn new(
        graph: Arc<Graph>,
        runtime: NodeRuntime,
        stream_id: impl Into<String>,
        start_node: impl Into<String>,
        input: Map<String, Value>,
        state: SharedState,
        session_bus: &EventBus,
        injections: InjectionRouter,
    ) -> Self {
        let stream_id = stream_id.into();
        let mut execution = Execution::new(graph.id.clone(), stream_id.clone(), input);
        execution.current_node = Some(start_node.into());

        let bus = session_bus.child(
            EventScope::graph(graph.id.clone())
                .with_stream(stream_id)
                .with_execution(execution.execution_id.clone()),
        );
        let (pause_tx, pause_rx) = watch::channel(false);
        let controls = ExecutionControls {
            cancel: CancellationToken::new(),
            pause: pause_rx,
        };
        let env = ExecutionEnv::new(state, bus, controls, injections);

        Self {
            execution: Arc::new(Mutex::new(execution)),
            executor: GraphExecutor::new(graph, runtime),
            env,
            pause_tx,
            task: Mutex::new(None),
        }
    }

    /// Restore the execution position and node conversations from a
    /// checkpoint before starting.
    pub fn restore(
        &self,
        current_node: Option<String>,
        visit_counts: HashMap<String, u32>,
        conversations: &BTreeMap<String, Value>,
    ) {
        {
            let mut execution = self.execution.lock();
            execution.current_node = current_node;
            execution.set_visit_counts(visit_counts);
        }
        let mut map = self.env.conversations.lock();
        map.clear();
        for (node_id, snapshot) in conversations {
            match NodeConversation::restore(snapshot) {
                Ok(conversation) => {
                    map.insert(node_id.clone(), Arc::new(Mutex::new(conversation)));
                }
                Err(e) => {
                    tracing::warn!(node = %node_id, error = %e, "skipping unreadable conversation snapshot");
                }
            }
        }
    }

    /// Spawn the executor walk. Idempotent: a second call is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        // Reserved event: no stable consumer yet, so the emitter stays
        // behind a feature flag while the type is already part of the
        // wire format.
        #[cfg(feature = "reserved-events")]
        self.env
            .bus
            .publish(AgentEvent::new(EventType::StreamStarted, ""));
        let executor = self.executor.clone();
        let execution = Arc::clone(&self.execution);
        let env = self.env.clone();
        *task = Some(tokio::spawn(async move {
            if let Err(e) = executor.execute(&execution, &env).await {
                tracing::debug!(error = %e, "execution ended with error");
            }
        }));
    }

    pub fn execution_id(&self) -> String {
        self.execution.lock().execution_id.clone()
    }

    pub fn stream_id(&self) -> String {
        self.execution.lock().stream_id.clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.execution.lock().status()
    }

    /// A copy of the current execution record.
    pub fn execution_snapshot(&self) -> Execution {
        self.execution.lock().clone()
    }

    /// Serialized in-flight node conversations (for checkpoints).
    pub fn conversation_snapshots(&self) -> BTreeMap<String, Value> {
        self.env
            .conversations
            .lock()
            .iter()
            .map(|(node_id, conversation)| (node_id.clone(), conversation.lock().snapshot()))
            .collect()
    }

    /// Suspend between node-loop iterations. Returns `false` when the
    /// execution is already terminal.
    pub fn pause(&self) -> bool {
        {
            let mut execution = self.execution.lock();
            if !execution.set_status(ExecutionStatus::Paused) {
                return false;
            }
        }
        let _ = self.pause_tx.send(true);
        self.env
            .bus
            .publish(AgentEvent::new(EventType::ExecutionPaused, ""));
        tracing::info!(execution_id = %self.execution_id(), "execution paused");
        true
    }

    /// Resume a paused execution.
    pub fn resume(&self) -> bool {
        {
            let mut execution = self.execution.lock();
            if execution.status() != ExecutionStatus::Paused {
                return false;
            }
            execution.set_status(ExecutionStatus::Running);
        }
        let _ = self.pause_tx.send(false);
        self.env
            .bus
            .publish(AgentEvent::new(EventType::ExecutionResumed, ""));
        tracing::info!(execution_id = %self.execution_id(), "execution resumed");
        true
    }

    /// Cancel the execution. Terminal; in-flight LLM and tool awaits abort
    /// at their next suspension point.
    pub fn cancel(&self) {
        self.env.controls.cancel.cancel();
        // Unblock a paused loop so it can observe the cancellation.
        let _ = self.pause_tx.send(false);
    }

    /// Deliver input to a node blocked on `client_input_requested`.
    /// Returns `false` when that node is not waiting.
    pub fn inject(&self, node_id: &str, content: impl Into<String>) -> bool {
        self.env.injections.deliver(node_id, content)
    }

    /// True when any node of this stream is blocked on client input.
    pub fn any_input_blocked(&self) -> bool {
        self.env.injections.any_blocked()
    }

    /// Nodes currently blocked on client input.
    pub fn blocked_nodes(&self) -> Vec<String> {
        self.env.injections.blocked_nodes()
    }

    /// Wait for the background walk to finish (tests and teardown).
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }
}

impl Drop for ExecutionStream {
    fn drop(&mut self) {
        // Streams do not outlive their owner silently.
        self.env.controls.cancel.cancel();
    }
}
