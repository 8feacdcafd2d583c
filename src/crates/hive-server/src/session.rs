//! One session: a bus, shared state, an always-on queen, and the optional
//! worker/health pair.
//!
//! Chat routing priority: a worker node blocked on `client_input_requested`
//! receives the message first; otherwise the queen does; if neither can
//! take it the call fails. `stop` pauses an execution and writes a
//! checkpoint (resumable); `cancel` is terminal. Teardown releases
//! resources in reverse of creation: health judge, worker (active
//! executions checkpointed first), then the queen.

use crate::agent::AgentSpec;
use crate::error::{Result, ServerError};
use crate::eventlog::EventLog;
use crate::health::HealthJudge;
use crate::queen::QueenRuntime;
use crate::worker::WorkerRuntime;
use chrono::{DateTime, Utc};
use hive_checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
use hive_core::bus::{EventBus, EventFilter, EventSubscription};
use hive_core::llm::CompletionModel;
use hive_core::state::{IsolationPolicy, SharedState};
use hive_core::stream::ExecutionStream;
use hive_core::tool::ToolRegistry;
use hive_core::ExecutionStatus;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Where a chat message landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    /// Injected into a worker node blocked on client input.
    Injected { node_id: String },
    /// Delivered to the queen conversation.
    Queen,
}

/// A live session.
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub bus: EventBus,
    pub state: SharedState,
    tools: ToolRegistry,
    model: Arc<dyn CompletionModel>,
    /// Per-session model name override from session creation.
    model_name: Option<String>,
    queen: QueenRuntime,
    worker: Mutex<Option<Arc<WorkerRuntime>>>,
    health: Mutex<Option<HealthJudge>>,
    checkpoints: Arc<FileCheckpointStore>,
    event_log: Option<EventLog>,
    default_health_interval: Duration,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session: bus, state, queen, checkpoint store, optional
    /// event log.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        session_id: impl Into<String>,
        model: Arc<dyn CompletionModel>,
        model_name: Option<String>,
        tools: ToolRegistry,
        checkpoints: Arc<FileCheckpointStore>,
        isolation: IsolationPolicy,
        queen_prompt: Option<String>,
        event_log_dir: Option<&Path>,
        default_health_interval: Duration,
    ) -> Result<Self> {
        let session_id = session_id.into();
        let bus = EventBus::new();
        let state = SharedState::with_bus(isolation, bus.clone());

        let event_log = match event_log_dir {
            Some(dir) => Some(
                EventLog::start(&bus, dir)
                    .await
                    .map_err(|e| ServerError::Engine(hive_core::EngineError::Execution(e.to_string())))?,
            ),
            None => None,
        };

        let queen = QueenRuntime::spawn(
            Arc::clone(&model),
            model_name.clone(),
            tools.clone(),
            &bus,
            &state,
            queen_prompt,
        );

        tracing::info!(session_id = %session_id, "session created");
        Ok(Self {
            session_id,
            created_at: Utc::now(),
            bus,
            state,
            tools,
            model,
            model_name,
            queen,
            worker: Mutex::new(None),
            health: Mutex::new(None),
            checkpoints,
            event_log,
            default_health_interval,
        })
    }

    pub fn queen(&self) -> &QueenRuntime {
        &self.queen
    }

    pub fn worker(&self) -> Option<Arc<WorkerRuntime>> {
        self.worker.lock().clone()
    }

    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Load (or replace) the worker and its health judge. The model name
    /// override, when given, takes precedence over the session's.
    pub fn load_worker(
        &self,
        worker_id: Option<String>,
        agent: AgentSpec,
        model_name: Option<String>,
    ) -> Result<()> {
        agent.validate()?;
        self.unload_worker();

        let worker_id = worker_id.unwrap_or_else(|| format!("{}-worker", agent.name));
        let interval = agent
            .health_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_health_interval);
        let goal_key = agent.goal_key.clone();

        let worker = Arc::new(WorkerRuntime::new(
            worker_id,
            agent,
            Arc::clone(&self.model),
            model_name.or_else(|| self.model_name.clone()),
            self.tools.clone(),
            self.bus.clone(),
            self.state.clone(),
        ));
        let health = HealthJudge::spawn(&self.bus, self.state.clone(), interval, goal_key);

        *self.worker.lock() = Some(worker);
        *self.health.lock() = Some(health);
        tracing::info!(session_id = %self.session_id, "worker loaded");
        Ok(())
    }

    /// Tear down the worker and health judge. No-op without a worker.
    pub fn unload_worker(&self) {
        if let Some(health) = self.health.lock().take() {
            health.shutdown();
        }
        if let Some(worker) = self.worker.lock().take() {
            worker.shutdown();
            tracing::info!(session_id = %self.session_id, worker_id = %worker.worker_id, "worker unloaded");
        }
    }

    fn require_worker(&self) -> Result<Arc<WorkerRuntime>> {
        self.worker()
            .ok_or_else(|| ServerError::NoWorker(self.session_id.clone()))
    }

    /// Start an execution from an entry point.
    pub fn trigger(&self, entry_point_id: &str, input: Map<String, Value>) -> Result<String> {
        self.require_worker()?.trigger(entry_point_id, input)
    }

    /// Deliver input to a specific blocked worker node.
    pub fn inject(&self, node_id: &str, content: &str) -> Result<bool> {
        Ok(self.require_worker()?.inject(node_id, content))
    }

    /// Route a chat message: blocked worker node first, queen second.
    pub async fn chat(&self, message: &str) -> Result<ChatTarget> {
        if let Some(worker) = self.worker() {
            if let Some(node_id) = worker.blocked_nodes().into_iter().next() {
                if worker.inject(&node_id, message) {
                    return Ok(ChatTarget::Injected { node_id });
                }
            }
        }
        if self.queen.chat(message).await {
            return Ok(ChatTarget::Queen);
        }
        Err(ServerError::ChatUndeliverable)
    }

    fn find_stream(&self, execution_id: &str) -> Result<Arc<ExecutionStream>> {
        self.require_worker()?
            .stream(execution_id)
            .ok_or_else(|| ServerError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Pause an execution and persist a checkpoint. Returns the checkpoint
    /// id; the execution can be resumed in place or restored later.
    pub async fn stop(&self, execution_id: &str) -> Result<String> {
        let stream = self.find_stream(execution_id)?;
        if !stream.pause() {
            return Err(ServerError::ExecutionNotFound(format!(
                "{execution_id} (already terminal)"
            )));
        }
        let checkpoint = self.checkpoint_stream(&stream).await?;
        Ok(checkpoint.checkpoint_id)
    }

    /// Cancel an execution. Terminal.
    pub fn cancel(&self, execution_id: &str) -> Result<()> {
        self.find_stream(execution_id)?.cancel();
        Ok(())
    }

    /// Resume: with no checkpoint id, unpause every paused execution; with
    /// one, restore state and position from the snapshot and start a fresh
    /// stream there. Returns the restored execution id, if any.
    pub async fn resume(&self, checkpoint_id: Option<&str>) -> Result<Option<String>> {
        match checkpoint_id {
            None => {
                let worker = self.require_worker()?;
                let mut resumed = 0;
                for stream in worker.active_streams() {
                    if stream.status() == ExecutionStatus::Paused && stream.resume() {
                        resumed += 1;
                    }
                }
                if resumed == 0 {
                    return Err(ServerError::NothingToResume);
                }
                Ok(None)
            }
            Some(checkpoint_id) => {
                let restored = self.restore_from_checkpoint(checkpoint_id, true).await?;
                Ok(Some(restored))
            }
        }
    }

    /// Replay from a checkpoint: a fresh execution positioned at the
    /// snapshot, leaving any original execution untouched.
    pub async fn replay(&self, checkpoint_id: &str) -> Result<String> {
        self.restore_from_checkpoint(checkpoint_id, false).await
    }

    async fn restore_from_checkpoint(
        &self,
        checkpoint_id: &str,
        cancel_original: bool,
    ) -> Result<String> {
        let worker = self.require_worker()?;
        let checkpoint = self
            .checkpoints
            .get(&self.session_id, checkpoint_id)
            .await?
            .ok_or_else(|| ServerError::CheckpointNotFound(checkpoint_id.to_string()))?;

        // The original stream (when still known) names the graph and entry
        // point; otherwise fall back to the graph containing the node.
        let original = worker.stream(&checkpoint.execution_id);
        let (graph_id, stream_id) = match &original {
            Some(stream) => {
                let snapshot = stream.execution_snapshot();
                (snapshot.graph_id, snapshot.stream_id)
            }
            None => {
                let node = checkpoint.current_node.as_deref().unwrap_or_default();
                let graph = worker
                    .agent
                    .graphs
                    .iter()
                    .find(|g| g.node(node).is_some())
                    .ok_or_else(|| ServerError::GraphNotFound(format!("for node '{node}'")))?;
                (graph.id.clone(), "restored".to_string())
            }
        };
        if cancel_original {
            if let Some(stream) = original {
                stream.cancel();
            }
        }

        self.state.restore(checkpoint.shared_state_snapshot.clone());
        let execution_id = worker.start_restored(
            &graph_id,
            &stream_id,
            checkpoint.current_node.clone(),
            checkpoint.visit_counts.clone().into_iter().collect(),
            &checkpoint.node_conversations_snapshot,
        )?;
        tracing::info!(
            session_id = %self.session_id,
            checkpoint_id,
            execution_id = %execution_id,
            "execution restored from checkpoint"
        );
        Ok(execution_id)
    }

    /// Snapshot one stream into the checkpoint store.
    pub async fn checkpoint_stream(&self, stream: &ExecutionStream) -> Result<Checkpoint> {
        let execution = stream.execution_snapshot();
        let mut checkpoint = Checkpoint::new(&self.session_id, &execution.execution_id)
            .with_shared_state(self.state.snapshot())
            .with_conversations(stream.conversation_snapshots())
            .with_visit_counts(
                execution
                    .visit_counts()
                    .iter()
                    .map(|(node, count)| (node.clone(), *count))
                    .collect(),
            );
        if let Some(node) = &execution.current_node {
            checkpoint = checkpoint.with_current_node(node);
        }
        self.checkpoints.put(checkpoint.clone()).await?;
        Ok(checkpoint)
    }

    /// List this session's checkpoints in creation order.
    pub async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.checkpoints.list(&self.session_id).await?)
    }

    /// Subscribe to the session bus with a bounded queue.
    pub fn subscribe(&self, filter: EventFilter, capacity: usize) -> EventSubscription {
        self.bus.subscribe_with_capacity(filter, capacity)
    }

    /// Session detail for the API.
    pub fn detail(&self) -> Value {
        let worker = self.worker().map(|worker| {
            let (active, finished) = worker.execution_counts();
            json!({
                "worker_id": worker.worker_id,
                "agent": worker.agent.name,
                "graphs": worker.graph_ids(),
                "active_executions": active,
                "finished_executions": finished,
                "blocked_nodes": worker.blocked_nodes(),
            })
        });
        json!({
            "session_id": self.session_id,
            "created_at": self.created_at.to_rfc3339(),
            "queen_waiting": self.queen.is_waiting(),
            "worker": worker,
        })
    }

    /// Tear the session down: health judge, worker (checkpointing active
    /// executions first), queen, event log.
    pub async fn shutdown(&self) {
        if let Some(health) = self.health.lock().take() {
            health.shutdown();
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            for stream in worker.active_streams() {
                stream.pause();
                if let Err(e) = self.checkpoint_stream(&stream).await {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "failed to flush checkpoint during teardown"
                    );
                }
            }
            worker.shutdown();
        }

        self.queen.shutdown();
        if let Some(event_log) = &self.event_log {
            event_log.shutdown();
        }
        tracing::info!(session_id = %self.session_id, "session stopped");
    }
}
