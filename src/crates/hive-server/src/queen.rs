//! The queen: a session's always-on conversational executor.
//!
//! The queen is an event-loop node with a dedicated system prompt, no
//! iteration budget, and the client-facing flag set. Its loop alternates
//! between streaming `client_output_delta` and blocking on
//! `client_input_requested`; `chat` feeds it. The conversation is
//! persistent for the life of the session, and the loop is respawned if it
//! ever exits without being shut down.

use hive_core::bus::{EventBus, EventScope};
use hive_core::conversation::NodeConversation;
use hive_core::llm::CompletionModel;
use hive_core::node::{EventLoopNode, ExecutionControls, InjectionRouter, NodeRuntime};
use hive_core::state::SharedState;
use hive_core::tool::ToolRegistry;
use hive_core::NodeSpec;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Node id the queen runs under.
pub const QUEEN_NODE_ID: &str = "queen";
/// Stream id stamped on queen events.
pub const QUEEN_STREAM_ID: &str = "queen";

const DEFAULT_QUEEN_PROMPT: &str = "You are the hive queen: the session's always-on \
    assistant. Converse with the user, answer questions about the running agents, and \
    coordinate work. Keep replies brief.";

/// Handle to a session's queen loop.
pub struct QueenRuntime {
    injections: InjectionRouter,
    cancel: CancellationToken,
    conversation: Arc<Mutex<NodeConversation>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    // Held so the queen's pause receiver stays open (the queen never pauses).
    _pause_tx: watch::Sender<bool>,
}

impl QueenRuntime {
    /// Spawn the queen loop on the session bus.
    pub fn spawn(
        model: Arc<dyn CompletionModel>,
        model_name: Option<String>,
        tools: ToolRegistry,
        session_bus: &EventBus,
        state: &SharedState,
        system_prompt: Option<String>,
    ) -> Self {
        let spec = NodeSpec::event_loop(QUEEN_NODE_ID)
            .with_system_prompt(system_prompt.unwrap_or_else(|| DEFAULT_QUEEN_PROMPT.to_string()))
            .client_facing();

        let runtime = NodeRuntime::new(model)
            .with_model_name(model_name)
            .with_tools(tools);
        let injections = InjectionRouter::new();
        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let controls = ExecutionControls {
            cancel: cancel.clone(),
            pause: pause_rx,
        };
        let bus = session_bus.child(EventScope::default().with_stream(QUEEN_STREAM_ID));
        let conversation = Arc::new(Mutex::new(NodeConversation::new()));
        let scoped = state.scoped(QUEEN_STREAM_ID);

        let task = {
            let injections = injections.clone();
            let conversation = Arc::clone(&conversation);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let node = EventLoopNode::new(spec);
                loop {
                    let result = node
                        .run(&runtime, &conversation, &scoped, &bus, &controls, &injections)
                        .await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    // The queen should never terminate on its own; back off
                    // and restart with the conversation intact.
                    tracing::warn!(
                        status = result.status.as_str(),
                        error = result.error.as_deref().unwrap_or(""),
                        "queen loop exited, restarting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            })
        };

        Self {
            injections,
            cancel,
            conversation,
            task: Mutex::new(Some(task)),
            _pause_tx: pause_tx,
        }
    }

    /// Deliver a chat message to the queen. The queen only accepts input
    /// while blocked on `client_input_requested`, so this retries briefly
    /// to bridge the gap while she is mid-turn.
    pub async fn chat(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        for _ in 0..40 {
            if self.injections.deliver(QUEEN_NODE_ID, message.clone()) {
                return true;
            }
            if self.cancel.is_cancelled() {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// True while the queen is blocked waiting for user input.
    pub fn is_waiting(&self) -> bool {
        self.injections.any_blocked()
    }

    /// Snapshot of the queen's conversation.
    pub fn conversation_snapshot(&self) -> serde_json::Value {
        self.conversation.lock().snapshot()
    }

    /// Stop the queen loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for QueenRuntime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::bus::EventFilter;
    use hive_core::event::EventType;
    use hive_core::llm::testing::{ScriptedModel, ScriptedTurn};
    use hive_core::state::IsolationPolicy;

    #[tokio::test]
    async fn test_queen_answers_chat() {
        let bus = EventBus::new();
        let sub = bus.subscribe(
            EventFilter::new().with_event_types([
                EventType::ClientOutputDelta,
                EventType::ClientInputRequested,
            ]),
        );
        let state = SharedState::new(IsolationPolicy::Shared);
        let model = ScriptedModel::new(vec![
            ScriptedTurn::text("Hello! How can I help?"),
            ScriptedTurn::text("Triage is running."),
        ]);

        let queen =
            QueenRuntime::spawn(Arc::new(model), None, ToolRegistry::new(), &bus, &state, None);

        // The queen greets, then blocks for input.
        let mut saw_request = false;
        for _ in 0..100 {
            if let Some(event) = sub.try_recv() {
                if event.event_type == EventType::ClientInputRequested {
                    saw_request = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_request);
        assert!(queen.is_waiting());

        assert!(queen.chat("how is triage going?").await);

        // Second reply streams, then the queen blocks again.
        let mut saw_second_reply = false;
        for _ in 0..100 {
            if let Some(event) = sub.try_recv() {
                if event.event_type == EventType::ClientOutputDelta
                    && event.data["snapshot"]
                        .as_str()
                        .map(|s| s.contains("Triage"))
                        .unwrap_or(false)
                {
                    saw_second_reply = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_second_reply);

        queen.shutdown();
    }
}
