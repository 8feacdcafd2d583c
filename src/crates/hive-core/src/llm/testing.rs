//! Scripted completion model for deterministic tests.
//!
//! [`ScriptedModel`] replays a fixed sequence of turns, one per `stream`
//! call, and records every request it receives. Turns can also be scripted
//! to fail with a transient error, which exercises the engine's retry path.

use super::{
    CompletionChunk, CompletionModel, CompletionRequest, CompletionStream, CompletionTurn,
    ToolCallRequest,
};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// One scripted model turn.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// When set, the turn fails with a transient error instead of streaming.
    pub error: Option<String>,
}

impl ScriptedTurn {
    /// A plain text turn.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            error: None,
        }
    }

    /// A turn that calls one tool.
    pub fn tool_call(name: impl Into<String>, input: Value) -> Self {
        let name = name.into();
        Self {
            text: String::new(),
            reasoning: None,
            tool_calls: vec![ToolCallRequest::new(
                format!("call-{}", uuid::Uuid::new_v4()),
                name,
                input,
            )],
            error: None,
        }
    }

    /// A turn that fails with a transient error.
    pub fn transient_error(message: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            reasoning: None,
            tool_calls: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// Attach text to a tool-call turn.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Attach reasoning content.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Attach an additional tool call.
    pub fn with_tool_call(mut self, name: impl Into<String>, input: Value) -> Self {
        self.tool_calls.push(ToolCallRequest::new(
            format!("call-{}", uuid::Uuid::new_v4()),
            name,
            input,
        ));
        self
    }
}

#[derive(Default)]
struct Script {
    turns: VecDeque<ScriptedTurn>,
    requests: Vec<CompletionRequest>,
}

/// Completion model that replays scripted turns.
///
/// When the script runs dry the model repeats its last turn, so unbounded
/// loops (the queen, stall scenarios) stay deterministic.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    script: Arc<Mutex<Script>>,
    last: Arc<Mutex<Option<ScriptedTurn>>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                turns: turns.into(),
                requests: Vec::new(),
            })),
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// A model that answers every request with the same text.
    pub fn always(text: impl Into<String>) -> Self {
        Self::new(vec![ScriptedTurn::text(text)])
    }

    /// Append a turn to the script.
    pub fn push(&self, turn: ScriptedTurn) {
        self.script.lock().turns.push_back(turn);
    }

    /// Requests observed so far, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.script.lock().requests.clone()
    }

    /// Number of `stream` calls observed.
    pub fn call_count(&self) -> usize {
        self.script.lock().requests.len()
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let turn = {
            let mut script = self.script.lock();
            script.requests.push(request);
            match script.turns.pop_front() {
                Some(turn) => {
                    *self.last.lock() = Some(turn.clone());
                    turn
                }
                None => self
                    .last
                    .lock()
                    .clone()
                    .unwrap_or_else(|| ScriptedTurn::text("")),
            }
        };

        if let Some(message) = turn.error {
            return Err(EngineError::transient_llm(message));
        }

        let completed = CompletionTurn {
            text: turn.text.clone(),
            reasoning: turn.reasoning.clone(),
            tool_calls: turn.tool_calls,
            usage: None,
        };

        let mut chunks: Vec<Result<CompletionChunk>> = Vec::new();
        if let Some(reasoning) = turn.reasoning {
            chunks.push(Ok(CompletionChunk::ReasoningDelta(reasoning)));
        }
        if !turn.text.is_empty() {
            // Split the text so consumers see more than one delta.
            let mid = turn.text.len() / 2;
            let mid = (0..=mid)
                .rev()
                .find(|i| turn.text.is_char_boundary(*i))
                .unwrap_or(0);
            let (head, tail) = turn.text.split_at(mid);
            if !head.is_empty() {
                chunks.push(Ok(CompletionChunk::TextDelta(head.to_string())));
            }
            if !tail.is_empty() {
                chunks.push(Ok(CompletionChunk::TextDelta(tail.to_string())));
            }
        }
        chunks.push(Ok(CompletionChunk::Completed(completed)));

        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_replays_turns_in_order() {
        let model = ScriptedModel::new(vec![
            ScriptedTurn::text("first"),
            ScriptedTurn::tool_call("search", json!({"q": "x"})),
        ]);

        let turn = model
            .complete(CompletionRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        assert_eq!(turn.text, "first");

        let turn = model
            .complete(CompletionRequest::new(vec![ChatMessage::user("next")]))
            .await
            .unwrap();
        assert_eq!(turn.tool_calls[0].name, "search");
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn test_repeats_last_turn_when_exhausted() {
        let model = ScriptedModel::new(vec![ScriptedTurn::text("same")]);
        for _ in 0..3 {
            let turn = model
                .complete(CompletionRequest::new(vec![ChatMessage::user("hi")]))
                .await
                .unwrap();
            assert_eq!(turn.text, "same");
        }
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let model = ScriptedModel::new(vec![
            ScriptedTurn::transient_error("rate limited"),
            ScriptedTurn::text("recovered"),
        ]);

        let err = model
            .stream(CompletionRequest::new(vec![]))
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());

        let turn = model.complete(CompletionRequest::new(vec![])).await.unwrap();
        assert_eq!(turn.text, "recovered");
    }

    #[tokio::test]
    async fn test_streams_multiple_deltas() {
        let model = ScriptedModel::new(vec![ScriptedTurn::text("hello world")]);
        let mut stream = model.stream(CompletionRequest::new(vec![])).await.unwrap();

        let mut deltas = Vec::new();
        let mut completed = None;
        while let Some(chunk) = stream.next().await {
            match chunk.unwrap() {
                CompletionChunk::TextDelta(d) => deltas.push(d),
                CompletionChunk::Completed(turn) => completed = Some(turn),
                _ => {}
            }
        }
        assert!(deltas.len() >= 2);
        assert_eq!(deltas.concat(), "hello world");
        assert_eq!(completed.unwrap().text, "hello world");
    }
}
