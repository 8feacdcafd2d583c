//! Append-only turn log for one node invocation.
//!
//! A [`NodeConversation`] accumulates the turns of a single in-flight node:
//! system prompt, injected user input, assistant output, and tool results.
//! It is cleared when the node completes and is not persisted across node
//! boundaries (node results flow into shared state through declared output
//! keys), but it snapshots into checkpoints so paused executions resume with
//! their context intact.

use crate::llm::{ChatMessage, ToolCallRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    System,
    User,
    Assistant,
    ToolResult,
}

/// One entry in the turn log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Append-only list of turns for one node invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConversation {
    turns: Vec<Turn>,
}

impl NodeConversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn push_system(&mut self, content: impl Into<String>) {
        self.push(Turn::new(TurnRole::System, content));
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Turn::new(TurnRole::User, content));
    }

    /// Append an assistant turn, recording any tool calls in metadata so
    /// the turn replays faithfully to the model.
    pub fn push_assistant(&mut self, content: impl Into<String>, tool_calls: &[ToolCallRequest]) {
        let mut turn = Turn::new(TurnRole::Assistant, content);
        if !tool_calls.is_empty() {
            turn = turn.with_metadata(
                "tool_calls",
                serde_json::to_value(tool_calls).unwrap_or(Value::Null),
            );
        }
        self.push(turn);
    }

    /// Append a tool result turn.
    pub fn push_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) {
        self.push(
            Turn::new(TurnRole::ToolResult, content)
                .with_metadata("tool_call_id", Value::String(tool_call_id.into()))
                .with_metadata("is_error", Value::Bool(is_error)),
        );
    }

    /// All turns in order.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Drop all turns (node completed).
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// The content of the last `n` assistant turns, most recent first.
    pub fn last_assistant_contents(&self, n: usize) -> Vec<&str> {
        self.turns
            .iter()
            .rev()
            .filter(|t| t.role == TurnRole::Assistant)
            .take(n)
            .map(|t| t.content.as_str())
            .collect()
    }

    /// Convert to LLM chat messages. Assistant tool calls and tool-result
    /// linkage round-trip through turn metadata.
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| match turn.role {
                TurnRole::System => ChatMessage::system(&turn.content),
                TurnRole::User => ChatMessage::user(&turn.content),
                TurnRole::Assistant => {
                    let tool_calls = turn
                        .metadata
                        .get("tool_calls")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default();
                    ChatMessage::assistant(&turn.content).with_tool_calls(tool_calls)
                }
                TurnRole::ToolResult => {
                    let call_id = turn
                        .metadata
                        .get("tool_call_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    ChatMessage::tool(&turn.content, call_id)
                }
            })
            .collect()
    }

    /// Serialize for inclusion in a checkpoint.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Rebuild from a checkpoint snapshot.
    pub fn restore(snapshot: &Value) -> crate::error::Result<Self> {
        Ok(serde_json::from_value(snapshot.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatRole;
    use serde_json::json;

    #[test]
    fn test_append_and_order() {
        let mut conversation = NodeConversation::new();
        conversation.push_system("be terse");
        conversation.push_user("hello");
        conversation.push_assistant("hi", &[]);

        let roles: Vec<TurnRole> = conversation.turns().iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![TurnRole::System, TurnRole::User, TurnRole::Assistant]
        );
    }

    #[test]
    fn test_last_assistant_contents() {
        let mut conversation = NodeConversation::new();
        conversation.push_assistant("a", &[]);
        conversation.push_user("x");
        conversation.push_assistant("b", &[]);
        conversation.push_assistant("c", &[]);

        assert_eq!(conversation.last_assistant_contents(2), vec!["c", "b"]);
        assert_eq!(conversation.last_assistant_contents(10).len(), 3);
    }

    #[test]
    fn test_to_chat_messages_round_trips_tool_calls() {
        let mut conversation = NodeConversation::new();
        let call = ToolCallRequest::new("call-1", "search", json!({"q": "x"}));
        conversation.push_assistant("looking it up", std::slice::from_ref(&call));
        conversation.push_tool_result("call-1", "{\"hits\": 3}", false);

        let messages = conversation.to_chat_messages();
        assert_eq!(messages[0].role, ChatRole::Assistant);
        assert_eq!(messages[0].tool_calls, vec![call]);
        assert_eq!(messages[1].role, ChatRole::Tool);
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut conversation = NodeConversation::new();
        conversation.push_system("prompt");
        conversation.push_tool_result("call-1", "out", true);

        let snapshot = conversation.snapshot();
        let restored = NodeConversation::restore(&snapshot).unwrap();
        assert_eq!(restored, conversation);
    }

    #[test]
    fn test_clear() {
        let mut conversation = NodeConversation::new();
        conversation.push_user("hello");
        conversation.clear();
        assert!(conversation.is_empty());
    }
}
