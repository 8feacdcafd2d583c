//! Provider-agnostic streaming completion interface.
//!
//! The engine never talks to a concrete LLM API. It drives a
//! [`CompletionModel`]: providers stream [`CompletionChunk`]s (text deltas,
//! reasoning deltas, then a final assembled turn with any tool calls), and
//! the engine forwards deltas to the bus while it accumulates the turn.
//!
//! Provider crates implement this trait (see `hive-llm` for Claude and
//! Ollama); [`testing::ScriptedModel`] implements it with canned turns for
//! deterministic tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use hive_core::llm::{CompletionModel, CompletionRequest, ChatMessage};
//! use futures::StreamExt;
//!
//! let request = CompletionRequest::new(vec![
//!     ChatMessage::system("You are terse."),
//!     ChatMessage::user("What is 2 + 2?"),
//! ]);
//!
//! let mut stream = model.stream(request).await?;
//! while let Some(chunk) = stream.next().await {
//!     match chunk? {
//!         CompletionChunk::TextDelta(delta) => print!("{delta}"),
//!         CompletionChunk::Completed(turn) => println!("\n[{} tool calls]", turn.tool_calls.len()),
//!         _ => {}
//!     }
//! }
//! ```

pub mod testing;
pub mod throttle;

pub use throttle::ThrottledModel;

use crate::error::Result;
use crate::tool::ToolDefinition;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned id, echoed back with the result.
    pub id: String,
    /// Registered tool name.
    pub name: String,
    /// Arguments as a JSON object.
    pub input: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// One message in a completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Tool calls attached to an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// For tool-role messages: the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Attach tool calls (assistant messages only).
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallRequest>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// A completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Provider-specific model override.
    pub model: Option<String>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// The fully assembled assistant turn a stream resolves to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionTurn {
    /// Concatenated text content.
    pub text: String,
    /// Extended reasoning, for models that separate it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Tool calls the model requested this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CompletionTurn {
    /// True when the turn contains only text.
    pub fn is_text_only(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// One streamed chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionChunk {
    /// Incremental text content.
    TextDelta(String),
    /// Incremental reasoning content.
    ReasoningDelta(String),
    /// Final chunk: the assembled turn. Always the last item of a stream.
    Completed(CompletionTurn),
}

/// Boxed stream of completion chunks.
pub type CompletionStream = BoxStream<'static, Result<CompletionChunk>>;

/// Streaming chat completion, the engine's only view of a language model.
///
/// Implementations must be `Send + Sync`; share them as
/// `Arc<dyn CompletionModel>`. Errors should use
/// [`crate::EngineError::TransientLlm`] with `retryable` set according to
/// whether the engine's backoff budget applies.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Start a streaming completion. The stream ends with
    /// [`CompletionChunk::Completed`].
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream>;

    /// Convenience: drain the stream and return the final turn.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionTurn> {
        let mut stream = self.stream(request).await?;
        let mut text = String::new();
        let mut reasoning = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                CompletionChunk::TextDelta(delta) => text.push_str(&delta),
                CompletionChunk::ReasoningDelta(delta) => reasoning.push_str(&delta),
                CompletionChunk::Completed(turn) => return Ok(turn),
            }
        }
        // Stream ended without a Completed chunk; assemble from deltas.
        Ok(CompletionTurn {
            text,
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            tool_calls: Vec::new(),
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{ScriptedModel, ScriptedTurn};

    #[tokio::test]
    async fn test_complete_drains_stream() {
        let model = ScriptedModel::new(vec![ScriptedTurn::text("four")]);
        let turn = model
            .complete(CompletionRequest::new(vec![ChatMessage::user("2+2?")]))
            .await
            .unwrap();
        assert_eq!(turn.text, "four");
        assert!(turn.is_text_only());
    }

    #[test]
    fn test_chat_message_constructors() {
        let msg = ChatMessage::tool("{\"ok\":true}", "call-1");
        assert_eq!(msg.role, ChatRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call-1"));

        let msg = ChatMessage::assistant("").with_tool_calls(vec![ToolCallRequest::new(
            "call-2",
            "search",
            serde_json::json!({"q": "rust"}),
        )]);
        assert_eq!(msg.tool_calls.len(), 1);
    }
}
