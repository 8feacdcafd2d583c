//! Anthropic Claude client.
//!
//! Implements [`CompletionModel`] over the Anthropic messages API with SSE
//! streaming: text deltas and thinking deltas are forwarded as they arrive,
//! tool-use blocks are assembled from their partial-JSON deltas, and the
//! final [`CompletionTurn`] carries the full text, tool calls, and usage.

use crate::config::RemoteLlmConfig;
use crate::error::LlmError;
use async_trait::async_trait;
use futures::StreamExt;
use hive_core::llm::{
    ChatMessage, ChatRole, CompletionChunk, CompletionModel, CompletionRequest, CompletionStream,
    CompletionTurn, ToolCallRequest, Usage,
};
use hive_core::Result as EngineResult;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Claude API client.
#[derive(Clone)]
pub struct ClaudeClient {
    config: RemoteLlmConfig,
    client: Client,
}

impl ClaudeClient {
    /// Create a client with the given configuration.
    pub fn new(config: RemoteLlmConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Convert engine messages to Claude format. Claude keeps the system
    /// prompt outside the message list; tool results travel as user-role
    /// `tool_result` blocks.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<ClaudeMessage>) {
        let mut system: Option<String> = None;
        let mut converted: Vec<ClaudeMessage> = Vec::new();

        for message in messages {
            match message.role {
                ChatRole::System => {
                    system = Some(match system {
                        Some(existing) => format!("{existing}\n\n{}", message.content),
                        None => message.content.clone(),
                    });
                }
                ChatRole::User => converted.push(ClaudeMessage {
                    role: "user",
                    content: vec![ClaudeBlock::Text {
                        text: message.content.clone(),
                    }],
                }),
                ChatRole::Assistant => {
                    let mut blocks = Vec::new();
                    if !message.content.is_empty() {
                        blocks.push(ClaudeBlock::Text {
                            text: message.content.clone(),
                        });
                    }
                    for call in &message.tool_calls {
                        blocks.push(ClaudeBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.input.clone(),
                        });
                    }
                    if !blocks.is_empty() {
                        converted.push(ClaudeMessage {
                            role: "assistant",
                            content: blocks,
                        });
                    }
                }
                ChatRole::Tool => converted.push(ClaudeMessage {
                    role: "user",
                    content: vec![ClaudeBlock::ToolResult {
                        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                        content: message.content.clone(),
                    }],
                }),
            }
        }
        (system, converted)
    }

    fn build_body(&self, request: &CompletionRequest) -> ClaudeRequest {
        let (system, messages) = Self::convert_messages(&request.messages);
        ClaudeRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages,
            system,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            tools: request
                .tools
                .iter()
                .map(|tool| ClaudeTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.parameters.clone(),
                })
                .collect(),
            stream: true,
        }
    }
}

fn classify_status(status: reqwest::StatusCode, body: String) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::Authentication(body),
        429 => LlmError::RateLimited(body),
        400 | 404 | 422 => LlmError::InvalidRequest(body),
        500..=599 => LlmError::ServiceUnavailable(body),
        other => LlmError::Provider(format!("Claude API error {other}: {body}")),
    }
}

#[async_trait]
impl CompletionModel for ClaudeClient {
    async fn stream(&self, request: CompletionRequest) -> EngineResult<CompletionStream> {
        let url = format!("{}/v1/messages", self.config.base_url);
        let body = self.build_body(&request);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(LlmError::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text).into());
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut buffer = String::new();
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
            // index -> (id, name, accumulated partial json)
            let mut open_tools: HashMap<usize, (String, String, String)> = HashMap::new();
            let mut usage = Usage::default();

            'consume: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(LlmError::Http)?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim_end_matches('\r').to_string();
                    buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    // Tolerate unparseable frames rather than killing the turn.
                    let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
                        tracing::debug!(frame = data, "skipping unparseable stream frame");
                        continue;
                    };

                    match event.kind.as_str() {
                        "message_start" => {
                            if let Some(u) = event.message.and_then(|m| m.usage) {
                                usage.input_tokens = u.input_tokens;
                            }
                        }
                        "content_block_start" => {
                            if let (Some(index), Some(block)) = (event.index, event.content_block) {
                                if block.kind == "tool_use" {
                                    open_tools.insert(
                                        index,
                                        (
                                            block.id.unwrap_or_default(),
                                            block.name.unwrap_or_default(),
                                            String::new(),
                                        ),
                                    );
                                }
                            }
                        }
                        "content_block_delta" => {
                            if let Some(delta) = event.delta {
                                if let Some(t) = delta.text {
                                    text.push_str(&t);
                                    yield CompletionChunk::TextDelta(t);
                                } else if let Some(thinking) = delta.thinking {
                                    reasoning.push_str(&thinking);
                                    yield CompletionChunk::ReasoningDelta(thinking);
                                } else if let Some(partial) = delta.partial_json {
                                    if let Some(entry) =
                                        event.index.and_then(|i| open_tools.get_mut(&i))
                                    {
                                        entry.2.push_str(&partial);
                                    }
                                }
                            }
                        }
                        "content_block_stop" => {
                            if let Some((id, name, raw)) =
                                event.index.and_then(|i| open_tools.remove(&i))
                            {
                                let input = if raw.trim().is_empty() {
                                    json!({})
                                } else {
                                    serde_json::from_str(&raw)
                                        .unwrap_or(Value::String(raw))
                                };
                                tool_calls.push(ToolCallRequest::new(id, name, input));
                            }
                        }
                        "message_delta" => {
                            if let Some(u) = event.usage {
                                usage.output_tokens = u.output_tokens;
                            }
                        }
                        "message_stop" => break 'consume,
                        "error" => {
                            Err(LlmError::Provider(data.to_string()))?;
                        }
                        _ => {}
                    }
                }
            }

            yield CompletionChunk::Completed(CompletionTurn {
                text,
                reasoning: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls,
                usage: Some(usage),
            });
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    messages: Vec<ClaudeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ClaudeTool>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ClaudeTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ClaudeMessage {
    role: &'static str,
    content: Vec<ClaudeBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    content_block: Option<ContentBlockStart>,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    message: Option<MessageStart>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
struct StreamUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}
