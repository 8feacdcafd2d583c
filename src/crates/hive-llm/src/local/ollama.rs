//! Ollama client.
//!
//! Implements [`CompletionModel`] over Ollama's `/api/chat` endpoint with
//! NDJSON streaming. Ollama emits tool calls whole (no partial-JSON
//! assembly); ids are synthesized since the protocol has none.

use crate::config::LocalLlmConfig;
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

/// Ollama API client.
#[derive(Clone)]
pub struct OllamaClient {
    config: LocalLlmConfig,
    client: Client,
}

impl OllamaClient {
    /// Create a client with the given configuration.
    pub fn new(config: LocalLlmConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Check whether the Ollama server answers at all.
    pub async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.config.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn convert_messages(messages: &[ChatMessage]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|message| OllamaMessage {
                role: match message.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                },
                content: message.content.clone(),
                tool_calls: message
                    .tool_calls
                    .iter()
                    .map(|call| OllamaToolCall {
                        function: OllamaFunctionCall {
                            name: call.name.clone(),
                            arguments: call.input.clone(),
                        },
                    })
                    .collect(),
            })
            .collect()
    }
}

#[async_trait]
impl CompletionModel for OllamaClient {
    async fn stream(&self, request: CompletionRequest) -> EngineResult<CompletionStream> {
        let url = format!("{}/api/chat", self.config.base_url);
        let body = OllamaRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages: Self::convert_messages(&request.messages),
            stream: true,
            tools: request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
            options: request.temperature.map(|t| json!({"temperature": t})),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    LlmError::ServiceUnavailable(format!(
                        "Ollama not reachable at {}: {e}",
                        self.config.base_url
                    ))
                } else {
                    LlmError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                LlmError::ServiceUnavailable(text)
            } else {
                LlmError::Provider(format!("Ollama error {status}: {text}"))
            }
            .into());
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut buffer = String::new();
            let mut text = String::new();
            let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
            let mut usage = Usage::default();
            let mut call_counter = 0usize;

            'consume: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(LlmError::Http)?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(frame) = serde_json::from_str::<OllamaFrame>(&line) else {
                        tracing::debug!(frame = %line, "skipping unparseable stream frame");
                        continue;
                    };

                    if let Some(message) = frame.message {
                        if !message.content.is_empty() {
                            text.push_str(&message.content);
                            yield CompletionChunk::TextDelta(message.content);
                        }
                        for call in message.tool_calls {
                            call_counter += 1;
                            tool_calls.push(ToolCallRequest::new(
                                format!("ollama-call-{call_counter}"),
                                call.function.name,
                                call.function.arguments,
                            ));
                        }
                    }
                    if frame.done {
                        usage.input_tokens = frame.prompt_eval_count.unwrap_or(0);
                        usage.output_tokens = frame.eval_count.unwrap_or(0);
                        break 'consume;
                    }
                }
            }

            yield CompletionChunk::Completed(CompletionTurn {
                text,
                reasoning: None,
                tool_calls,
                usage: Some(usage),
            });
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Value>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct OllamaFrame {
    #[serde(default)]
    message: Option<OllamaFrameMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaFrameMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}
