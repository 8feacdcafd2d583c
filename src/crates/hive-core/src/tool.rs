//! Tool definitions, the registry, and the invocation contract.
//!
//! The engine only sees a [`ToolRegistry`] and the contract that a tool,
//! given a JSON input, produces a [`ToolOutcome`] within its timeout. A
//! failed executor becomes an error-flagged outcome - surfaced to the model
//! as a tool result it can react to - rather than an engine error.
//!
//! # Synthetic tools
//!
//! Two tools are always advertised to the model but never dispatched to an
//! executor; they short-circuit into the runtime:
//!
//! - `set_output(key, value)` writes a declared output key to shared state;
//! - `escalate_to_coder(reason, context)` exits the node as escalated.
//!
//! They are modeled as real registry entries ([`synthetic_definitions`]) so
//! prompts that advertise them stay truthful; the event loop intercepts them
//! by name before dispatch (see [`is_synthetic`]).

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Name of the synthetic output-writing tool.
pub const SET_OUTPUT: &str = "set_output";
/// Name of the synthetic escalation tool.
pub const ESCALATE_TO_CODER: &str = "escalate_to_coder";

/// Default per-tool execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// True for tool names the runtime resolves itself.
pub fn is_synthetic(name: &str) -> bool {
    name == SET_OUTPUT || name == ESCALATE_TO_CODER
}

/// Declarative description of a tool, advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the input object.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Definitions for the two synthetic runtime tools.
pub fn synthetic_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            SET_OUTPUT,
            "Set one of this node's declared output keys. \
             Outputs are only visible to the rest of the graph once set here.",
            json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string", "description": "Declared output key"},
                    "value": {"description": "Value to store"}
                },
                "required": ["key", "value"]
            }),
        ),
        ToolDefinition::new(
            ESCALATE_TO_CODER,
            "Escalate this node to a human operator when you cannot make progress.",
            json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "Why escalation is needed"},
                    "context": {"type": "string", "description": "What was attempted"}
                },
                "required": ["reason"]
            }),
        ),
    ]
}

/// Result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub content: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: json!({"error": message.into()}),
            is_error: true,
        }
    }

    /// Render the outcome as a tool-result message body.
    pub fn to_content_string(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Executor signature: JSON input to a JSON result or error message.
pub type ToolExecutorFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync>;

/// A registered tool: definition plus executor plus timeout.
#[derive(Clone)]
pub struct Tool {
    definition: ToolDefinition,
    executor: ToolExecutorFn,
    timeout: Duration,
}

impl Tool {
    /// Create a tool from an executor function.
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, executor: F) -> Self
    where
        F: Fn(Value) -> BoxFuture<'static, std::result::Result<Value, String>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            definition: ToolDefinition::new(name, description, json!({"type": "object"})),
            executor: Arc::new(executor),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Set the input JSON schema.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.definition.parameters = parameters;
        self
    }

    /// Override the execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Run the tool. Executor failures and timeouts become error outcomes.
    pub async fn execute(&self, input: Value) -> ToolOutcome {
        match tokio::time::timeout(self.timeout, (self.executor)(input)).await {
            Ok(Ok(content)) => ToolOutcome::ok(content),
            Ok(Err(message)) => ToolOutcome::error(message),
            Err(_) => ToolOutcome::error(format!(
                "tool '{}' timed out after {:?}",
                self.definition.name, self.timeout
            )),
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.definition.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Collection of tools available to a session.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any existing tool of the same name.
    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions for a node's permitted tools plus the synthetic tools.
    ///
    /// Unknown permitted names are skipped; the synthetic pair is always
    /// advertised.
    pub fn definitions_for(&self, permitted: &[String]) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = permitted
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition().clone())
            .collect();
        definitions.extend(synthetic_definitions());
        definitions
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_tool() -> Tool {
        Tool::new("echo", "Echo the input back", |input| {
            Box::pin(async move { Ok(json!({"echo": input})) })
        })
    }

    #[tokio::test]
    async fn test_execute_ok() {
        let tool = echo_tool();
        let outcome = tool.execute(json!({"msg": "hi"})).await;
        assert!(!outcome.is_error);
        assert_eq!(outcome.content, json!({"echo": {"msg": "hi"}}));
    }

    #[tokio::test]
    async fn test_executor_failure_becomes_error_outcome() {
        let tool = Tool::new("bad", "Always fails", |_| {
            Box::pin(async move { Err("broken".to_string()) })
        });
        let outcome = tool.execute(json!({})).await;
        assert!(outcome.is_error);
        assert_eq!(outcome.content, json!({"error": "broken"}));
    }

    #[tokio::test]
    async fn test_timeout_becomes_error_outcome() {
        let tool = Tool::new("slow", "Sleeps forever", |_| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            })
        })
        .with_timeout(Duration::from_millis(10));

        let outcome = tool.execute(json!({})).await;
        assert!(outcome.is_error);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());

        assert!(registry.has_tool("echo"));
        assert!(!registry.has_tool("missing"));
        assert_eq!(registry.tool_names(), vec!["echo"]);
    }

    #[test]
    fn test_definitions_include_synthetic_pair() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());

        let definitions = registry.definitions_for(&["echo".to_string(), "missing".to_string()]);
        let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["echo", SET_OUTPUT, ESCALATE_TO_CODER]);
    }

    #[test]
    fn test_is_synthetic() {
        assert!(is_synthetic(SET_OUTPUT));
        assert!(is_synthetic(ESCALATE_TO_CODER));
        assert!(!is_synthetic("echo"));
    }
}
