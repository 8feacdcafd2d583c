//! Agent specifications: the packaged graphs, prompts, and judge rules a
//! worker runs.
//!
//! A spec is a YAML or JSON document. Loading validates every graph before
//! any execution starts; a bad spec is rejected with a configuration error.
//!
//! ```yaml
//! name: support-triage
//! queen_prompt: "You are the hive queen for support triage."
//! graphs:
//!   - id: triage
//!     entry_node: classify
//!     nodes:
//!       - id: classify
//!         system_prompt: "Classify the ticket."
//!         output_keys: [{ key: category }]
//!     entry_points:
//!       - id: ticket
//!         trigger: manual
//!         target_node: classify
//! judge_rules:
//!   - id: done
//!     condition: { key_exists: { key: category } }
//!     action: ACCEPT
//! ```

use hive_core::judge::EvaluationRule;
use hive_core::{EngineError, Graph, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// A packaged agent: graphs plus prompts and judge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub graphs: Vec<Graph>,
    /// System prompt for the session's queen.
    #[serde(default)]
    pub queen_prompt: Option<String>,
    /// Deterministic judge rules applied to every node.
    #[serde(default)]
    pub judge_rules: Vec<EvaluationRule>,
    #[serde(default)]
    pub judge_confidence_threshold: Option<f64>,
    /// Health judge tick override, seconds.
    #[serde(default)]
    pub health_interval_secs: Option<u64>,
    /// Shared-state key whose truthy value means the agent's goal is met.
    #[serde(default)]
    pub goal_key: Option<String>,
}

impl AgentSpec {
    /// Load and validate a spec from a YAML (`.yaml`/`.yml`) or JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let spec: AgentSpec = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .map_err(|e| EngineError::Config(format!("bad agent spec {}: {e}", path.display())))?,
            _ => serde_yaml::from_str(&raw)
                .map_err(|e| EngineError::Config(format!("bad agent spec {}: {e}", path.display())))?,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Parse and validate an inline JSON spec.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let spec: AgentSpec = serde_json::from_value(value)
            .map_err(|e| EngineError::Config(format!("bad agent spec: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Structural validation, performed at load time.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::Config("agent spec has no name".to_string()));
        }
        if self.graphs.is_empty() {
            return Err(EngineError::Config(format!(
                "agent '{}' declares no graphs",
                self.name
            )));
        }

        let mut graph_ids = HashSet::new();
        let mut entry_point_ids = HashSet::new();
        for graph in &self.graphs {
            if !graph_ids.insert(graph.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "agent '{}' has duplicate graph id '{}'",
                    self.name, graph.id
                )));
            }
            graph.validate()?;
            for entry_point in &graph.entry_points {
                if !entry_point_ids.insert(entry_point.id.as_str()) {
                    return Err(EngineError::Config(format!(
                        "agent '{}' has duplicate entry point id '{}'",
                        self.name, entry_point.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// The graph owning an entry point, with the entry point itself.
    pub fn resolve_entry_point(
        &self,
        entry_point_id: &str,
    ) -> Option<(&Graph, &hive_core::EntryPointSpec)> {
        for graph in &self.graphs {
            if let Some(entry_point) = graph.entry_point(entry_point_id) {
                return Some((graph, entry_point));
            }
        }
        None
    }

    pub fn graph(&self, graph_id: &str) -> Option<&Graph> {
        self.graphs.iter().find(|g| g.id == graph_id)
    }
}
