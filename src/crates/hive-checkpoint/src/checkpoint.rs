//! The checkpoint snapshot type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An immutable snapshot of one execution's state.
///
/// A checkpoint captures everything needed to resume or replay an execution:
/// the shared-state map, the serialized node conversations, the node the
/// executor was at, and the per-node visit counts. Checkpoint ids are unique
/// per session; restoring from one resets current node and visit counts to
/// the snapshot.
///
/// Node conversations are stored as opaque JSON values so this crate does
/// not depend on the engine's conversation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique id within the session (UUID v4).
    pub checkpoint_id: String,
    /// Session this checkpoint belongs to.
    pub session_id: String,
    /// Execution the snapshot was taken from.
    pub execution_id: String,
    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,
    /// Shared-state key/value map at snapshot time.
    pub shared_state_snapshot: BTreeMap<String, Value>,
    /// Serialized in-flight node conversations, keyed by node id.
    pub node_conversations_snapshot: BTreeMap<String, Value>,
    /// Node the executor was positioned at, if any.
    pub current_node: Option<String>,
    /// Per-node visit counts.
    pub visit_counts: BTreeMap<String, u32>,
}

impl Checkpoint {
    /// Create a new checkpoint with a fresh id and timestamp.
    pub fn new(session_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            execution_id: execution_id.into(),
            created_at: Utc::now(),
            shared_state_snapshot: BTreeMap::new(),
            node_conversations_snapshot: BTreeMap::new(),
            current_node: None,
            visit_counts: BTreeMap::new(),
        }
    }

    /// Set the shared-state snapshot.
    pub fn with_shared_state(mut self, snapshot: BTreeMap<String, Value>) -> Self {
        self.shared_state_snapshot = snapshot;
        self
    }

    /// Add a single shared-state entry.
    pub fn with_state_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.shared_state_snapshot.insert(key.into(), value);
        self
    }

    /// Set the serialized node conversations.
    pub fn with_conversations(mut self, snapshot: BTreeMap<String, Value>) -> Self {
        self.node_conversations_snapshot = snapshot;
        self
    }

    /// Set the current node.
    pub fn with_current_node(mut self, node: impl Into<String>) -> Self {
        self.current_node = Some(node.into());
        self
    }

    /// Set the per-node visit counts.
    pub fn with_visit_counts(mut self, counts: BTreeMap<String, u32>) -> Self {
        self.visit_counts = counts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_checkpoint_has_unique_id() {
        let a = Checkpoint::new("s1", "e1");
        let b = Checkpoint::new("s1", "e1");
        assert_ne!(a.checkpoint_id, b.checkpoint_id);
        assert_eq!(a.session_id, "s1");
        assert_eq!(a.execution_id, "e1");
    }

    #[test]
    fn test_builder_methods() {
        let cp = Checkpoint::new("s1", "e1")
            .with_current_node("plan")
            .with_state_entry("k", json!(42));

        assert_eq!(cp.current_node.as_deref(), Some("plan"));
        assert_eq!(cp.shared_state_snapshot.get("k"), Some(&json!(42)));
    }

    #[test]
    fn test_serde_round_trip() {
        let cp = Checkpoint::new("s1", "e1")
            .with_current_node("plan")
            .with_state_entry("k", json!({"nested": [1, 2, 3]}))
            .with_visit_counts([("plan".to_string(), 2u32)].into_iter().collect());

        let encoded = serde_json::to_string(&cp).unwrap();
        let decoded: Checkpoint = serde_json::from_str(&encoded).unwrap();
        assert_eq!(cp, decoded);
    }
}
