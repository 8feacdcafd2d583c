//! Property tests: codec and snapshot round trips.

use hive_core::state::{IsolationPolicy, SharedState};
use hive_core::{AgentEvent, EventType};
use proptest::prelude::*;
use serde_json::{json, Value};

fn arb_event_type() -> impl Strategy<Value = EventType> {
    prop_oneof![
        Just(EventType::ExecutionStarted),
        Just(EventType::ExecutionCompleted),
        Just(EventType::ExecutionFailed),
        Just(EventType::NodeLoopStarted),
        Just(EventType::NodeLoopIteration),
        Just(EventType::LlmTextDelta),
        Just(EventType::ToolCallStarted),
        Just(EventType::ToolCallCompleted),
        Just(EventType::ClientOutputDelta),
        Just(EventType::ClientInputRequested),
        Just(EventType::JudgeVerdict),
        Just(EventType::OutputKeySet),
        Just(EventType::EdgeTraversed),
        Just(EventType::StateChanged),
        Just(EventType::StateConflict),
        Just(EventType::EscalationRequested),
        Just(EventType::WebhookReceived),
        Just(EventType::Custom),
    ]
}

fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4).prop_map(|map| {
                Value::Object(map.into_iter().collect())
            }),
        ]
    })
}

proptest! {
    #[test]
    fn agent_event_json_round_trip(
        event_type in arb_event_type(),
        stream_id in "[a-z0-9-]{1,12}",
        node_id in proptest::option::of("[a-z0-9_]{1,12}"),
        execution_id in proptest::option::of("[a-f0-9-]{1,16}"),
        graph_id in proptest::option::of("[a-z0-9-]{1,12}"),
        correlation_id in proptest::option::of("[a-z0-9-]{1,12}"),
        data in prop::collection::btree_map("[a-z_]{1,10}", arb_json(), 0..5),
    ) {
        let mut event = AgentEvent::new(event_type, stream_id);
        event.node_id = node_id;
        event.execution_id = execution_id;
        event.graph_id = graph_id;
        event.correlation_id = correlation_id;
        for (key, value) in data {
            event.data.insert(key, value);
        }

        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: AgentEvent = serde_json::from_str(&encoded).unwrap();
        prop_assert_eq!(event, decoded);
    }

    #[test]
    fn shared_state_snapshot_restore_round_trip(
        entries in prop::collection::btree_map("[a-z_]{1,10}", arb_json(), 0..8),
        churn in prop::collection::btree_map("[a-z_]{1,10}", arb_json(), 0..8),
    ) {
        let state = SharedState::new(IsolationPolicy::Shared);
        for (key, value) in &entries {
            state.set(key.clone(), value.clone());
        }
        let snapshot = state.snapshot();

        // Mutate arbitrarily, then restore.
        for (key, value) in churn {
            state.set(key, value);
        }
        state.delete(entries.keys().next().map(String::as_str).unwrap_or("absent"));

        state.restore(snapshot.clone());
        prop_assert_eq!(state.snapshot(), snapshot);
    }
}
