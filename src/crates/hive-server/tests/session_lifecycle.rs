//! Session lifecycle scenarios: triggering graphs, chat routing,
//! pause/resume, and teardown, all driven by a scripted model.

use hive_core::bus::EventFilter;
use hive_core::event::EventType;
use hive_core::graph::{Condition, EdgeCondition, EdgeSpec, EntryPointSpec, Graph, NodeSpec};
use hive_core::judge::{EvaluationRule, RuleAction};
use hive_core::llm::testing::{ScriptedModel, ScriptedTurn};
use hive_core::tool::{Tool, ToolRegistry};
use hive_core::ExecutionStatus;
use hive_server::{AgentSpec, ChatTarget, ServerConfig, ServerError, SessionManager};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;

fn accept_on_done_rule() -> EvaluationRule {
    EvaluationRule::new(
        "accept-on-done",
        Condition::TextMatches {
            pattern: "DONE".to_string(),
        },
        RuleAction::Accept,
    )
}

fn manager_with(model: ScriptedModel, data_dir: &std::path::Path) -> Arc<SessionManager> {
    let mut tools = ToolRegistry::new();
    tools.register(Tool::new("probe", "Slow probe", |input| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!({"probed": input}))
        })
    }));

    let config = ServerConfig {
        data_dir: Some(data_dir.to_path_buf()),
        health_interval_secs: 1,
        ..ServerConfig::default()
    };
    Arc::new(SessionManager::new(config, Arc::new(model), tools))
}

fn linear_agent() -> AgentSpec {
    AgentSpec {
        name: "linear".to_string(),
        description: None,
        graphs: vec![Graph::new("pipeline", "a")
            .with_node(NodeSpec::event_loop("a"))
            .with_node(NodeSpec::event_loop("b"))
            .with_node(NodeSpec::event_loop("c"))
            .with_edge(EdgeSpec::new("a", "b", EdgeCondition::OnSuccess))
            .with_edge(EdgeSpec::new("b", "c", EdgeCondition::OnSuccess))
            .with_entry_point(EntryPointSpec::manual("run", "a"))],
        queen_prompt: Some("You are the queen.".to_string()),
        judge_rules: vec![accept_on_done_rule()],
        judge_confidence_threshold: None,
        health_interval_secs: None,
        goal_key: None,
    }
}

/// Wait until the queen has consumed her first turn and is blocked, so
/// worker scripting is deterministic afterwards.
async fn wait_for_queen(session: &hive_server::Session) {
    for _ in 0..200 {
        if session.queen().is_waiting() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queen never became ready");
}

#[tokio::test]
async fn linear_graph_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![
        ScriptedTurn::text("Hello, I am the queen."),
        ScriptedTurn::text("DONE a"),
        ScriptedTurn::text("DONE b"),
        ScriptedTurn::text("DONE c"),
    ]);
    let manager = manager_with(model, dir.path());

    let session = manager.create_session(Some("s1".to_string()), None, None).await.unwrap();
    session.load_worker(None, linear_agent(), None).unwrap();
    wait_for_queen(&session).await;

    let subscription = session.subscribe(
        EventFilter::new().with_event_types([
            EventType::ExecutionStarted,
            EventType::NodeLoopStarted,
            EventType::JudgeVerdict,
            EventType::EdgeTraversed,
            EventType::ExecutionCompleted,
        ]),
        1_000,
    );

    let mut input = Map::new();
    input.insert("q".to_string(), json!("hi"));
    let execution_id = session.trigger("run", input).unwrap();

    // Drain until completion.
    let mut types = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("event stream stalled")
            .expect("subscription closed");
        assert_eq!(event.execution_id.as_deref(), Some(execution_id.as_str()));
        types.push(event.event_type);
        if event.event_type == EventType::ExecutionCompleted {
            break;
        }
    }

    assert_eq!(types.first(), Some(&EventType::ExecutionStarted));
    let node_starts = types
        .iter()
        .filter(|t| **t == EventType::NodeLoopStarted)
        .count();
    assert_eq!(node_starts, 3);
    let traversals = types
        .iter()
        .filter(|t| **t == EventType::EdgeTraversed)
        .count();
    assert_eq!(traversals, 2);

    manager.stop_session("s1").await.unwrap();
}

#[tokio::test]
async fn duplicate_session_id_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ScriptedModel::always("hi"), dir.path());

    manager.create_session(Some("dup".to_string()), None, None).await.unwrap();
    let err = manager
        .create_session(Some("dup".to_string()), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::SessionExists(_)));
}

#[tokio::test]
async fn trigger_without_worker_fails() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ScriptedModel::always("hi"), dir.path());
    let session = manager.create_session(None, None, None).await.unwrap();

    let err = session.trigger("run", Map::new()).unwrap_err();
    assert!(matches!(err, ServerError::NoWorker(_)));
}

#[tokio::test]
async fn unload_worker_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ScriptedModel::always("hi"), dir.path());
    let session = manager.create_session(None, None, None).await.unwrap();

    session.load_worker(None, linear_agent(), None).unwrap();
    assert!(session.has_worker());
    session.unload_worker();
    assert!(!session.has_worker());
    // Second unload is a no-op.
    session.unload_worker();
}

#[tokio::test]
async fn chat_routes_to_blocked_worker_then_queen() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![
        ScriptedTurn::text("Queen here."),
        // Worker node asks for a name and blocks.
        ScriptedTurn::text("What is your name?"),
        // After injection it records the name and finishes.
        ScriptedTurn::tool_call("set_output", json!({"key": "name", "value": "Alice"})),
        // Queen handles the post-completion chat.
        ScriptedTurn::text("All done, Alice!"),
    ]);
    let manager = manager_with(model, dir.path());

    let agent = AgentSpec {
        name: "greeter".to_string(),
        description: None,
        graphs: vec![Graph::new("greet", "ask")
            .with_node(
                NodeSpec::event_loop("ask")
                    .with_output_keys(vec![hive_core::OutputKeySpec::required("name")])
                    .client_facing(),
            )
            .with_entry_point(EntryPointSpec::manual("go", "ask"))],
        queen_prompt: None,
        judge_rules: vec![EvaluationRule::new(
            "accept-when-named",
            Condition::KeyExists {
                key: "name".to_string(),
            },
            RuleAction::Accept,
        )],
        judge_confidence_threshold: None,
        health_interval_secs: None,
        goal_key: None,
    };

    let session = manager.create_session(Some("chatty".to_string()), None, None).await.unwrap();
    session.load_worker(None, agent, None).unwrap();
    wait_for_queen(&session).await;

    let subscription = session.subscribe(
        EventFilter::new().with_event_types([
            EventType::ClientInputRequested,
            EventType::ExecutionCompleted,
        ]),
        1_000,
    );
    let execution_id = session.trigger("go", Map::new()).unwrap();

    // Wait for the worker node to block on input.
    let blocked = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blocked.event_type, EventType::ClientInputRequested);
    assert_eq!(blocked.node_id.as_deref(), Some("ask"));

    // Priority 1: the blocked worker gets the message.
    let target = session.chat("Alice").await.unwrap();
    assert_eq!(
        target,
        ChatTarget::Injected {
            node_id: "ask".to_string()
        }
    );

    // The execution completes with the injected name.
    let completed = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.event_type, EventType::ExecutionCompleted);
    assert_eq!(completed.execution_id.as_deref(), Some(execution_id.as_str()));
    assert_eq!(session.state.get("name"), Some(json!("Alice")));

    // Priority 2: with no worker blocked, chat goes to the queen.
    let target = session.chat("thanks!").await.unwrap();
    assert_eq!(target, ChatTarget::Queen);
}

#[tokio::test]
async fn stop_pauses_then_resume_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut turns = vec![ScriptedTurn::text("Queen here.")];
    for i in 0..6 {
        turns.push(ScriptedTurn::tool_call("probe", json!({"i": i})));
    }
    turns.push(ScriptedTurn::text("DONE working"));
    let manager = manager_with(ScriptedModel::new(turns), dir.path());

    let agent = AgentSpec {
        name: "prober".to_string(),
        description: None,
        graphs: vec![Graph::new("work", "probe_node")
            .with_node(NodeSpec::event_loop("probe_node").with_tools(["probe"]))
            .with_entry_point(EntryPointSpec::manual("go", "probe_node"))],
        queen_prompt: None,
        judge_rules: vec![accept_on_done_rule()],
        judge_confidence_threshold: None,
        health_interval_secs: None,
        goal_key: None,
    };

    let session = manager.create_session(Some("pauser".to_string()), None, None).await.unwrap();
    session.load_worker(None, agent, None).unwrap();
    wait_for_queen(&session).await;

    let subscription = session.subscribe(
        EventFilter::new().with_event_types([
            EventType::ToolCallCompleted,
            EventType::ExecutionPaused,
            EventType::ExecutionResumed,
            EventType::ExecutionCompleted,
        ]),
        1_000,
    );
    let execution_id = session.trigger("go", Map::new()).unwrap();

    // After the first tool call completes, stop (pause + checkpoint).
    let first = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.event_type, EventType::ToolCallCompleted);
    let checkpoint_id = session.stop(&execution_id).await.unwrap();
    assert!(!checkpoint_id.is_empty());

    // The paused event arrives (the in-flight iteration may emit one more
    // tool event first), and a checkpoint is on disk.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        match event.event_type {
            EventType::ExecutionPaused => break,
            EventType::ToolCallCompleted => continue,
            other => panic!("unexpected event while pausing: {other}"),
        }
    }
    let checkpoints = session.list_checkpoints().await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].execution_id, execution_id);

    let stream = session.worker().unwrap().stream(&execution_id).unwrap();
    assert_eq!(stream.status(), ExecutionStatus::Paused);

    // Resume without a checkpoint id continues in place to completion.
    session.resume(None).await.unwrap();
    let mut saw_resumed = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        match event.event_type {
            EventType::ExecutionResumed => saw_resumed = true,
            EventType::ExecutionCompleted => break,
            _ => {}
        }
    }
    assert!(saw_resumed);
    assert_eq!(stream.status(), ExecutionStatus::Completed);
}

#[tokio::test]
async fn replay_from_checkpoint_starts_fresh_execution() {
    let dir = tempfile::tempdir().unwrap();
    let mut turns = vec![ScriptedTurn::text("Queen here.")];
    for i in 0..6 {
        turns.push(ScriptedTurn::tool_call("probe", json!({"i": i})));
    }
    // Enough finishing turns for the original and the replay.
    turns.push(ScriptedTurn::text("DONE working"));
    let manager = manager_with(ScriptedModel::new(turns), dir.path());

    let agent = AgentSpec {
        name: "prober".to_string(),
        description: None,
        graphs: vec![Graph::new("work", "probe_node")
            .with_node(NodeSpec::event_loop("probe_node").with_tools(["probe"]))
            .with_entry_point(EntryPointSpec::manual("go", "probe_node"))],
        queen_prompt: None,
        judge_rules: vec![accept_on_done_rule()],
        judge_confidence_threshold: None,
        health_interval_secs: None,
        goal_key: None,
    };

    let session = manager.create_session(Some("replayer".to_string()), None, None).await.unwrap();
    session.load_worker(None, agent, None).unwrap();
    wait_for_queen(&session).await;

    let subscription = session.subscribe(
        EventFilter::new().with_event_type(EventType::ToolCallCompleted),
        1_000,
    );
    let execution_id = session.trigger("go", Map::new()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap()
        .unwrap();

    let checkpoint_id = session.stop(&execution_id).await.unwrap();
    let replayed_id = session.replay(&checkpoint_id).await.unwrap();
    assert_ne!(replayed_id, execution_id);

    let replayed = session.worker().unwrap().stream(&replayed_id).unwrap();
    for _ in 0..300 {
        if replayed.status().is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(replayed.status(), ExecutionStatus::Completed);
}
