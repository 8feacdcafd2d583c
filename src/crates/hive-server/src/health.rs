//! The health judge: a timer-driven evaluator of recent worker activity.
//!
//! On a fixed schedule it drains a bus subscription window and reacts:
//!
//! - `escalation_requested` seen -> `queen_intervention_requested`;
//! - enough failures/pathologies in one window -> `worker_escalation_ticket`;
//! - completed executions -> `goal_progress`; and when the agent declares a
//!   `goal_key`, a truthy value in shared state emits `goal_achieved` once.

use hive_core::bus::{EventBus, EventFilter, EventScope};
use hive_core::event::{AgentEvent, EventType};
use hive_core::state::SharedState;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stream id stamped on health-judge events.
pub const HEALTH_STREAM_ID: &str = "health";

/// Failures in one window that raise a `worker_escalation_ticket`.
const FAILURE_THRESHOLD: u32 = 3;

/// Handle to a session's health judge task.
pub struct HealthJudge {
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthJudge {
    /// Spawn the judge on the session bus.
    pub fn spawn(
        session_bus: &EventBus,
        state: SharedState,
        interval: Duration,
        goal_key: Option<String>,
    ) -> Self {
        let subscription = session_bus.subscribe(EventFilter::new().with_event_types([
            EventType::ExecutionCompleted,
            EventType::ExecutionFailed,
            EventType::NodeStalled,
            EventType::NodeToolDoomLoop,
            EventType::NodeRetry,
            EventType::EscalationRequested,
        ]));
        let bus = session_bus.child(EventScope::default().with_stream(HEALTH_STREAM_ID));
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut goal_reported = false;
                let mut completed_total: u64 = 0;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let mut failures: u32 = 0;
                    let mut retries: u32 = 0;
                    let mut completed: u32 = 0;
                    let mut escalations: Vec<String> = Vec::new();
                    while let Some(event) = subscription.try_recv() {
                        match event.event_type {
                            EventType::ExecutionFailed
                            | EventType::NodeStalled
                            | EventType::NodeToolDoomLoop => failures += 1,
                            EventType::NodeRetry => retries += 1,
                            EventType::ExecutionCompleted => completed += 1,
                            EventType::EscalationRequested => {
                                escalations.push(
                                    event
                                        .data
                                        .get("reason")
                                        .and_then(Value::as_str)
                                        .unwrap_or("unspecified")
                                        .to_string(),
                                );
                            }
                            _ => {}
                        }
                    }

                    if !escalations.is_empty() {
                        bus.publish(
                            AgentEvent::new(EventType::QueenInterventionRequested, "")
                                .with_data("count", escalations.len())
                                .with_data("reasons", serde_json::json!(escalations)),
                        );
                    }

                    if failures >= FAILURE_THRESHOLD {
                        tracing::warn!(failures, retries, "worker unhealthy, raising ticket");
                        bus.publish(
                            AgentEvent::new(EventType::WorkerEscalationTicket, "")
                                .with_data("failures", failures)
                                .with_data("retries", retries),
                        );
                    }

                    if completed > 0 {
                        completed_total += u64::from(completed);
                        bus.publish(
                            AgentEvent::new(EventType::GoalProgress, "")
                                .with_data("completed_in_window", completed)
                                .with_data("completed_total", completed_total),
                        );
                    }

                    if !goal_reported {
                        if let Some(key) = &goal_key {
                            let achieved = match state.get(key) {
                                Some(Value::Bool(b)) => b,
                                Some(Value::Null) | None => false,
                                Some(_) => true,
                            };
                            if achieved {
                                goal_reported = true;
                                bus.publish(
                                    AgentEvent::new(EventType::GoalAchieved, "")
                                        .with_data("key", key.clone()),
                                );
                            }
                        }
                    }
                }
            })
        };

        Self {
            cancel,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Stop the judge task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for HealthJudge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::state::IsolationPolicy;
    use serde_json::json;

    #[tokio::test]
    async fn test_escalation_raises_queen_intervention() {
        let bus = EventBus::new();
        let sub = bus.subscribe(
            EventFilter::new().with_event_type(EventType::QueenInterventionRequested),
        );
        let state = SharedState::new(IsolationPolicy::Shared);
        let judge = HealthJudge::spawn(&bus, state, Duration::from_millis(30), None);

        bus.publish(
            AgentEvent::new(EventType::EscalationRequested, "worker")
                .with_data("reason", "stuck on credentials"),
        );

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.stream_id, HEALTH_STREAM_ID);
        assert_eq!(event.data.get("count"), Some(&json!(1)));
        judge.shutdown();
    }

    #[tokio::test]
    async fn test_failure_window_raises_ticket() {
        let bus = EventBus::new();
        let sub =
            bus.subscribe(EventFilter::new().with_event_type(EventType::WorkerEscalationTicket));
        let state = SharedState::new(IsolationPolicy::Shared);
        let judge = HealthJudge::spawn(&bus, state, Duration::from_millis(30), None);

        for _ in 0..3 {
            bus.publish(AgentEvent::new(EventType::ExecutionFailed, "worker"));
        }

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.data.get("failures"), Some(&json!(3)));
        judge.shutdown();
    }

    #[tokio::test]
    async fn test_goal_achieved_fires_once() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::new().with_event_type(EventType::GoalAchieved));
        let state = SharedState::new(IsolationPolicy::Shared);
        state.set("done", json!(true));
        let judge = HealthJudge::spawn(
            &bus,
            state,
            Duration::from_millis(20),
            Some("done".to_string()),
        );

        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        // Give the judge a few more ticks; no duplicate fires.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sub.try_recv().is_none());
        judge.shutdown();
    }
}
