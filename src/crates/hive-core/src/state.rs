//! Per-session shared state with isolation policies.
//!
//! A [`SharedState`] is a concurrent key/value map scoped to one session.
//! The isolation policy, chosen at session creation, governs what
//! executions see:
//!
//! - `Isolated` - each execution reads only keys it has written itself;
//! - `Shared` - all executions see all keys (the default);
//! - `Synchronized` - shared, with per-key advisory locks serializing
//!   writers for the duration of the writing node.
//!
//! Writes emit `state_changed` events carrying the old and new values. The
//! notification fires *after* the write lock is released, so a subscriber
//! reacting to the event can read the map without deadlocking.

use crate::bus::EventBus;
use crate::event::{AgentEvent, EventType};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Visibility policy for a session's shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationPolicy {
    /// Each execution sees only keys it writes.
    Isolated,
    /// All executions in the session see all keys.
    #[default]
    Shared,
    /// Shared, with writes serialized by per-key advisory locks.
    Synchronized,
}

/// An immutable copy of the state map. Ordered so snapshots compare and
/// serialize deterministically.
pub type StateSnapshot = BTreeMap<String, Value>;

struct StateInner {
    values: RwLock<HashMap<String, Value>>,
    policy: IsolationPolicy,
    bus: Option<EventBus>,
    /// Keys written per execution; backs the ISOLATED read rule.
    write_sets: RwLock<HashMap<String, HashSet<String>>>,
    /// Advisory per-key locks for SYNCHRONIZED.
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Concurrent key/value state for one session.
///
/// Cloning is cheap; clones share the same map.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<StateInner>,
}

impl SharedState {
    /// Create a state map with the given isolation policy.
    pub fn new(policy: IsolationPolicy) -> Self {
        Self {
            inner: Arc::new(StateInner {
                values: RwLock::new(HashMap::new()),
                policy,
                bus: None,
                write_sets: RwLock::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a state map that publishes `state_changed` events on `bus`.
    pub fn with_bus(policy: IsolationPolicy, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(StateInner {
                values: RwLock::new(HashMap::new()),
                policy,
                bus: Some(bus),
                write_sets: RwLock::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The session's isolation policy.
    pub fn policy(&self) -> IsolationPolicy {
        self.inner.policy
    }

    /// Read a key, ignoring isolation scoping.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.values.read().get(key).cloned()
    }

    /// Write a key. Emits `state_changed {key, old, new}` after the lock is
    /// released.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.set_inner(key.into(), value, None);
    }

    fn set_inner(&self, key: String, value: Value, execution_id: Option<&str>) {
        let old = {
            let mut values = self.inner.values.write();
            values.insert(key.clone(), value.clone())
        };
        if let Some(execution_id) = execution_id {
            self.inner
                .write_sets
                .write()
                .entry(execution_id.to_string())
                .or_default()
                .insert(key.clone());
        }
        self.notify_changed(&key, old, Some(value), execution_id);
    }

    /// Remove a key. Returns `true` if it was present.
    pub fn delete(&self, key: &str) -> bool {
        let old = self.inner.values.write().remove(key);
        let existed = old.is_some();
        if existed {
            self.notify_changed(key, old, None, None);
        }
        existed
    }

    fn notify_changed(
        &self,
        key: &str,
        old: Option<Value>,
        new: Option<Value>,
        execution_id: Option<&str>,
    ) {
        if let Some(bus) = &self.inner.bus {
            let mut event = AgentEvent::new(EventType::StateChanged, "")
                .with_data("key", key)
                .with_data("old", old.unwrap_or(Value::Null))
                .with_data("new", new.unwrap_or(Value::Null));
            if let Some(execution_id) = execution_id {
                event = event.with_execution(execution_id);
            }
            bus.publish(event);
        }
    }

    /// Immutable copy of the full map.
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner
            .values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replace the map's contents with `snapshot`. Write sets are cleared;
    /// restored keys belong to no execution.
    pub fn restore(&self, snapshot: StateSnapshot) {
        let mut values = self.inner.values.write();
        values.clear();
        values.extend(snapshot);
        drop(values);
        self.inner.write_sets.write().clear();
    }

    /// Number of keys present.
    pub fn len(&self) -> usize {
        self.inner.values.read().len()
    }

    /// True when no keys are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A view of this state scoped to one execution, enforcing the ISOLATED
    /// read-your-writes rule.
    pub fn scoped(&self, execution_id: impl Into<String>) -> ScopedState {
        ScopedState {
            state: self.clone(),
            execution_id: execution_id.into(),
        }
    }

    /// Acquire the advisory lock for `key`. Used under SYNCHRONIZED to
    /// serialize writers for the duration of the writing node.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.key_locks.lock();
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Drop the write-set bookkeeping for a finished execution.
    pub fn forget_execution(&self, execution_id: &str) {
        self.inner.write_sets.write().remove(execution_id);
    }
}

/// Execution-scoped view of a [`SharedState`].
#[derive(Clone)]
pub struct ScopedState {
    state: SharedState,
    execution_id: String,
}

impl ScopedState {
    /// The execution this view belongs to.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// The underlying session state.
    pub fn shared(&self) -> &SharedState {
        &self.state
    }

    /// Read a key. Under ISOLATED, keys this execution has not written
    /// read as unset.
    pub fn get(&self, key: &str) -> Option<Value> {
        if self.state.inner.policy == IsolationPolicy::Isolated {
            let write_sets = self.state.inner.write_sets.read();
            let visible = write_sets
                .get(&self.execution_id)
                .map(|keys| keys.contains(key))
                .unwrap_or(false);
            if !visible {
                return None;
            }
        }
        self.state.get(key)
    }

    /// Write a key on behalf of this execution.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.state
            .set_inner(key.into(), value, Some(&self.execution_id));
    }

    /// Remove a key.
    pub fn delete(&self, key: &str) -> bool {
        self.state.delete(key)
    }
}
