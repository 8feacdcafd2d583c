//! In-memory typed pub/sub with filtered subscriptions.
//!
//! The bus carries every [`AgentEvent`] the runtime produces. Publishers
//! never block: each subscriber owns a bounded queue (default 1,000 events)
//! and, on overflow, the *oldest* event is dropped and a per-subscription
//! counter increments. Delivery to a single subscription preserves
//! publication order.
//!
//! Scope stamping: [`EventBus::child`] derives a bus that fills in
//! `graph_id` / `stream_id` / `execution_id` on every publish when the event
//! does not already carry them, so executors never pass scope by hand.
//!
//! Two consumption styles:
//!
//! - pull: [`EventBus::subscribe`] returns an [`EventSubscription`] with an
//!   async `recv`;
//! - push: [`EventBus::subscribe_fn`] spawns a drain task invoking a
//!   handler; a panicking handler is logged and isolated, the subscription
//!   stays active.

use crate::event::{AgentEvent, EventType};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

/// Subscription filter. All set fields are AND-combined; an empty filter
/// matches every event.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Event types to include (empty = all).
    pub event_types: HashSet<EventType>,
    /// Only events from this stream.
    pub stream_id: Option<String>,
    /// Only events from this node.
    pub node_id: Option<String>,
    /// Only events from this execution.
    pub execution_id: Option<String>,
    /// Only events from this graph.
    pub graph_id: Option<String>,
}

impl EventFilter {
    /// Create a filter that matches all events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one event type.
    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_types.insert(event_type);
        self
    }

    /// Add several event types.
    pub fn with_event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types.extend(types);
        self
    }

    /// Restrict to a stream.
    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Restrict to a node.
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Restrict to an execution.
    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Restrict to a graph.
    pub fn with_graph(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = Some(graph_id.into());
        self
    }

    /// True when the event passes every set criterion.
    pub fn matches(&self, event: &AgentEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(stream_id) = &self.stream_id {
            if &event.stream_id != stream_id {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if event.node_id.as_ref() != Some(node_id) {
                return false;
            }
        }
        if let Some(execution_id) = &self.execution_id {
            if event.execution_id.as_ref() != Some(execution_id) {
                return false;
            }
        }
        if let Some(graph_id) = &self.graph_id {
            if event.graph_id.as_ref() != Some(graph_id) {
                return false;
            }
        }
        true
    }

    /// True when no criterion is set.
    pub fn is_empty(&self) -> bool {
        self.event_types.is_empty()
            && self.stream_id.is_none()
            && self.node_id.is_none()
            && self.execution_id.is_none()
            && self.graph_id.is_none()
    }
}

/// Scope fields a derived bus stamps onto published events.
#[derive(Debug, Clone, Default)]
pub struct EventScope {
    pub graph_id: Option<String>,
    pub stream_id: Option<String>,
    pub execution_id: Option<String>,
}

impl EventScope {
    /// Scope stamping only a graph id.
    pub fn graph(graph_id: impl Into<String>) -> Self {
        Self {
            graph_id: Some(graph_id.into()),
            ..Self::default()
        }
    }

    /// Set the stream id.
    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Set the execution id.
    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

struct Subscriber {
    filter: EventFilter,
    queue: Mutex<VecDeque<AgentEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl Subscriber {
    fn enqueue(&self, event: AgentEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

struct BusShared {
    subscribers: RwLock<HashMap<u64, Arc<Subscriber>>>,
    next_id: AtomicU64,
    default_capacity: usize,
}

/// The event bus. Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
    scope: EventScope,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default per-subscriber queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus with a custom per-subscriber queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(BusShared {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                default_capacity: capacity.max(1),
            }),
            scope: EventScope::default(),
        }
    }

    /// Derive a bus that stamps `scope` onto every published event whose
    /// corresponding field is unset. Subscribers are shared with the parent.
    pub fn child(&self, scope: EventScope) -> EventBus {
        let merged = EventScope {
            graph_id: scope.graph_id.or_else(|| self.scope.graph_id.clone()),
            stream_id: scope.stream_id.or_else(|| self.scope.stream_id.clone()),
            execution_id: scope
                .execution_id
                .or_else(|| self.scope.execution_id.clone()),
        };
        EventBus {
            shared: Arc::clone(&self.shared),
            scope: merged,
        }
    }

    /// Publish an event to every matching subscriber. Never blocks; slow
    /// subscribers lose their oldest queued events instead.
    pub fn publish(&self, mut event: AgentEvent) {
        if event.graph_id.is_none() {
            event.graph_id = self.scope.graph_id.clone();
        }
        if event.stream_id.is_empty() {
            if let Some(stream_id) = &self.scope.stream_id {
                event.stream_id = stream_id.clone();
            }
        }
        if event.execution_id.is_none() {
            event.execution_id = self.scope.execution_id.clone();
        }

        let subscribers = self.shared.subscribers.read();
        for subscriber in subscribers.values() {
            if subscriber.filter.matches(&event) {
                subscriber.enqueue(event.clone());
            }
        }
    }

    /// Subscribe with a pull-style handle.
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.subscribe_with_capacity(filter, self.shared.default_capacity)
    }

    /// Subscribe with an explicit queue capacity.
    pub fn subscribe_with_capacity(
        &self,
        filter: EventFilter,
        capacity: usize,
    ) -> EventSubscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            filter,
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.shared
            .subscribers
            .write()
            .insert(id, Arc::clone(&subscriber));
        EventSubscription {
            id,
            subscriber,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Subscribe with a handler invoked from a background drain task.
    ///
    /// A panic inside the handler is caught and logged; the subscription
    /// remains active until the returned handle is unsubscribed or dropped.
    pub fn subscribe_fn<F>(&self, filter: EventFilter, handler: F) -> EventSubscription
    where
        F: Fn(AgentEvent) + Send + Sync + 'static,
    {
        let subscription = self.subscribe(filter);
        let subscriber = Arc::clone(&subscription.subscriber);
        tokio::spawn(async move {
            loop {
                let notified = subscriber.notify.notified();
                let event = subscriber.queue.lock().pop_front();
                match event {
                    Some(event) => {
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                            || handler(event),
                        ));
                        if result.is_err() {
                            tracing::error!("event handler panicked; subscription continues");
                        }
                    }
                    None => {
                        if subscriber.closed.load(Ordering::Acquire) {
                            break;
                        }
                        notified.await;
                    }
                }
            }
        });
        subscription
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.read().len()
    }
}

/// Handle to one subscription. Dropping it unsubscribes.
pub struct EventSubscription {
    id: u64,
    subscriber: Arc<Subscriber>,
    shared: Arc<BusShared>,
}

impl EventSubscription {
    /// Await the next event. Returns `None` once unsubscribed and drained.
    pub async fn recv(&self) -> Option<AgentEvent> {
        loop {
            let notified = self.subscriber.notify.notified();
            if let Some(event) = self.subscriber.queue.lock().pop_front() {
                return Some(event);
            }
            if self.subscriber.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Pop the next event without waiting.
    pub fn try_recv(&self) -> Option<AgentEvent> {
        self.subscriber.queue.lock().pop_front()
    }

    /// Events lost to queue overflow.
    pub fn dropped(&self) -> u64 {
        self.subscriber.dropped.load(Ordering::Relaxed)
    }

    /// Events currently queued.
    pub fn len(&self) -> usize {
        self.subscriber.queue.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop receiving events. Idempotent; queued events remain readable.
    pub fn unsubscribe(&self) {
        self.shared.subscribers.write().remove(&self.id);
        self.subscriber.closed.store(true, Ordering::Release);
        self.subscriber.notify.notify_waiters();
        self.subscriber.notify.notify_one();
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn event(ty: EventType, stream: &str) -> AgentEvent {
        AgentEvent::new(ty, stream)
    }

    #[tokio::test]
    async fn test_publish_subscribe_fifo() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::new());

        for i in 0..5 {
            bus.publish(event(EventType::Custom, "s").with_data("i", i));
        }

        for i in 0..5 {
            let received = sub.recv().await.unwrap();
            assert_eq!(received.data.get("i"), Some(&serde_json::json!(i)));
        }
        assert!(sub.is_empty());
    }

    #[tokio::test]
    async fn test_filter_by_type_and_stream() {
        let bus = EventBus::new();
        let sub = bus.subscribe(
            EventFilter::new()
                .with_event_type(EventType::JudgeVerdict)
                .with_stream("s1"),
        );

        bus.publish(event(EventType::JudgeVerdict, "s2"));
        bus.publish(event(EventType::Custom, "s1"));
        bus.publish(event(EventType::JudgeVerdict, "s1"));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::JudgeVerdict);
        assert_eq!(received.stream_id, "s1");
        assert!(sub.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = EventBus::with_capacity(1_000);
        let sub = bus.subscribe(EventFilter::new());

        for i in 0..1_001u32 {
            bus.publish(event(EventType::Custom, "s").with_data("i", i));
        }

        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.len(), 1_000);
        // The oldest (i = 0) was dropped; delivery starts at 1 and stays in order.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.data.get("i"), Some(&serde_json::json!(1)));
        let mut last = first;
        while let Some(next) = sub.try_recv() {
            assert!(
                next.data.get("i").unwrap().as_u64() > last.data.get("i").unwrap().as_u64()
            );
            last = next;
        }
        assert_eq!(last.data.get("i"), Some(&serde_json::json!(1_000)));
    }

    #[tokio::test]
    async fn test_child_scope_stamping() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::new());

        let child = bus
            .child(EventScope::graph("g1").with_stream("s1"))
            .child(EventScope::default().with_execution("e1"));
        child.publish(AgentEvent::new(EventType::Custom, ""));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.graph_id.as_deref(), Some("g1"));
        assert_eq!(received.stream_id, "s1");
        assert_eq!(received.execution_id.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn test_child_does_not_overwrite_existing_scope() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::new());

        let child = bus.child(EventScope::graph("g1"));
        child.publish(AgentEvent::new(EventType::Custom, "s").with_graph("explicit"));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.graph_id.as_deref(), Some("explicit"));
    }

    #[tokio::test]
    async fn test_unsubscribe_idempotent() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::new());
        assert_eq!(bus.subscriber_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(event(EventType::Custom, "s"));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_fn_handler_panic_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe_fn(EventFilter::new(), move |event| {
            if event.data.contains_key("boom") {
                panic!("handler failure");
            }
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(event(EventType::Custom, "s"));
        bus.publish(event(EventType::Custom, "s").with_data("boom", true));
        bus.publish(event(EventType::Custom, "s"));

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler kept processing after panic");
    }

    #[tokio::test]
    async fn test_independent_subscriber_queues() {
        let bus = EventBus::new();
        let all = bus.subscribe(EventFilter::new());
        let verdicts = bus.subscribe(EventFilter::new().with_event_type(EventType::JudgeVerdict));

        bus.publish(event(EventType::Custom, "s"));
        bus.publish(event(EventType::JudgeVerdict, "s"));

        assert_eq!(all.len(), 2);
        assert_eq!(verdicts.len(), 1);
    }
}
