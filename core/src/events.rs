//! In-process event bus
//!
//! Fan-out is synchronous: subscribers run in subscription order on the
//! publishing thread. A subscriber that panics is logged and skipped; the
//! remaining subscribers still run and the publisher never sees the panic.
//!
//! Async consumers can take a broadcast receiver from
//! [`EventBus::subscribe_channel`]. Slow receivers lag and lose the oldest
//! events; publishing with no receivers is a no-op.

use crate::metrics::Metric;
use parking_lot::RwLock;
use serde::Serialize;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Events published by the monitor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum MonitorEvent {
    #[serde(rename = "operation:success")]
    OperationSuccess { operation: String },

    #[serde(rename = "operation:failure")]
    OperationFailure { operation: String, error: String },

    #[serde(rename = "metric:recorded")]
    MetricRecorded(Metric),
}

impl MonitorEvent {
    /// Wire name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::OperationSuccess { .. } => "operation:success",
            MonitorEvent::OperationFailure { .. } => "operation:failure",
            MonitorEvent::MetricRecorded(_) => "metric:recorded",
        }
    }
}

type Subscriber = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventBus {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    /// `channel_capacity` is raised to 1 when zero; broadcast channels need room for one event
    pub fn new(channel_capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            channel,
        }
    }

    /// Register a listener; it sees every event published after this call
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(listener)));
        debug!(subscription = id.0, "Event subscriber registered");
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        before != subscribers.len()
    }

    /// Receiver for async consumers
    pub fn subscribe_channel(&self) -> broadcast::Receiver<MonitorEvent> {
        self.channel.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn publish(&self, event: MonitorEvent) {
        // Snapshot so listeners may (un)subscribe without deadlocking
        let subscribers: Vec<(SubscriptionId, Subscriber)> = self.subscribers.read().clone();

        for (id, subscriber) in &subscribers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber(&event))) {
                warn!(
                    subscription = id.0,
                    event = event.kind(),
                    panic = %panic_message(panic.as_ref()),
                    "Event subscriber panicked"
                );
            }
        }

        if self.channel.receiver_count() > 0 {
            // Err only when every receiver has gone away in the meantime
            let _ = self.channel.send(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::EventConfig::default().channel_capacity)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("channel_receivers", &self.channel.receiver_count())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn success(operation: &str) -> MonitorEvent {
        MonitorEvent::OperationSuccess {
            operation: operation.to_string(),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(success("fetch"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribers_run_in_subscription_order() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            bus.subscribe(move |_| order.lock().push(i));
        }

        bus.publish(success("fetch"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::default();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(|_| panic!("listener exploded"));
        let sink = delivered.clone();
        bus.subscribe(move |event| sink.lock().push(event.kind()));

        bus.publish(success("fetch"));
        bus.publish(MonitorEvent::OperationFailure {
            operation: "fetch".to_string(),
            error: "timeout".to_string(),
        });

        assert_eq!(
            *delivered.lock(),
            vec!["operation:success", "operation:failure"]
        );
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicU64::new(0));

        let counter = count.clone();
        let id = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(success("a"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(success("b"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscriber_may_subscribe_during_publish() {
        let bus = Arc::new(EventBus::default());
        let inner = bus.clone();

        bus.subscribe(move |_| {
            inner.subscribe(|_| {});
        });

        bus.publish(success("fetch"));
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_channel_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_channel();

        bus.publish(success("fetch"));

        let event = rx.recv().await.expect("event delivered");
        assert_eq!(event, success("fetch"));
    }

    #[tokio::test]
    async fn test_zero_capacity_channel_still_delivers() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe_channel();

        bus.publish(success("fetch"));

        assert_eq!(rx.recv().await.expect("event delivered"), success("fetch"));
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(MonitorEvent::OperationFailure {
            operation: "fetch".to_string(),
            error: "timeout".to_string(),
        })
        .expect("serializable");

        assert_eq!(json["type"], "operation:failure");
        assert_eq!(json["operation"], "fetch");
        assert_eq!(json["error"], "timeout");
    }
}
