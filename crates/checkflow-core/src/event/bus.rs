//! Typed publish/subscribe bus for `WorkflowEvent`.
//!
//! Handlers subscribe to one `EventName` (or to everything) and are invoked
//! synchronously, in registration order, from `publish`. The same events are
//! also fanned out over a `tokio::sync::broadcast` channel for async
//! consumers. Publishing with no subscribers is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use checkflow_types::event::{EventName, WorkflowEvent};
use tokio::sync::broadcast;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    filter: Option<EventName>,
    handler: Handler,
}

/// Event bus shared by the engine and its listeners.
///
/// Cloning the bus shares the subscriber registry and the broadcast sender.
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a bus whose broadcast channel buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            sender,
        }
    }

    /// Register `handler` for events named `event`.
    pub fn subscribe<F>(&self, event: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.register(Some(event), Arc::new(handler))
    }

    /// Register `handler` for every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Deliver `event` to matching handlers, then to broadcast receivers.
    ///
    /// Handlers run outside the registry lock, so a handler may subscribe
    /// or unsubscribe without deadlocking.
    pub fn publish(&self, event: WorkflowEvent) {
        let name = event.name();
        let handlers: Vec<Handler> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.filter.is_none_or(|f| f == name))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            handler(&event);
        }
        let _ = self.sender.send(event);
    }

    /// A receiver for every event published from now on.
    pub fn stream(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn register(&self, filter: Option<EventName>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                filter,
                handler,
            });
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            subscriptions: Arc::clone(&self.subscriptions),
            next_id: Arc::clone(&self.next_id),
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recovered(n: usize) -> WorkflowEvent {
        WorkflowEvent::RecoveryCompleted { recovered: n }
    }

    #[test]
    fn handlers_filter_by_name() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(EventName::RecoveryCompleted, move |e| {
            sink.lock().unwrap().push(e.name());
        });

        bus.publish(WorkflowEvent::RecoveryStarted);
        bus.publish(recovered(1));

        assert_eq!(*seen.lock().unwrap(), vec![EventName::RecoveryCompleted]);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let sink = Arc::clone(&order);
            bus.subscribe_all(move |_| sink.lock().unwrap().push(tag));
        }
        bus.publish(WorkflowEvent::RecoveryStarted);

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&count);
        let id = bus.subscribe_all(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(recovered(0));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(recovered(0));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let bus = EventBus::default();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let inner_bus = bus.clone();
        let inner_slot = Arc::clone(&slot);
        let id = bus.subscribe_all(move |_| {
            if let Some(id) = inner_slot.lock().unwrap().take() {
                inner_bus.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        bus.publish(recovered(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stream_receives_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.stream();

        bus.publish(recovered(3));

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, WorkflowEvent::RecoveryCompleted { recovered: 3 }));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        for i in 0..10 {
            bus.publish(recovered(i));
        }
    }

    #[test]
    fn debug_impl() {
        let bus = EventBus::default();
        let _rx = bus.stream();
        let debug = format!("{bus:?}");
        assert!(debug.contains("EventBus"));
        assert!(debug.contains("receiver_count"));
    }
}
