//! Event bus with a dedicated dispatcher worker
//!
//! `publish` enqueues onto a bounded queue and returns immediately; a
//! single dispatcher task drains the queue and invokes listeners. The
//! single-task design delivers events in publish order per listener,
//! which yields per-key mutation order. When the queue is full the
//! event is dropped and counted, never blocking the mutating caller.

use crate::event::{EntryEvent, EntryListener};
use dashmap::DashMap;
use keygrid_common::MapName;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier of one listener registration
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Predicate = dyn Fn(&EntryEvent) -> bool + Send + Sync;

struct Subscription {
    map: MapName,
    predicate: Option<Box<Predicate>>,
    listener: Arc<dyn EntryListener>,
}

/// Change notification bus
///
/// Create one per node (or per map); must be constructed inside a Tokio
/// runtime, which hosts the dispatcher worker.
pub struct EventBus {
    subscriptions: Arc<DashMap<SubscriptionId, Subscription>>,
    sender: Mutex<Option<mpsc::Sender<EntryEvent>>>,
    dropped: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create a bus and spawn its dispatcher worker
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<EntryEvent>(queue_capacity);
        let subscriptions: Arc<DashMap<SubscriptionId, Subscription>> = Arc::new(DashMap::new());

        let dispatch_subs = Arc::clone(&subscriptions);
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                // Snapshot matching listeners so a listener touching the
                // registry never contends with the iteration.
                let targets: Vec<(SubscriptionId, Arc<dyn EntryListener>)> = dispatch_subs
                    .iter()
                    .filter(|sub| {
                        sub.map == event.map
                            && sub.predicate.as_ref().is_none_or(|p| p(&event))
                    })
                    .map(|sub| (*sub.key(), Arc::clone(&sub.listener)))
                    .collect();

                for (id, listener) in targets {
                    if let Err(err) = listener.on_event(&event) {
                        warn!("Listener {} failed on {} event: {}", id, event.kind, err);
                    }
                }
            }
            debug!("Event dispatcher stopped");
        });

        Self {
            subscriptions,
            sender: Mutex::new(Some(sender)),
            dropped: AtomicU64::new(0),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a listener for every event of a map
    pub fn subscribe(&self, map: MapName, listener: Arc<dyn EntryListener>) -> SubscriptionId {
        self.register(Subscription {
            map,
            predicate: None,
            listener,
        })
    }

    /// Register a listener with a predicate evaluated on the dispatcher
    pub fn subscribe_filtered(
        &self,
        map: MapName,
        predicate: impl Fn(&EntryEvent) -> bool + Send + Sync + 'static,
        listener: Arc<dyn EntryListener>,
    ) -> SubscriptionId {
        self.register(Subscription {
            map,
            predicate: Some(Box::new(predicate)),
            listener,
        })
    }

    fn register(&self, subscription: Subscription) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.subscriptions.insert(id, subscription);
        id
    }

    /// Remove a registration; returns false if it was not known
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Number of live registrations
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Publish an event; never blocks
    ///
    /// Dropped when the queue is full or the bus is closed.
    pub fn publish(&self, event: EntryEvent) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = sender.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Event queue full, dropped {} event for map {} ({} dropped total)",
                event.kind, event.map, dropped
            );
        }
    }

    /// Events dropped because the queue was full
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the dispatcher after draining already-queued events
    pub async fn close(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, ListenerError};
    use keygrid_common::{Key, Value};
    use parking_lot::Mutex as PlMutex;

    struct Recording {
        seen: PlMutex<Vec<(EventKind, Option<Key>)>>,
        notify: mpsc::UnboundedSender<()>,
    }

    impl Recording {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
            let (notify, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    seen: PlMutex::new(Vec::new()),
                    notify,
                }),
                rx,
            )
        }
    }

    impl EntryListener for Recording {
        fn on_event(&self, event: &EntryEvent) -> Result<(), ListenerError> {
            self.seen.lock().push((event.kind, event.key.clone()));
            let _ = self.notify.send(());
            Ok(())
        }
    }

    struct Failing;

    impl EntryListener for Failing {
        fn on_event(&self, _event: &EntryEvent) -> Result<(), ListenerError> {
            Err(ListenerError::new("boom"))
        }
    }

    fn map() -> MapName {
        MapName::new_unchecked("cities")
    }

    #[tokio::test]
    async fn test_events_delivered_in_publish_order() {
        let bus = EventBus::new(64);
        let (listener, mut rx) = Recording::new();
        let _ = bus.subscribe(map(), listener.clone());

        bus.publish(EntryEvent::added(map(), Key::from("k"), Value::from("1")));
        bus.publish(EntryEvent::updated(
            map(),
            Key::from("k"),
            Value::from("1"),
            Value::from("2"),
        ));
        bus.publish(EntryEvent::removed(map(), Key::from("k"), Some(Value::from("2"))));

        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        let seen = listener.seen.lock();
        let kinds: Vec<EventKind> = seen.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Added, EventKind::Updated, EventKind::Removed]
        );
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stall_others() {
        let bus = EventBus::new(64);
        let _ = bus.subscribe(map(), Arc::new(Failing));
        let (listener, mut rx) = Recording::new();
        let _ = bus.subscribe(map(), listener.clone());

        bus.publish(EntryEvent::added(map(), Key::from("k"), Value::from("v")));

        rx.recv().await.unwrap();
        assert_eq!(listener.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_predicate_filters_on_dispatcher() {
        let bus = EventBus::new(64);
        let (listener, mut rx) = Recording::new();
        let _ = bus.subscribe_filtered(
            map(),
            |event| event.kind == EventKind::Removed,
            listener.clone(),
        );

        bus.publish(EntryEvent::added(map(), Key::from("a"), Value::from("1")));
        bus.publish(EntryEvent::removed(map(), Key::from("a"), Some(Value::from("1"))));

        rx.recv().await.unwrap();
        let seen = listener.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, EventKind::Removed);
    }

    #[tokio::test]
    async fn test_other_map_events_not_delivered() {
        let bus = EventBus::new(64);
        let (listener, mut rx) = Recording::new();
        let _ = bus.subscribe(map(), listener.clone());

        bus.publish(EntryEvent::added(
            MapName::new_unchecked("other"),
            Key::from("a"),
            Value::from("1"),
        ));
        bus.publish(EntryEvent::added(map(), Key::from("b"), Value::from("2")));

        rx.recv().await.unwrap();
        let seen = listener.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, Some(Key::from("b")));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new(64);
        let (listener, mut rx) = Recording::new();
        let id = bus.subscribe(map(), listener.clone());

        bus.publish(EntryEvent::added(map(), Key::from("a"), Value::from("1")));
        rx.recv().await.unwrap();

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(EntryEvent::added(map(), Key::from("b"), Value::from("2")));
        bus.close().await;

        assert_eq!(listener.seen.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overflow_drops_instead_of_blocking() {
        let bus = EventBus::new(1);

        // Gate the dispatcher inside the first delivery so the queue
        // stays occupied while we overflow it.
        struct Gated {
            entered: mpsc::UnboundedSender<()>,
            release: PlMutex<Option<std::sync::mpsc::Receiver<()>>>,
        }
        impl EntryListener for Gated {
            fn on_event(&self, _event: &EntryEvent) -> Result<(), ListenerError> {
                let _ = self.entered.send(());
                if let Some(release) = self.release.lock().take() {
                    let _ = release.recv();
                }
                Ok(())
            }
        }

        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let _ = bus.subscribe(
            map(),
            Arc::new(Gated {
                entered: entered_tx,
                release: PlMutex::new(Some(release_rx)),
            }),
        );

        bus.publish(EntryEvent::added(map(), Key::from("a"), Value::from("1")));
        entered_rx.recv().await.unwrap();

        // Dispatcher is busy with the first event: one more fits the
        // queue, the next overflows.
        bus.publish(EntryEvent::added(map(), Key::from("b"), Value::from("2")));
        bus.publish(EntryEvent::added(map(), Key::from("c"), Value::from("3")));
        assert_eq!(bus.dropped_total(), 1);

        release_tx.send(()).unwrap();
        bus.close().await;
    }
}
