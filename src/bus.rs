//! In-process typed publish/subscribe hub
//!
//! Each subscription owns a bounded `tokio::sync::mpsc` queue. Publishing
//! never blocks: when a subscriber's queue is full the event is dropped for
//! that subscriber and a warning is logged. Delivery to a single subscriber
//! follows publish order because fan-out happens under one lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{Event, EventKind};

/// Opaque subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

struct Subscriber {
    /// Empty means every kind
    kinds: HashSet<EventKind>,
    tx: mpsc::Sender<Event>,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

struct BusInner {
    capacity: usize,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Subscriber>> {
        // A panicking subscriber cannot leave the map half-updated.
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared event bus
///
/// Cheap to clone; all clones publish to the same subscriber set.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose subscriptions buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a filtered subscription
    ///
    /// An empty `kinds` slice subscribes to every event. The subscription is
    /// removed when the returned handle is dropped or passed to
    /// [`EventBus::unsubscribe`].
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = SubscriptionId(Uuid::new_v4());
        self.inner.lock().insert(
            id,
            Subscriber {
                kinds: kinds.iter().copied().collect(),
                tx,
            },
        );
        debug!(?kinds, "event bus subscription added");
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscription
    ///
    /// Returns `false` if it was already gone. Events already queued for it
    /// remain readable from its receiver.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.lock().remove(&id).is_some()
    }

    /// Fan an event out to every matching subscription
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let mut subscribers = self.inner.lock();
        let mut closed = Vec::new();
        for (id, subscriber) in subscribers.iter() {
            if !subscriber.wants(kind) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(event = %event, "event bus subscriber is full, dropping event");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            subscribers.remove(&id);
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Receiving end of a bus subscription
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<Event>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next matching event
    ///
    /// Returns `None` once the subscription was removed and its queue drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock().remove(&self.id);
        }
    }
}
