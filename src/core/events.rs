//! Per-topic broadcast of rule changes
//!
//! Each subscriber owns a bounded FIFO queue. Publishing never waits: when a
//! subscriber's queue is full the event is dropped for that subscriber only,
//! so a slow consumer can never stall the rule engine.
//!
//! The registry maps `topic -> id -> queue sender` behind a single
//! reader/writer lock. A topic key is removed as soon as its last subscriber
//! leaves. Removing a sender from the registry is what closes the queue, so it
//! happens exactly once per subscription.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Queue depth per subscriber
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Add,
    Delete,
}

/// One rule change, as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: String,
    pub kind: ChangeKind,
    pub rule_key: String,
}

impl ChangeEvent {
    pub fn new(topic: impl Into<String>, kind: ChangeKind, rule_key: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            kind,
            rule_key: rule_key.into(),
        }
    }
}

type Registry = HashMap<String, HashMap<u64, mpsc::Sender<ChangeEvent>>>;

#[derive(Debug)]
struct HubInner {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

impl HubInner {
    fn unsubscribe(&self, topic: &str, id: u64) -> bool {
        let mut registry = self.registry.write();
        let Some(subscribers) = registry.get_mut(topic) else {
            return false;
        };
        // Dropping the sender closes the queue.
        let removed = subscribers.remove(&id).is_some();
        if subscribers.is_empty() {
            registry.remove(topic);
        }
        if removed {
            debug!("subscriber {id} left topic '{topic}'");
        }
        removed
    }
}

/// Multi-subscriber event broadcaster
///
/// Cloning is cheap and every clone shares one registry.
#[derive(Debug, Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a hub whose subscriber queues hold `capacity` events (min 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Registers a new subscriber on `topic`.
    ///
    /// After [`shutdown`](Self::shutdown) the returned subscription is already
    /// closed and yields nothing.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        {
            let mut registry = self.inner.registry.write();
            if self.inner.closed.load(Ordering::Acquire) {
                drop(tx);
            } else {
                registry
                    .entry(topic.to_string())
                    .or_default()
                    .insert(id, tx);
            }
        }
        debug!("subscriber {id} joined topic '{topic}'");

        Subscription {
            id,
            topic: topic.to_string(),
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Offers `event` to every subscriber of its topic without blocking.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let registry = self.inner.registry.read();
        let Some(subscribers) = registry.get(&event.topic) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, tx) in subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!("subscriber {id} queue full, dropping {} event", event.kind);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Removes subscriber `id` from `topic`. Unknown ids are a no-op.
    pub fn unsubscribe(&self, topic: &str, id: u64) -> bool {
        self.inner.unsubscribe(topic, id)
    }

    /// Closes every queue and refuses new registrations.
    pub fn shutdown(&self) {
        let mut registry = self.inner.registry.write();
        self.inner.closed.store(true, Ordering::Release);
        let count: usize = registry.values().map(HashMap::len).sum();
        registry.clear();
        info!("event hub shut down, closed {count} subscriptions");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .registry
            .read()
            .get(topic)
            .map_or(0, HashMap::len)
    }

    pub fn topic_count(&self) -> usize {
        self.inner.registry.read().len()
    }
}

/// Receiving end of one registration
///
/// Dropping it unregisters from the hub.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: String,
    rx: mpsc::Receiver<ChangeEvent>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next event. `None` once the hub closed the queue and it
    /// has been drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Like [`recv`](Self::recv) but gives up as soon as `cancel` fires.
    pub async fn recv_until(&mut self, cancel: &CancellationToken) -> Option<ChangeEvent> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Returns a queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&self.topic, self.id);
        }
    }
}
