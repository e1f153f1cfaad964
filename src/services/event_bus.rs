//! In-process fan-out of spot status changes
//!
//! Every subscriber owns a bounded channel. `publish` offers each event to
//! every channel without waiting; a subscriber whose channel is full or whose
//! receiver is gone is removed from the registry, which closes its channel.
//! A stalled consumer therefore costs the publisher nothing beyond one
//! failed `try_send`, and the consumer learns it was dropped when `recv`
//! returns `None`.
//!
//! Publishing takes only the read lock, so camera workers on different
//! threads fan out concurrently. Subscribe and unsubscribe take the write
//! lock briefly and never touch the other subscribers' channels.

use crate::domain::types::StatusChangeEvent;
use crate::infra::metrics::Metrics;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default per-subscriber channel capacity
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

struct Subscriber {
    name: String,
    tx: mpsc::Sender<StatusChangeEvent>,
}

struct BusInner {
    subscribers: RwLock<FxHashMap<Uuid, Subscriber>>,
    buffer: usize,
    metrics: Arc<Metrics>,
}

/// Cloneable handle to the shared bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(buffer: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(FxHashMap::default()),
                buffer: buffer.max(1),
                metrics,
            }),
        }
    }

    /// Register a subscriber. Only events published after this call are seen.
    pub fn subscribe(&self, name: &str) -> Subscription {
        let id = Uuid::now_v7();
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let count = {
            let mut subscribers = self.inner.subscribers.write();
            subscribers.insert(id, Subscriber { name: name.to_string(), tx });
            subscribers.len()
        };
        self.inner.metrics.set_subscribers_active(count);
        info!(subscriber = %name, subscriber_id = %id, subscribers = %count, "bus_subscribed");

        Subscription { id, rx, bus: self.clone() }
    }

    /// Remove a subscriber; no-op if it was already dropped
    pub fn unsubscribe(&self, id: Uuid) {
        let (removed, count) = {
            let mut subscribers = self.inner.subscribers.write();
            let removed = subscribers.remove(&id);
            (removed, subscribers.len())
        };
        if let Some(sub) = removed {
            self.inner.metrics.set_subscribers_active(count);
            debug!(subscriber = %sub.name, subscriber_id = %id, "bus_unsubscribed");
        }
    }

    /// Offer an event to every current subscriber.
    ///
    /// Never blocks. Returns the number of subscribers that accepted it.
    pub fn publish(&self, event: StatusChangeEvent) -> usize {
        self.inner.metrics.record_event_published();

        let mut delivered = 0;
        let mut evicted: Vec<(Uuid, bool)> = Vec::new();
        {
            let subscribers = self.inner.subscribers.read();
            for (id, sub) in subscribers.iter() {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => evicted.push((*id, true)),
                    Err(TrySendError::Closed(_)) => evicted.push((*id, false)),
                }
            }
        }

        if !evicted.is_empty() {
            self.evict(&evicted);
        }
        delivered
    }

    fn evict(&self, evicted: &[(Uuid, bool)]) {
        let mut subscribers = self.inner.subscribers.write();
        for (id, full) in evicted {
            let Some(sub) = subscribers.remove(id) else {
                continue;
            };
            self.inner.metrics.record_subscriber_dropped();
            if *full {
                warn!(subscriber = %sub.name, subscriber_id = %id, "bus_subscriber_lagging_dropped");
            } else {
                debug!(subscriber = %sub.name, subscriber_id = %id, "bus_subscriber_closed");
            }
        }
        self.inner.metrics.set_subscribers_active(subscribers.len());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn is_subscribed(&self, id: Uuid) -> bool {
        self.inner.subscribers.read().contains_key(&id)
    }
}

/// Receiving end of one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<StatusChangeEvent>,
    bus: EventBus,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event in publish order; `None` once the bus has dropped us
    pub async fn recv(&mut self) -> Option<StatusChangeEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<StatusChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
