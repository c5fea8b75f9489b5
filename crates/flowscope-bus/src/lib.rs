//! Event bus
//!
//! Multiplexes the ordered flow-event stream to any number of subscribers.
//! Each subscriber owns a bounded ring; overflow drops the oldest queued
//! events and adds to that subscriber's drop counter. Delivery is
//! at-most-once, never acknowledged. Publishing never blocks.

use flowscope_core::events::FlowEvent;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Opaque subscriber handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Inner {
    sender: broadcast::Sender<FlowEvent>,
    active: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

/// Owned bus handle; clone freely, wire in at startup. Tests instantiate
/// their own.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(subscriber_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(subscriber_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                sender,
                active: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event to every live subscriber. Synchronous; full rings
    /// shed their oldest entries on the subscriber side.
    pub fn publish(&self, event: FlowEvent) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        // Err means no subscribers right now, which is fine.
        let _ = self.inner.sender.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .active
            .lock()
            .expect("subscriber table poisoned")
            .insert(id);
        Subscription {
            id: SubscriberId(id),
            receiver: self.inner.sender.subscribe(),
            dropped: 0,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Idempotent; unknown or already-removed handles are a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner
            .active
            .lock()
            .expect("subscriber table poisoned")
            .remove(&id.0);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .active
            .lock()
            .expect("subscriber table poisoned")
            .len()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// One subscriber's view of the stream.
pub struct Subscription {
    id: SubscriberId,
    receiver: broadcast::Receiver<FlowEvent>,
    dropped: u64,
    inner: Arc<Inner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Events shed from this subscriber's ring so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn is_active(&self) -> bool {
        self.inner
            .active
            .lock()
            .expect("subscriber table poisoned")
            .contains(&self.id.0)
    }

    /// Await the next event. Returns `None` once unsubscribed or the bus is
    /// gone.
    pub async fn recv(&mut self) -> Option<FlowEvent> {
        loop {
            if !self.is_active() {
                return None;
            }
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::debug!(
                        subscriber = self.id.0,
                        lagged = n,
                        "subscriber ring overflowed, oldest events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant; `None` when the ring is currently empty.
    pub fn try_recv(&mut self) -> Option<FlowEvent> {
        loop {
            if !self.is_active() {
                return None;
            }
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut active) = self.inner.active.lock() {
            active.remove(&self.id.0);
        }
    }
}
