//! Ordered publish/subscribe feed.
//!
//! Every value published is delivered, in publish order, to each subscriber
//! registered at publish time. Late subscribers see no replay. Dropping a
//! [`Subscription`] unsubscribes it.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

type Subscribers<T> = Mutex<(u64, BTreeMap<u64, mpsc::UnboundedSender<T>>)>;

/// Publisher side of an event feed.
pub struct Feed<T> {
    subscribers: Arc<Subscribers<T>>,
}

impl<T: Clone> Feed<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new((0, BTreeMap::new()))),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.subscribers.lock();
        let id = guard.0;
        guard.0 += 1;
        guard.1.insert(id, tx);
        Subscription {
            id,
            rx,
            feed: Arc::downgrade(&self.subscribers),
        }
    }

    /// Deliver `value` to every current subscriber. Returns the number reached.
    pub fn publish(&self, value: T) -> usize {
        // Holding the lock for the whole fan-out keeps concurrent publishes
        // in one global order for every subscriber.
        let mut guard = self.subscribers.lock();
        guard.1.retain(|_, tx| tx.send(value.clone()).is_ok());
        guard.1.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().1.len()
    }
}

impl<T: Clone> Default for Feed<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a feed.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    feed: Weak<Subscribers<T>>,
}

impl<T> Subscription<T> {
    /// Wait for the next value. `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next value if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Explicitly stop receiving.
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(subscribers) = self.feed.upgrade() {
            subscribers.lock().1.remove(&self.id);
        }
    }
}
