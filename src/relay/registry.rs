//! The set of live subscribers.
//!
//! Mutated by the connection tasks (register, peer close) and by the
//! broadcaster (write failure). Every mutation and every snapshot goes
//! through the same mutex, which is never held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::subscriber::{FrameSink, Subscriber, SubscriberId};

/// Upper bound on how long closing one connection may take.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Thread-safe set of active subscribers keyed by handle identity.
pub struct SubscriberRegistry<S> {
    subscribers: Mutex<HashMap<SubscriberId, Arc<Subscriber<S>>>>,
}

impl<S: FrameSink> SubscriberRegistry<S> {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(HashMap::new()) }
    }

    /// Register a subscriber. Returns `false` if it was already present.
    pub fn add(&self, subscriber: Arc<Subscriber<S>>) -> bool {
        let mut subscribers = self.subscribers.lock();
        if subscribers.contains_key(&subscriber.id()) {
            return false;
        }
        info!("🔌 Subscriber {} connected", subscriber);
        subscribers.insert(subscriber.id(), subscriber);
        debug!("Subscribers: {}", subscribers.len());
        true
    }

    /// Unregister a subscriber and close its connection.
    ///
    /// Returns `false` (and does nothing) if the id is not registered.
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let removed = {
            let mut subscribers = self.subscribers.lock();
            let removed = subscribers.remove(&id);
            if removed.is_some() {
                debug!("Subscribers: {}", subscribers.len());
            }
            removed
        };

        match removed {
            Some(subscriber) => {
                close_subscriber(&subscriber).await;
                info!("👋 Subscriber {} disconnected", subscriber);
                true
            }
            None => false,
        }
    }

    /// Unregister subscribers whose writes failed and close them in the background.
    ///
    /// Membership changes before this returns; each subscriber's token is
    /// cancelled immediately so its connection task stops reading. The close
    /// handshakes run on a spawned task and never hold up the caller.
    /// Returns the ids that were actually registered.
    pub fn evict(&self, ids: &[SubscriberId]) -> Vec<SubscriberId> {
        let evicted: Vec<_> = {
            let mut subscribers = self.subscribers.lock();
            let evicted: Vec<_> = ids.iter().filter_map(|id| subscribers.remove(id)).collect();
            if !evicted.is_empty() {
                debug!("Subscribers: {}", subscribers.len());
            }
            evicted
        };

        if evicted.is_empty() {
            return Vec::new();
        }

        for subscriber in &evicted {
            subscriber.cancelled_token().cancel();
        }

        let removed = evicted.iter().map(|s| s.id()).collect();
        tokio::spawn(async move {
            futures::future::join_all(evicted.iter().map(|s| async move {
                close_subscriber(s).await;
                info!("👋 Subscriber {} disconnected", s);
            }))
            .await;
        });
        removed
    }

    /// Consistent copy of the current membership for one broadcast cycle.
    pub fn snapshot(&self) -> Vec<Arc<Subscriber<S>>> {
        self.subscribers.lock().values().cloned().collect()
    }

    #[cfg(test)]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and close every subscriber. Used during shutdown.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.subscribers.lock().drain().map(|(_, s)| s).collect();
        let count = drained.len();

        futures::future::join_all(drained.iter().map(|s| close_subscriber(s))).await;

        if count > 0 {
            info!("Closed {} subscriber connection(s)", count);
        }
        count
    }
}

impl<S: FrameSink> Default for SubscriberRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

async fn close_subscriber<S: FrameSink>(subscriber: &Subscriber<S>) {
    if tokio::time::timeout(CLOSE_TIMEOUT, subscriber.close()).await.is_err() {
        warn!("Timed out closing subscriber {}", subscriber);
    }
}
