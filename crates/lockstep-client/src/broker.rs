//! Typed multi-subscriber fan-out.
//!
//! Handlers are invoked in subscription order; the list is snapshotted before
//! each notification so a handler may unsubscribe (itself or anyone else)
//! mid-notify without disturbing the rest.  The unsubscribe handle holds only
//! a weak reference to the subscriber list, so handles never keep a broker
//! alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    handler: Handler<T>,
}

pub struct Broker<T> {
    subscribers: Arc<Mutex<Vec<Entry<T>>>>,
    next_id: AtomicU64,
}

impl<T> Broker<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Append `handler`; the returned handle removes it again.
    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription
    where
        T: 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push(Entry {
            id,
            handler: Arc::new(handler),
        });

        let subscribers = Arc::downgrade(&self.subscribers);
        Subscription {
            cancel: Box::new(move || {
                if let Some(subscribers) = Weak::upgrade(&subscribers) {
                    subscribers.lock().unwrap().retain(|entry| entry.id != id);
                }
            }),
        }
    }

    /// Invoke every current subscriber with `message`, in subscription order.
    pub fn notify(&self, message: &T) {
        let snapshot: Vec<Handler<T>> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|entry| Arc::clone(&entry.handler))
            .collect();
        for handler in snapshot {
            handler(message);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl<T> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Broker::subscribe`].  Unsubscribing twice, or after
/// the broker is gone, is a no-op.
pub struct Subscription {
    cancel: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        (self.cancel)();
    }
}
