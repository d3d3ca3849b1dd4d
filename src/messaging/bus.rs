use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Callback function type for event handling
pub type EventCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscribers<T> {
    next_id: u64,
    callbacks: Vec<(u64, EventCallback<T>)>,
}

/// In-process typed publish/subscribe channel.
///
/// Every service owns the buses it publishes on; listeners register through
/// the service's `on_*` methods and get a [`Subscription`] back.
pub struct EventBus<T> {
    inner: Arc<Mutex<Subscribers<T>>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subscribers {
                next_id: 1,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register a callback. It stays registered until the returned handle is
    /// passed to [`Subscription::unsubscribe`].
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut subscribers = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.callbacks.push((id, Arc::new(callback)));

        let bus: Weak<dyn Detach> = Arc::downgrade(&self.inner) as Weak<dyn Detach>;
        Subscription { id, bus }
    }

    /// Deliver an event to every current subscriber, in subscription order.
    pub fn publish(&self, event: &T) {
        // Snapshot so callbacks may subscribe or unsubscribe without deadlocking.
        let callbacks: Vec<EventCallback<T>> = {
            let subscribers = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            subscribers.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
        };

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .clear();
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

impl<T: 'static> Detach for Mutex<Subscribers<T>> {
    fn detach(&self, id: u64) -> bool {
        let mut subscribers = self.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.callbacks.len();
        subscribers.callbacks.retain(|(sub_id, _)| *sub_id != id);
        subscribers.callbacks.len() != before
    }
}

/// Handle for a registered callback.
///
/// Dropping the handle does not unsubscribe; listeners that live as long as
/// the bus may simply discard it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    bus: Weak<dyn Detach>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the callback. Returns false when the bus is gone or the
    /// callback was already removed by `clear`.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.detach(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
