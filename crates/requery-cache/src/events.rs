use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Unregisters a listener when dropped.
///
/// This is the handle returned by all the `subscribe` style functions of this crate. Keep it alive
/// for as long as events should be delivered.
#[must_use = "dropping a `Subscription` immediately unregisters the listener"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Creates a new `Subscription` running `f` on drop.
    pub fn new<F: FnOnce() + Send + Sync + 'static>(f: F) -> Self {
        Self {
            unsubscribe: Some(Box::new(f)),
        }
    }

    /// A `Subscription` that does nothing when dropped.
    pub fn noop() -> Self {
        Self { unsubscribe: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// An ordered set of listeners for a single event source.
pub struct ListenerSet<E> {
    next_id: Arc<AtomicU64>,
    listeners: Arc<Mutex<Vec<(u64, Listener<E>)>>>,
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            next_id: Default::default(),
            listeners: Default::default(),
        }
    }
}

impl<E: 'static> ListenerSet<E> {
    /// Registers a new listener, which is called for every [`emit`](Self::emit) until the
    /// returned [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));

        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().unwrap().retain(|(other, _)| *other != id);
            }
        })
    }

    /// Calls all registered listeners in registration order.
    ///
    /// Listeners are invoked after the internal lock has been released, so they are free to
    /// subscribe or unsubscribe themselves.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    /// The number of currently registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Listeners grouped by a string key.
///
/// Emission for one key is synchronous and follows registration order. There is no ordering
/// relation between different keys.
pub struct KeyedListeners<E> {
    next_id: AtomicU64,
    listeners: Arc<Mutex<HashMap<String, Vec<(u64, Listener<E>)>>>>,
}

impl<E> Default for KeyedListeners<E> {
    fn default() -> Self {
        Self {
            next_id: Default::default(),
            listeners: Default::default(),
        }
    }
}

impl<E: 'static> KeyedListeners<E> {
    /// Registers a listener for `key`.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_default()
            .push((id, Arc::new(listener)));

        let listeners = Arc::downgrade(&self.listeners);
        let key = key.to_owned();
        Subscription::new(move || {
            let Some(listeners) = listeners.upgrade() else {
                return;
            };
            let mut listeners = listeners.lock().unwrap();
            if let Some(for_key) = listeners.get_mut(&key) {
                for_key.retain(|(other, _)| *other != id);
                if for_key.is_empty() {
                    listeners.remove(&key);
                }
            }
        })
    }

    /// Calls every listener registered for `key`.
    pub fn emit(&self, key: &str, event: &E) {
        let listeners: Vec<_> = match self.listeners.lock().unwrap().get(key) {
            Some(for_key) => for_key.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };

        tracing::trace!(key, listeners = listeners.len(), "Emitting invalidation");
        for listener in listeners {
            listener(event);
        }
    }

    /// The number of listeners registered for `key`.
    pub fn listener_count(&self, key: &str) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, Vec::len)
    }
}
