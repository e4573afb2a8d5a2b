use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::events::{KeyedListeners, Subscription};
use crate::provider::{CacheProvider, MemoryProvider};

/// The default time after which a cache entry is dropped: 5 minutes.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(5 * 60);

/// A value stored in the [`CacheStore`], together with the parameters that produced it.
#[derive(Clone, Debug)]
pub struct CachedData<T, P> {
    /// The last successfully resolved value.
    pub data: T,
    /// The parameters used to produce [`data`](Self::data).
    pub params: P,
    /// When this entry was written.
    pub updated_at: Instant,
}

impl<T, P> CachedData<T, P> {
    fn new(data: T, params: P) -> Self {
        Self {
            data,
            params,
            updated_at: Instant::now(),
        }
    }

    /// How long ago this entry was written.
    pub fn age(&self) -> Duration {
        self.updated_at.elapsed()
    }
}

/// A custom equality check for cached values, see [`CacheStore::with_comparator`].
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Configuration of a [`CacheStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// How long an entry lives after its last write, or `None` to keep entries forever.
    ///
    /// Defaults to [`DEFAULT_EXPIRATION`].
    pub expiration: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiration: Some(DEFAULT_EXPIRATION),
        }
    }
}

/// Selects the keys a [`CacheStore::mutate`] applies to.
pub enum KeyFilter<'a> {
    /// Exactly these keys, whether they currently have an entry or not.
    Keys(&'a [&'a str]),
    /// Every existing key matching the predicate.
    Matching(&'a dyn Fn(&str) -> bool),
}

/// The change a [`CacheStore::mutate`] applies to each selected key.
pub enum Mutation<'a, T, P> {
    /// Replaces both value and parameters.
    Replace(T, P),
    /// Replaces the value and keeps the parameters. Keys without an entry are left alone.
    Data(T),
    /// Computes the next entry from the previous one. Returning `None` deletes the entry.
    Update(&'a mut dyn FnMut(&str, Option<&CachedData<T, P>>) -> Option<(T, P)>),
    /// Deletes the entry.
    Clear,
}

type Event<T, P> = Option<CachedData<T, P>>;

struct Timer {
    id: u64,
    handle: AbortHandle,
}

struct StoreInner<T, P> {
    provider: Box<dyn CacheProvider<CachedData<T, P>>>,
    config: CacheConfig,
    comparator: Option<Comparator<T>>,
    /// Expiration timers by key.
    ///
    /// This lock also serializes all writes, so that the read-compare-write in
    /// [`CacheStore::set_cache`] and the timer bookkeeping stay consistent.
    timers: Mutex<HashMap<String, Timer>>,
    next_timer: AtomicU64,
    listeners: KeyedListeners<Event<T, P>>,
}

impl<T, P> Drop for StoreInner<T, P> {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
    }
}

/// A keyed store of query results, shared by all queries that should see each other's data.
///
/// Cloning a `CacheStore` is cheap and yields a handle to the same store. Every write re-arms the
/// per-key expiration timer, and every observable change emits an invalidation event to the
/// listeners registered with [`subscribe`](Self::subscribe) for that key.
///
/// Expiration timers are spawned on the ambient Tokio runtime. When used outside of a runtime,
/// entries do not expire.
pub struct CacheStore<T, P> {
    inner: Arc<StoreInner<T, P>>,
}

impl<T, P> Clone for CacheStore<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, P> std::fmt::Debug for CacheStore<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let timers = self
            .inner
            .timers
            .try_lock()
            .map(|t| t.len())
            .unwrap_or_default();
        f.debug_struct("CacheStore")
            .field("config", &self.inner.config)
            .field("keys", &self.inner.provider.keys().len())
            .field("running timers", &timers)
            .finish()
    }
}

impl<T, P> Default for CacheStore<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P> CacheStore<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates an in-memory store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Creates an in-memory store with the given configuration.
    pub fn with_config(config: CacheConfig) -> Self {
        Self::with_provider(MemoryProvider::new(), config)
    }

    /// Creates a store on top of a custom [`CacheProvider`].
    pub fn with_provider<C>(provider: C, config: CacheConfig) -> Self
    where
        C: CacheProvider<CachedData<T, P>> + 'static,
    {
        Self {
            inner: Arc::new(StoreInner {
                provider: Box::new(provider),
                config,
                comparator: None,
                timers: Default::default(),
                next_timer: Default::default(),
                listeners: Default::default(),
            }),
        }
    }

    /// Overrides the equality check that decides whether a write changed the value.
    ///
    /// # Panics
    ///
    /// Panics if the store has already been cloned.
    pub fn with_comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("comparator must be configured before the store is shared");
        inner.comparator = Some(Arc::new(comparator));
        self
    }

    /// The configuration of this store.
    pub fn config(&self) -> CacheConfig {
        self.inner.config
    }

    /// Returns the entry stored under `key`.
    pub fn get_cache(&self, key: &str) -> Option<CachedData<T, P>> {
        self.inner.provider.get(key)
    }

    /// Returns all keys that currently have an entry.
    pub fn keys(&self) -> Vec<String> {
        self.inner.provider.keys()
    }

    /// Writes `data` and `params` under `key` using the configured expiration.
    ///
    /// See [`set_cache_with_expiration`](Self::set_cache_with_expiration).
    pub fn set_cache(&self, key: &str, data: T, params: P) -> bool {
        self.set_cache_with_expiration(key, data, params, self.inner.config.expiration)
    }

    /// Writes `data` and `params` under `key`.
    ///
    /// If both are equal to the current entry this does nothing at all and returns `false`.
    /// Otherwise the entry is replaced, the expiration timer re-armed, and an invalidation event
    /// is emitted if the value (as judged by the comparator) or the parameters changed.
    /// Returns `true` if the entry was written.
    pub fn set_cache_with_expiration(
        &self,
        key: &str,
        data: T,
        params: P,
        expiration: Option<Duration>,
    ) -> bool {
        let inner = &self.inner;
        let event = {
            let mut timers = inner.timers.lock().unwrap();
            let current = inner.provider.get(key);

            if let Some(current) = &current {
                if current.data == data && current.params == params {
                    return false;
                }
            }

            let changed = match &current {
                None => true,
                Some(current) => {
                    !inner.values_equal(&current.data, &data) || current.params != params
                }
            };

            let entry = CachedData::new(data, params);
            inner.provider.set(key, entry.clone());
            inner.arm_timer(&mut timers, key, expiration);

            changed.then_some(entry)
        };

        if let Some(entry) = event {
            inner.listeners.emit(key, &Some(entry));
        }
        true
    }

    /// Applies `mutation` to every key selected by `filter`.
    ///
    /// Unlike [`set_cache`](Self::set_cache), an explicit mutation always notifies the listeners
    /// of every touched key, even if nothing changed. Returns the touched keys.
    pub fn mutate(&self, filter: KeyFilter<'_>, mut mutation: Mutation<'_, T, P>) -> Vec<String> {
        let inner = &self.inner;
        let mut events = vec![];
        {
            let mut timers = inner.timers.lock().unwrap();
            let keys: Vec<String> = match filter {
                KeyFilter::Keys(keys) => keys.iter().map(|key| (*key).to_owned()).collect(),
                KeyFilter::Matching(predicate) => inner
                    .provider
                    .keys()
                    .into_iter()
                    .filter(|key| predicate(key))
                    .collect(),
            };

            for key in keys {
                let previous = inner.provider.get(&key);
                let next = match &mut mutation {
                    Mutation::Replace(data, params) => Some((data.clone(), params.clone())),
                    Mutation::Data(data) => match &previous {
                        Some(previous) => Some((data.clone(), previous.params.clone())),
                        None => continue,
                    },
                    Mutation::Update(update) => update(&key, previous.as_ref()),
                    Mutation::Clear => None,
                };

                let event = match next {
                    Some((data, params)) => {
                        let entry = CachedData::new(data, params);
                        inner.provider.set(&key, entry.clone());
                        inner.arm_timer(&mut timers, &key, inner.config.expiration);
                        Some(entry)
                    }
                    None => {
                        inner.provider.delete(&key);
                        inner.disarm_timer(&mut timers, &key);
                        None
                    }
                };
                events.push((key, event));
            }
        }

        for (key, event) in &events {
            inner.listeners.emit(key, event);
        }
        events.into_iter().map(|(key, _)| key).collect()
    }

    /// Deletes the given keys, or every key if `keys` is `None`.
    ///
    /// Listeners are notified for each key that actually had an entry.
    pub fn clear_cache(&self, keys: Option<&[&str]>) {
        let inner = &self.inner;
        let cleared: Vec<String> = {
            let mut timers = inner.timers.lock().unwrap();
            let keys = match keys {
                Some(keys) => keys.iter().map(|key| (*key).to_owned()).collect(),
                None => inner.provider.keys(),
            };
            keys.into_iter()
                .filter(|key| {
                    let existed = inner.provider.get(key).is_some();
                    inner.provider.delete(key);
                    inner.disarm_timer(&mut timers, key);
                    existed
                })
                .collect()
        };

        tracing::debug!(count = cleared.len(), "Cleared cache entries");
        for key in &cleared {
            inner.listeners.emit(key, &None);
        }
    }

    /// Registers a listener for invalidation events of `key`.
    ///
    /// The listener receives the new entry, or `None` if the entry was deleted or expired.
    /// Events are delivered synchronously, before the operation that caused them returns.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn(Option<&CachedData<T, P>>) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .subscribe(key, move |event: &Event<T, P>| listener(event.as_ref()))
    }
}

impl<T, P> StoreInner<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    fn values_equal(&self, a: &T, b: &T) -> bool {
        match &self.comparator {
            Some(comparator) => comparator(a, b),
            None => a == b,
        }
    }

    fn disarm_timer(&self, timers: &mut HashMap<String, Timer>, key: &str) {
        if let Some(timer) = timers.remove(key) {
            timer.handle.abort();
        }
    }

    fn arm_timer(
        self: &Arc<Self>,
        timers: &mut HashMap<String, Timer>,
        key: &str,
        expiration: Option<Duration>,
    ) {
        self.disarm_timer(timers, key);
        let Some(expiration) = expiration else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key, "No runtime available, cache entry will not expire");
            return;
        };

        let id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let store = Arc::downgrade(self);
        let owned_key = key.to_owned();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(expiration).await;
            expire(store, &owned_key, id);
        });

        timers.insert(
            key.to_owned(),
            Timer {
                id,
                handle: handle.abort_handle(),
            },
        );
    }
}

/// Deletes the entry for `key` if the timer `id` is still the one armed for it.
fn expire<T: 'static, P: 'static>(store: Weak<StoreInner<T, P>>, key: &str, id: u64) {
    let Some(store) = store.upgrade() else {
        return;
    };

    let expired = {
        let mut timers = store.timers.lock().unwrap();
        match timers.get(key) {
            Some(timer) if timer.id == id => {
                timers.remove(key);
                store.provider.delete(key);
                true
            }
            _ => false,
        }
    };

    if expired {
        tracing::trace!(key, "Cache entry expired");
        store.listeners.emit(key, &None);
    }
}
