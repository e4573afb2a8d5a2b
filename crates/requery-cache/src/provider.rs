use moka::sync::Cache;

/// The storage backend of a [`CacheStore`](crate::CacheStore).
///
/// Implementations only need to be a plain key-value map. Expiration timers, change detection and
/// invalidation events are all handled by the store on top of it. Errors in a provider are not
/// guarded against and propagate straight to whoever triggered the store operation.
pub trait CacheProvider<V>: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Option<V>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: V);

    /// Removes the value stored under `key`, if any.
    fn delete(&self, key: &str);

    /// Returns all keys currently in the store.
    fn keys(&self) -> Vec<String>;
}

/// The default in-memory [`CacheProvider`], backed by a [`moka`] cache.
///
/// Without a capacity the cache is unbounded and entries only go away through the expiration
/// timers of the store. With a capacity, moka may evict entries on its own, which does not emit
/// any invalidation event.
#[derive(Clone)]
pub struct MemoryProvider<V> {
    cache: Cache<String, V>,
}

impl<V> std::fmt::Debug for MemoryProvider<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> MemoryProvider<V> {
    /// Creates an unbounded in-memory provider.
    pub fn new() -> Self {
        Self {
            cache: Cache::builder().name("requery").build(),
        }
    }

    /// Creates an in-memory provider holding at most `capacity` entries.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .name("requery")
                .max_capacity(capacity)
                .build(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for MemoryProvider<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> CacheProvider<V> for MemoryProvider<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key)
    }

    fn set(&self, key: &str, value: V) {
        self.cache.insert(key.to_owned(), value);
    }

    fn delete(&self, key: &str) {
        self.cache.invalidate(key);
    }

    fn keys(&self) -> Vec<String> {
        self.cache.iter().map(|(key, _)| String::clone(&key)).collect()
    }
}
