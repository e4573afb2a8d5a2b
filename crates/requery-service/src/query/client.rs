use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use futures::FutureExt;
use requery_cache::{
    CacheConfig, CacheStore, CachedData, InFlight, KeyFilter, MemoryProvider, Mutation,
    Subscription,
};

use super::{Fetcher, Query, QueryOptions};
use crate::config::CacheSettings;
use crate::error::QueryError;

/// The process-wide clients, one per pair of data and parameter types.
static GLOBAL_CLIENTS: OnceLock<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>> =
    OnceLock::new();

/// The shared state of all queries that should see each other's results.
///
/// A client bundles the [`CacheStore`] with the in-flight map that coalesces concurrent fetches
/// for the same cache key. Cloning is cheap and yields a handle to the same client.
///
/// Every query created with [`Query::new`] uses the process-wide [`global`](Self::global) client.
/// Separate clients are only needed to scope a cache, for example per test or per tenant.
pub struct QueryClient<T, P> {
    store: CacheStore<T, P>,
    inflight: Arc<InFlight<T, QueryError>>,
}

impl<T, P> Clone for QueryClient<T, P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<T, P> fmt::Debug for QueryClient<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("store", &self.store)
            .field("inflight", &self.inflight)
            .finish()
    }
}

impl<T, P> Default for QueryClient<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P> QueryClient<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    /// A client with an in-memory store and the default expiration.
    pub fn new() -> Self {
        Self::with_store(CacheStore::new())
    }

    /// The process-wide client for this pair of types.
    ///
    /// It is created lazily on first use, with an in-memory store and the default expiration, and
    /// lives for the rest of the process.
    pub fn global() -> Self {
        let registry = GLOBAL_CLIENTS.get_or_init(Default::default);
        let mut clients = registry.lock().unwrap();
        let client = clients.entry(TypeId::of::<Self>()).or_insert_with(|| {
            tracing::debug!("Creating global query client");
            Box::new(Self::new())
        });
        client
            .downcast_ref::<Self>()
            .expect("global clients are keyed by their own type")
            .clone()
    }

    /// A client on top of an existing store.
    pub fn with_store(store: CacheStore<T, P>) -> Self {
        Self {
            store,
            inflight: Default::default(),
        }
    }

    /// A client with an in-memory store configured from the `cache` section of the config file.
    pub fn from_config(settings: &CacheSettings) -> Self {
        let config = CacheConfig::from(*settings);
        let store = match settings.capacity {
            Some(capacity) => {
                CacheStore::with_provider(MemoryProvider::with_capacity(capacity), config)
            }
            None => CacheStore::with_config(config),
        };
        Self::with_store(store)
    }

    pub fn store(&self) -> &CacheStore<T, P> {
        &self.store
    }

    pub fn inflight(&self) -> &InFlight<T, QueryError> {
        &self.inflight
    }

    /// Creates a query that shares this client.
    pub fn query<F, Fut>(
        &self,
        fetcher: F,
        options: QueryOptions<T, P>,
    ) -> Result<Query<T, P>, QueryError>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let fetcher: Fetcher<T, P> = Arc::new(move |params: P| fetcher(params).boxed());
        Query::with_client(self.clone(), fetcher, options)
    }

    /// Applies `mutation` to all selected cache keys, notifying every query bound to them.
    pub fn mutate(&self, filter: KeyFilter<'_>, mutation: Mutation<'_, T, P>) -> Vec<String> {
        let touched = self.store.mutate(filter, mutation);
        tracing::debug!(keys = touched.len(), "Mutated cache entries");
        touched
    }

    /// Deletes the given keys, or everything if `keys` is `None`.
    pub fn clear_cache(&self, keys: Option<&[&str]>) {
        self.store.clear_cache(keys)
    }

    /// Registers a listener for changes of `key`, see [`CacheStore::subscribe`].
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn(Option<&CachedData<T, P>>) + Send + Sync + 'static,
    {
        self.store.subscribe(key, listener)
    }
}
