//! The request lifecycle controller.
//!
//! A [`Query`] wraps a fetcher, an async function from parameters to data, and tracks the state
//! of calling it: the latest data and error, whether a call is in progress, and which parameters
//! were used. On top of that it provides:
//!
//! - **Shared caching**: with a cache key, results are written to the [`CacheStore`] of the
//!   [`QueryClient`], and every query bound to the same key observes them. Concurrent fetches for
//!   the same key are coalesced into one.
//! - **Retries**: failed fetches are retried with backoff, see [`crate::retry`].
//! - **Generations**: every call mints a new [`Version`]. Only the latest call may change the
//!   state, so a slow, superseded call never overwrites the result of a newer one. Superseded
//!   results are not written to the cache either.
//! - **Revalidation**: refreshing on focus, reconnect, polling and dependency changes, all gated
//!   by the [`Environment`](crate::environment::Environment).
//! - **Rate limiting** of the imperative [`Query::run`] and [`Query::refresh`].
//!
//! The state is published through a [`watch`] channel. Dropping the last handle of a query tears
//! it down: calls in progress are discarded, and all timers and subscriptions are released. Its
//! entries in the shared cache stay around until they expire.

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::{BoxFuture, FutureExt};
use requery_cache::{CacheStore, CachedData, KeyFilter, Mutation, Subscription};
use rustc_hash::FxBuildHasher;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::QueryError;
use crate::ratelimit::RateLimit;
use crate::retry::{RetryCoordinator, RetryOptions, Version};

mod client;
mod options;
mod state;
mod triggers;

pub use client::*;
pub use options::*;
pub use state::*;

/// A type-erased fetcher.
pub type Fetcher<T, P> = Arc<dyn Fn(P) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// The subscription to the cache key a query is currently bound to.
struct KeyBinding {
    key: String,
    _subscription: Subscription,
}

struct QueryInner<T, P> {
    fetcher: Fetcher<T, P>,
    options: QueryOptions<T, P>,
    client: QueryClient<T, P>,
    runtime: Handle,
    retry: RetryCoordinator<QueryError>,
    limiter: Option<RateLimit<P>>,
    state: watch::Sender<QueryState<T, P>>,
    /// Automatic revalidation is enabled.
    active: AtomicBool,
    /// All handles are gone.
    closed: AtomicBool,
    /// The version of the call that was explicitly cancelled last.
    cancelled: Mutex<Option<Version>>,
    binding: Mutex<Option<KeyBinding>>,
    /// The in-flight computation the current call started or joined.
    flight: Mutex<Option<(String, u64)>>,
    slow_timer: Mutex<Option<AbortHandle>>,
    polling: Mutex<Option<AbortHandle>>,
    /// Environment listeners.
    subscriptions: Mutex<Vec<Subscription>>,
    last_focus: Mutex<Option<Instant>>,
    deps: Mutex<Option<u64>>,
}

/// Tears down the query once the last user handle is dropped.
///
/// Internal tasks hold on to the [`QueryInner`] directly, so they never keep a query alive that
/// nobody can observe anymore.
struct QueryHandle<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<QueryInner<T, P>>,
}

impl<T, P> Drop for QueryHandle<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

/// A query: a fetcher together with the state of calling it.
///
/// Cloning a `Query` is cheap and yields another handle to the same query.
pub struct Query<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    handle: Arc<QueryHandle<T, P>>,
}

impl<T, P> Clone for Query<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<T, P> fmt::Debug for Query<T, P>
where
    T: Clone + PartialEq + Send + Sync + fmt::Debug + 'static,
    P: Clone + PartialEq + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("Query")
            .field("options", &inner.options)
            .field("state", &*inner.state.borrow())
            .field("active", &inner.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T, P> Query<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates a query on the process-wide [`QueryClient::global`].
    ///
    /// All queries of the same types created this way share one cache, so a query with the same
    /// cache key as another one starts out with its data. Use [`QueryClient::query`] to scope
    /// the cache instead.
    ///
    /// This has to be called within a Tokio runtime.
    pub fn new<F, Fut>(fetcher: F, options: QueryOptions<T, P>) -> Result<Self, QueryError>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        QueryClient::global().query(fetcher, options)
    }

    pub(crate) fn with_client(
        client: QueryClient<T, P>,
        fetcher: Fetcher<T, P>,
        options: QueryOptions<T, P>,
    ) -> Result<Self, QueryError> {
        options.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            QueryError::Configuration("queries must be created within a Tokio runtime".into())
        })?;

        let inner = Arc::new_cyclic(|weak: &Weak<QueryInner<T, P>>| {
            let on_error = {
                let weak = weak.clone();
                move |err: &QueryError| {
                    if let Some(inner) = weak.upgrade() {
                        inner.attempt_failed(err);
                    }
                }
            };
            let retry = RetryCoordinator::new(RetryOptions {
                count: options.retry_count,
                interval: options.retry_interval.clone(),
                on_error: Some(Arc::new(on_error)),
                on_error_retry: options.callbacks.on_error_retry.clone(),
                on_retry_failed: options.callbacks.on_retry_failed.clone(),
            });

            let limiter = RateLimit::new(options.debounce, options.throttle, runtime.clone(), {
                let weak = weak.clone();
                move |params: P| {
                    if let Some(inner) = weak.upgrade() {
                        inner.spawn_run(params);
                    }
                }
            });

            QueryInner {
                fetcher,
                client,
                runtime,
                retry,
                limiter,
                state: watch::Sender::new(QueryState::default()),
                active: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                cancelled: Default::default(),
                binding: Default::default(),
                flight: Default::default(),
                slow_timer: Default::default(),
                polling: Default::default(),
                subscriptions: Default::default(),
                last_focus: Default::default(),
                deps: Default::default(),
                options,
            }
        });

        let initial_key = match (&inner.options.cache_key, &inner.options.default_params) {
            (Some(key), Some(params)) => Some(key.resolve(params)),
            (Some(key), None) => key.fixed().map(str::to_owned),
            (None, _) => None,
        };
        if let Some(key) = initial_key {
            inner.bind_key(Some(&key));
            if let Some(cached) = inner.client.store().get_cache(&key) {
                tracing::trace!(key = key.as_str(), "Starting with cached data");
                inner.state.send_modify(|state| {
                    state.data = Some(cached.data);
                    state.params = Some(cached.params);
                });
            }
        }

        inner.install_triggers();

        let query = Self {
            handle: Arc::new(QueryHandle { inner }),
        };
        if !query.inner().options.manual {
            if let Some(params) = query.inner().options.default_params.clone() {
                query.run(params);
            }
        }
        Ok(query)
    }

    fn inner(&self) -> &Arc<QueryInner<T, P>> {
        &self.handle.inner
    }

    /// Starts a call in the background.
    ///
    /// This goes through the configured debouncing and throttling. The outcome is only
    /// observable through the state and the callbacks.
    pub fn run(&self, params: P) {
        self.inner().run(params);
    }

    /// Calls the fetcher with `params` and waits for the outcome.
    ///
    /// This bypasses debouncing and throttling. Returns [`QueryError::Stale`] if another call
    /// started in the meantime, and [`QueryError::Cancelled`] if this call was cancelled. In both
    /// cases the state has not been touched by this call.
    pub async fn run_async(&self, params: P) -> Result<T, QueryError> {
        self.inner().run_async(params).await
    }

    /// Repeats the latest call in the background, see [`run`](Self::run).
    pub fn refresh(&self) {
        match self.inner().last_params() {
            Some(params) => self.run(params),
            None => tracing::debug!("Nothing to refresh yet"),
        }
    }

    /// Repeats the latest call and waits for the outcome, see [`run_async`](Self::run_async).
    pub async fn refresh_async(&self) -> Result<T, QueryError> {
        let params = self.inner().last_params().ok_or_else(|| {
            QueryError::Configuration("refreshed a query that has never run".into())
        })?;
        self.run_async(params).await
    }

    /// Refreshes with different parameters and waits for the outcome.
    pub async fn refresh_with(&self, params: P) -> Result<T, QueryError> {
        self.run_async(params).await
    }

    /// Replaces the data without fetching.
    pub fn mutate(&self, data: T) {
        self.mutate_with(|_, params| (Some(data), params.cloned()));
    }

    /// Computes the next data and parameters from the current ones without fetching.
    ///
    /// The result is written to the cache as well. Returning `None` as data deletes the cache
    /// entry. Identical values do not notify other queries a second time.
    pub fn mutate_with<F>(&self, f: F)
    where
        F: FnOnce(Option<&T>, Option<&P>) -> (Option<T>, Option<P>),
    {
        self.inner().mutate_with(f);
    }

    /// Discards the call in progress.
    ///
    /// The data and error stay as they are. Pending debounced or throttled calls are dropped.
    pub fn cancel(&self) {
        self.inner().cancel();
    }

    /// Stops automatic revalidation and cancels the call in progress.
    ///
    /// Imperative calls still work while paused.
    pub fn pause(&self) {
        let inner = self.inner();
        inner.active.store(false, Ordering::SeqCst);
        inner.cancel();
        inner.stop_polling();
        tracing::debug!("Paused query");
    }

    /// Re-enables automatic revalidation.
    pub fn resume(&self) {
        let inner = self.inner();
        inner.active.store(true, Ordering::SeqCst);
        inner.start_polling();
        tracing::debug!("Resumed query");
    }

    pub fn is_active(&self) -> bool {
        self.inner().active.load(Ordering::SeqCst)
    }

    /// Refreshes if the query is active, and the environment is visible and online (or the
    /// options allow revalidating anyway).
    ///
    /// Returns whether a refresh was issued. This is what all automatic triggers call.
    pub async fn revalidate(&self) -> bool {
        self.inner().revalidate().await
    }

    /// Revalidates when `deps` differs from the value passed last time.
    ///
    /// The first call only records the value. Returns whether a refresh was issued.
    pub async fn update_deps<D: Hash + ?Sized>(&self, deps: &D) -> bool {
        let hash = FxBuildHasher.hash_one(deps);
        let previous = self.inner().deps.lock().unwrap().replace(hash);
        match previous {
            Some(previous) if previous != hash => self.revalidate().await,
            _ => false,
        }
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> QueryState<T, P> {
        self.inner().state.borrow().clone()
    }

    pub fn data(&self) -> Option<T> {
        self.inner().state.borrow().data.clone()
    }

    pub fn error(&self) -> Option<QueryError> {
        self.inner().state.borrow().error.clone()
    }

    pub fn loading(&self) -> bool {
        self.inner().state.borrow().loading
    }

    pub fn params(&self) -> Option<P> {
        self.inner().state.borrow().params.clone()
    }

    pub fn initializing(&self) -> bool {
        self.inner().state.borrow().initializing()
    }

    pub fn refreshing(&self) -> bool {
        self.inner().state.borrow().refreshing()
    }

    pub fn loading_slow(&self) -> bool {
        self.inner().state.borrow().loading_slow
    }

    /// Observes state changes.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T, P>> {
        self.inner().state.subscribe()
    }

    /// The cache key the query is currently bound to.
    pub fn cache_key(&self) -> Option<String> {
        self.inner().bound_key()
    }

    pub fn client(&self) -> &QueryClient<T, P> {
        &self.inner().client
    }
}

impl<T, P> QueryInner<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    fn store(&self) -> &CacheStore<T, P> {
        self.client.store()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn last_params(&self) -> Option<P> {
        let params = self.state.borrow().params.clone();
        params.or_else(|| self.options.default_params.clone())
    }

    fn bound_key(&self) -> Option<String> {
        let binding = self.binding.lock().unwrap();
        binding.as_ref().map(|binding| binding.key.clone())
    }

    fn run(self: &Arc<Self>, params: P) {
        match &self.limiter {
            Some(limiter) => limiter.call(params),
            None => self.spawn_run(params),
        }
    }

    fn spawn_run(self: &Arc<Self>, params: P) {
        if self.is_closed() {
            return;
        }
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            // the outcome is reflected in the state
            let _ = inner.run_async(params).await;
        });
    }

    async fn run_async(self: &Arc<Self>, params: P) -> Result<T, QueryError> {
        if self.is_closed() {
            return Err(QueryError::Cancelled);
        }
        let version = self.retry.next_version();
        metric!(counter("query.access") += 1);

        if let Some(on_before) = &self.options.callbacks.on_before {
            on_before(&params);
        }

        let key = self
            .options
            .cache_key
            .as_ref()
            .map(|key| key.resolve(&params));
        if key.is_some() {
            self.bind_key(key.as_deref());
        }
        let cached = key.as_deref().and_then(|key| self.store().get_cache(key));

        if let (Some(cached), Some(stale_time)) = (&cached, self.options.stale_time) {
            if cached.age() < stale_time {
                metric!(counter("query.cache.hit") += 1);
                tracing::trace!(key = key.as_deref(), "Serving fresh data from cache");
                self.stop_slow_timer();
                self.state.send_modify(|state| {
                    state.data = Some(cached.data.clone());
                    state.params = Some(cached.params.clone());
                    state.error = None;
                    state.loading = false;
                    state.loading_slow = false;
                });
                return Ok(cached.data.clone());
            }
        }

        self.state.send_modify(|state| {
            state.loading = true;
            state.loading_slow = false;
            state.params = Some(params.clone());
            if self.options.clear_before_run {
                state.data = None;
            } else if let Some(cached) = &cached {
                state.data = Some(cached.data.clone());
            }
        });
        self.start_slow_timer(version);

        let result = self.fetch(key.as_deref(), &params, version).await;
        self.settle(version, key.as_deref(), params, result)
    }

    /// Drives the retried, de-duplicated fetch.
    ///
    /// Returns `Ok(None)` when the call went stale.
    async fn fetch(
        &self,
        key: Option<&str>,
        params: &P,
        version: Version,
    ) -> Result<Option<T>, QueryError> {
        let last_error = Arc::new(Mutex::new(None));
        let task = || {
            let attempt = self.attempt(key, params.clone());
            let last_error = Arc::clone(&last_error);
            async move {
                let result = attempt.await;
                if let Err(err) = &result {
                    *last_error.lock().unwrap() = Some(err.clone());
                }
                result
            }
        };

        match self.retry.run_with_version(version, task).await? {
            Some(data) => Ok(Some(data)),
            // retries exhausted and the failure swallowed, or stale
            None => match last_error.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// A single attempt, joining the fetch in flight for the same key.
    fn attempt(&self, key: Option<&str>, params: P) -> BoxFuture<'static, Result<T, QueryError>> {
        let fetcher = Arc::clone(&self.fetcher);
        let start = move || {
            metric!(counter("query.fetch") += 1);
            let fetch = fetcher(params);
            async move {
                let started = Instant::now();
                let result = fetch.await.map_err(QueryError::fetch);
                metric!(timer("query.fetch.duration") = started.elapsed());
                result
            }
        };

        match key {
            None => start().boxed(),
            Some(key) => {
                let inflight = self.client.inflight();
                let flight = inflight.get_or_start(key, start);
                if !flight.is_leader() {
                    metric!(counter("query.dedup.join") += 1);
                    tracing::trace!(key, "Joining fetch in flight");
                }
                metric!(gauge("query.inflight") = inflight.len() as u64);
                *self.flight.lock().unwrap() = Some((key.to_owned(), flight.id()));
                flight.into_future().boxed()
            }
        }
    }

    /// Writes a result to the cache, with the expiration of the store unless overridden.
    fn write_cache(&self, key: &str, data: T, params: P) {
        match self.options.cache_expiration {
            Some(expiration) => {
                self.store()
                    .set_cache_with_expiration(key, data, params, expiration);
            }
            None => {
                self.store().set_cache(key, data, params);
            }
        }
    }

    /// Applies the outcome of a call, unless a newer call started in the meantime.
    fn settle(
        &self,
        version: Version,
        key: Option<&str>,
        params: P,
        result: Result<Option<T>, QueryError>,
    ) -> Result<T, QueryError> {
        if !self.retry.is_current(version) {
            return Err(self.discarded(version));
        }
        self.stop_slow_timer();
        let callbacks = &self.options.callbacks;

        match result {
            Ok(Some(data)) => {
                self.state.send_modify(|state| {
                    state.data = Some(data.clone());
                    state.params = Some(params.clone());
                    state.error = None;
                    state.loading = false;
                    state.loading_slow = false;
                });
                if let Some(key) = key {
                    self.write_cache(key, data.clone(), params.clone());
                }

                if let Some(on_success) = &callbacks.on_success {
                    on_success(&data, &params);
                }
                if let Some(on_finally) = &callbacks.on_finally {
                    on_finally(&params, Some(&data), None);
                }
                Ok(data)
            }
            Ok(None) => Err(self.discarded(version)),
            Err(err) => {
                self.state.send_modify(|state| {
                    state.error = Some(err.clone());
                    state.loading = false;
                    state.loading_slow = false;
                });
                if let Some(on_finally) = &callbacks.on_finally {
                    on_finally(&params, None, Some(&err));
                }
                Err(err)
            }
        }
    }

    fn discarded(&self, version: Version) -> QueryError {
        if *self.cancelled.lock().unwrap() == Some(version) {
            QueryError::Cancelled
        } else {
            QueryError::Stale
        }
    }

    /// Called by the retry coordinator for every failed attempt of the current call.
    ///
    /// The state only takes the error once the call settles.
    fn attempt_failed(&self, err: &QueryError) {
        metric!(counter("query.error") += 1);
        tracing::debug!("Fetch failed: {err}");

        if let Some(on_error) = &self.options.callbacks.on_error {
            let params = self.state.borrow().params.clone();
            if let Some(params) = params {
                on_error(err, &params);
            }
        }
    }

    fn cancel(&self) {
        let cancelled = self.retry.cancel();
        *self.cancelled.lock().unwrap() = Some(cancelled);

        if let Some((key, id)) = self.flight.lock().unwrap().take() {
            if self.client.inflight().clear_if(&key, id) {
                tracing::trace!(key = key.as_str(), "Abandoned fetch in flight");
            }
        }
        self.stop_slow_timer();
        if let Some(limiter) = &self.limiter {
            limiter.cancel();
        }
        self.state.send_if_modified(|state| {
            let modified = state.loading || state.loading_slow;
            state.loading = false;
            state.loading_slow = false;
            modified
        });
    }

    fn mutate_with<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(Option<&T>, Option<&P>) -> (Option<T>, Option<P>),
    {
        let (data, params) = {
            let state = self.state.borrow();
            (state.data.clone(), state.params.clone())
        };
        let (data, params) = f(data.as_ref(), params.as_ref());

        self.state.send_modify(|state| {
            state.data = data.clone();
            state.params = params.clone();
            state.error = None;
        });

        let key = match (&self.options.cache_key, &params) {
            (Some(key), Some(params)) => Some(key.resolve(params)),
            (Some(_), None) => self.bound_key(),
            (None, _) => None,
        };
        let Some(key) = key else {
            return;
        };
        self.bind_key(Some(&key));

        match (data, params) {
            (Some(data), Some(params)) => self.write_cache(&key, data, params),
            (None, _) => {
                self.store()
                    .mutate(KeyFilter::Keys(&[key.as_str()]), Mutation::Clear);
            }
            (Some(_), None) => {
                tracing::debug!(key = key.as_str(), "Not caching mutated data without params");
            }
        }
    }

    /// Subscribes to invalidation events of `key`, replacing the previous binding.
    fn bind_key(self: &Arc<Self>, key: Option<&str>) {
        let mut binding = self.binding.lock().unwrap();
        if binding.as_ref().map(|binding| binding.key.as_str()) == key {
            return;
        }

        *binding = key.map(|key| {
            tracing::trace!(key, "Binding query to cache key");
            let weak = Arc::downgrade(self);
            let subscription = self.store().subscribe(key, move |entry| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_cache_event(entry);
                }
            });
            KeyBinding {
                key: key.to_owned(),
                _subscription: subscription,
            }
        });
    }

    fn apply_cache_event(&self, entry: Option<&CachedData<T, P>>) {
        metric!(counter("cache.invalidation") += 1);
        self.state.send_if_modified(|state| match entry {
            Some(entry) if state.data.as_ref() != Some(&entry.data) => {
                state.data = Some(entry.data.clone());
                true
            }
            Some(_) => false,
            None => state.data.take().is_some(),
        });
    }

    fn start_slow_timer(self: &Arc<Self>, version: Version) {
        let Some(timeout) = self.options.loading_timeout else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.retry.is_current(version) {
                inner.state.send_if_modified(|state| {
                    let slow = state.loading && !state.loading_slow;
                    state.loading_slow |= slow;
                    slow
                });
            }
        });

        let previous = self
            .slow_timer
            .lock()
            .unwrap()
            .replace(handle.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_slow_timer(&self) {
        if let Some(timer) = self.slow_timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.cancel();
        self.stop_polling();
        self.subscriptions.lock().unwrap().clear();
        self.binding.lock().unwrap().take();
        tracing::trace!("Tore down query");
    }
}
