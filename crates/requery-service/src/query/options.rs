use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::QueryDefaults;
use crate::environment::{Environment, ManualEnvironment};
use crate::error::QueryError;
use crate::ratelimit::{DebounceOptions, ThrottleOptions};
use crate::retry::{RetryCallback, RetryFailedCallback, RetryInterval};

/// How a query finds its entry in the shared cache.
pub enum CacheKey<P> {
    /// The same key for every call.
    Static(String),
    /// A key computed from the parameters of each call.
    Derived(Arc<dyn Fn(&P) -> String + Send + Sync>),
}

impl<P> CacheKey<P> {
    /// The key for a call with `params`.
    pub fn resolve(&self, params: &P) -> String {
        match self {
            Self::Static(key) => key.clone(),
            Self::Derived(f) => f(params),
        }
    }

    /// The key, if it does not depend on the parameters.
    pub fn fixed(&self) -> Option<&str> {
        match self {
            Self::Static(key) => Some(key),
            Self::Derived(_) => None,
        }
    }
}

impl<P> Clone for CacheKey<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(key) => Self::Static(key.clone()),
            Self::Derived(f) => Self::Derived(Arc::clone(f)),
        }
    }
}

impl<P> fmt::Debug for CacheKey<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(key) => f.debug_tuple("Static").field(key).finish(),
            Self::Derived(_) => write!(f, "Derived"),
        }
    }
}

pub type BeforeCallback<P> = Arc<dyn Fn(&P) + Send + Sync>;
pub type SuccessCallback<T, P> = Arc<dyn Fn(&T, &P) + Send + Sync>;
pub type ErrorCallback<P> = Arc<dyn Fn(&QueryError, &P) + Send + Sync>;
pub type FinallyCallback<T, P> = Arc<dyn Fn(&P, Option<&T>, Option<&QueryError>) + Send + Sync>;

/// Lifecycle callbacks of a query.
///
/// Callbacks of calls that were superseded or cancelled are not invoked, with the exception of
/// `on_before`, which runs synchronously when the call starts.
pub struct Callbacks<T, P> {
    /// Before the call does anything else.
    pub on_before: Option<BeforeCallback<P>>,
    /// After a successful call updated the state.
    pub on_success: Option<SuccessCallback<T, P>>,
    /// After every failed attempt, including the ones that are retried.
    pub on_error: Option<ErrorCallback<P>>,
    /// After the call settled, successful or not.
    pub on_finally: Option<FinallyCallback<T, P>>,
    /// Before a failed attempt is retried.
    pub on_error_retry: Option<RetryCallback<QueryError>>,
    /// Once all retries failed. Returning an error replaces the error of the last attempt.
    pub on_retry_failed: Option<RetryFailedCallback<QueryError>>,
}

impl<T, P> Default for Callbacks<T, P> {
    fn default() -> Self {
        Self {
            on_before: None,
            on_success: None,
            on_error: None,
            on_finally: None,
            on_error_retry: None,
            on_retry_failed: None,
        }
    }
}

impl<T, P> Clone for Callbacks<T, P> {
    fn clone(&self) -> Self {
        Self {
            on_before: self.on_before.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_finally: self.on_finally.clone(),
            on_error_retry: self.on_error_retry.clone(),
            on_retry_failed: self.on_retry_failed.clone(),
        }
    }
}

/// Options of a [`Query`](super::Query).
///
/// All fields are public, and every field has a chainable setter of the same name:
///
/// ```
/// use std::time::Duration;
/// use requery_service::query::QueryOptions;
///
/// let options = QueryOptions::<String, u32>::default()
///     .cache_key_fn(|id| format!("user:{id}"))
///     .stale_time(Duration::from_secs(10))
///     .retry_count(1);
/// assert!(options.validate().is_ok());
/// ```
pub struct QueryOptions<T, P> {
    /// When `false`, the query runs with [`default_params`](Self::default_params) right after
    /// it has been created.
    pub manual: bool,
    pub default_params: Option<P>,
    /// Share results with other queries through the cache.
    pub cache_key: Option<CacheKey<P>>,
    /// Overrides the expiration configured on the [`CacheStore`](requery_cache::CacheStore) for
    /// results written by this query. `Some(None)` keeps them forever.
    pub cache_expiration: Option<Option<Duration>>,
    /// Cached results younger than this are returned without fetching.
    pub stale_time: Option<Duration>,
    pub retry_count: u32,
    pub retry_interval: RetryInterval,
    /// After how long a running call flips [`loading_slow`](super::QueryState::loading_slow).
    pub loading_timeout: Option<Duration>,
    /// Drop the current data when a new call starts.
    pub clear_before_run: bool,
    pub refresh_on_focus: bool,
    /// Focus events within this window after a focus refresh are ignored.
    pub focus_throttle: Duration,
    pub refresh_on_reconnect: bool,
    pub polling_interval: Option<Duration>,
    /// Let automatic revalidation run while the environment is not visible.
    pub revalidate_when_hidden: bool,
    /// Let automatic revalidation run while the environment is offline.
    pub revalidate_when_offline: bool,
    /// Debounces [`run`](super::Query::run) and [`refresh`](super::Query::refresh).
    pub debounce: Option<DebounceOptions>,
    /// Throttles [`run`](super::Query::run) and [`refresh`](super::Query::refresh).
    pub throttle: Option<ThrottleOptions>,
    pub environment: Arc<dyn Environment>,
    pub callbacks: Callbacks<T, P>,
}

impl<T, P> Default for QueryOptions<T, P> {
    fn default() -> Self {
        Self {
            manual: true,
            default_params: None,
            cache_key: None,
            cache_expiration: None,
            stale_time: None,
            retry_count: 3,
            retry_interval: RetryInterval::default(),
            loading_timeout: None,
            clear_before_run: false,
            refresh_on_focus: false,
            focus_throttle: Duration::from_secs(5),
            refresh_on_reconnect: false,
            polling_interval: None,
            revalidate_when_hidden: false,
            revalidate_when_offline: false,
            debounce: None,
            throttle: None,
            environment: Arc::new(ManualEnvironment::new()),
            callbacks: Callbacks::default(),
        }
    }
}

impl<T, P: Clone> Clone for QueryOptions<T, P> {
    fn clone(&self) -> Self {
        Self {
            manual: self.manual,
            default_params: self.default_params.clone(),
            cache_key: self.cache_key.clone(),
            cache_expiration: self.cache_expiration,
            stale_time: self.stale_time,
            retry_count: self.retry_count,
            retry_interval: self.retry_interval.clone(),
            loading_timeout: self.loading_timeout,
            clear_before_run: self.clear_before_run,
            refresh_on_focus: self.refresh_on_focus,
            focus_throttle: self.focus_throttle,
            refresh_on_reconnect: self.refresh_on_reconnect,
            polling_interval: self.polling_interval,
            revalidate_when_hidden: self.revalidate_when_hidden,
            revalidate_when_offline: self.revalidate_when_offline,
            debounce: self.debounce,
            throttle: self.throttle,
            environment: Arc::clone(&self.environment),
            callbacks: self.callbacks.clone(),
        }
    }
}

impl<T, P> fmt::Debug for QueryOptions<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("manual", &self.manual)
            .field("cache_key", &self.cache_key)
            .field("cache_expiration", &self.cache_expiration)
            .field("stale_time", &self.stale_time)
            .field("retry_count", &self.retry_count)
            .field("retry_interval", &self.retry_interval)
            .field("loading_timeout", &self.loading_timeout)
            .field("polling_interval", &self.polling_interval)
            .field("debounce", &self.debounce)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

impl<T, P> QueryOptions<T, P> {
    /// Options with the defaults from the configuration file.
    pub fn from_config(defaults: &QueryDefaults) -> Self {
        Self {
            stale_time: defaults.stale_time,
            cache_expiration: defaults.cache_expiration.map(Some),
            retry_count: defaults.retry_count,
            retry_interval: defaults
                .retry_interval
                .map_or(RetryInterval::Exponential, RetryInterval::Fixed),
            loading_timeout: defaults.loading_timeout,
            focus_throttle: defaults.focus_throttle,
            polling_interval: defaults.polling_interval,
            revalidate_when_hidden: defaults.revalidate_when_hidden,
            revalidate_when_offline: defaults.revalidate_when_offline,
            ..Default::default()
        }
    }

    /// Checks the options for combinations that cannot work.
    pub fn validate(&self) -> Result<(), QueryError> {
        let invalid = |msg: &str| Err(QueryError::Configuration(msg.to_owned()));

        if !self.manual && self.default_params.is_none() {
            return invalid("a query that is not manual needs default params");
        }
        if self.polling_interval == Some(Duration::ZERO) {
            return invalid("the polling interval must not be zero");
        }
        if self.debounce.is_some_and(|d| d.wait.is_zero()) {
            return invalid("the debounce wait must not be zero");
        }
        if self.throttle.is_some_and(|t| t.wait.is_zero()) {
            return invalid("the throttle wait must not be zero");
        }
        if self
            .debounce
            .is_some_and(|d| d.max_wait.is_some_and(|max_wait| max_wait < d.wait))
        {
            return invalid("the debounce max wait must not be below its wait");
        }
        Ok(())
    }

    pub fn manual(mut self, manual: bool) -> Self {
        self.manual = manual;
        self
    }

    pub fn default_params(mut self, params: P) -> Self {
        self.default_params = Some(params);
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(CacheKey::Static(key.into()));
        self
    }

    pub fn cache_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&P) -> String + Send + Sync + 'static,
    {
        self.cache_key = Some(CacheKey::Derived(Arc::new(f)));
        self
    }

    pub fn cache_expiration(mut self, expiration: Option<Duration>) -> Self {
        self.cache_expiration = Some(expiration);
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn retry_interval(mut self, interval: RetryInterval) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn loading_timeout(mut self, timeout: Duration) -> Self {
        self.loading_timeout = Some(timeout);
        self
    }

    pub fn clear_before_run(mut self, clear: bool) -> Self {
        self.clear_before_run = clear;
        self
    }

    pub fn refresh_on_focus(mut self, refresh: bool) -> Self {
        self.refresh_on_focus = refresh;
        self
    }

    pub fn focus_throttle(mut self, throttle: Duration) -> Self {
        self.focus_throttle = throttle;
        self
    }

    pub fn refresh_on_reconnect(mut self, refresh: bool) -> Self {
        self.refresh_on_reconnect = refresh;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    pub fn revalidate_when_hidden(mut self, allow: bool) -> Self {
        self.revalidate_when_hidden = allow;
        self
    }

    pub fn revalidate_when_offline(mut self, allow: bool) -> Self {
        self.revalidate_when_offline = allow;
        self
    }

    pub fn debounce(mut self, options: DebounceOptions) -> Self {
        self.debounce = Some(options);
        self
    }

    pub fn throttle(mut self, options: ThrottleOptions) -> Self {
        self.throttle = Some(options);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = environment;
        self
    }

    pub fn on_before<F>(mut self, f: F) -> Self
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.callbacks.on_before = Some(Arc::new(f));
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &P) + Send + Sync + 'static,
    {
        self.callbacks.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryError, &P) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_finally<F>(mut self, f: F) -> Self
    where
        F: Fn(&P, Option<&T>, Option<&QueryError>) + Send + Sync + 'static,
    {
        self.callbacks.on_finally = Some(Arc::new(f));
        self
    }

    pub fn on_error_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryError, &crate::retry::RetryState) + Send + Sync + 'static,
    {
        self.callbacks.on_error_retry = Some(Arc::new(f));
        self
    }

    pub fn on_retry_failed<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryError, &crate::retry::RetryState) -> Result<(), QueryError>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.on_retry_failed = Some(Arc::new(f));
        self
    }
}
