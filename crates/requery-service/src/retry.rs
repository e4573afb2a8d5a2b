//! Retrying of failed fetches, fenced by version tokens.
//!
//! Every top-level invocation of a [`RetryCoordinator`] carries a [`Version`]. The coordinator only
//! keeps driving an invocation while its version is the current one, so minting a new version
//! (either by starting another invocation or through [`RetryCoordinator::cancel`]) orphans all
//! retries that are still waiting for their backoff.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The upper bound of the default exponential backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A generation token minted for every top-level invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

/// The bookkeeping of a retry loop, passed to the retry callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryState {
    /// The number of failed attempts so far.
    pub current_count: u32,
    /// The configured number of retries.
    pub retry_count: u32,
    /// The version of the invocation this loop belongs to.
    pub version: Version,
}

/// How long to wait before the next attempt.
#[derive(Clone, Default)]
pub enum RetryInterval {
    /// `min(30s, 1s * 2^(n - 1))` after the `n`-th failure.
    #[default]
    Exponential,
    /// Always the same delay.
    Fixed(Duration),
    /// A custom function of the number of failures so far.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryInterval {
    /// The delay after the `failures`-th failed attempt.
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            Self::Exponential => {
                let factor = 2u32.saturating_pow(failures.saturating_sub(1));
                Duration::from_secs(1).saturating_mul(factor).min(MAX_BACKOFF)
            }
            Self::Fixed(delay) => *delay,
            Self::Custom(f) => f(failures),
        }
    }
}

impl fmt::Debug for RetryInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential => write!(f, "Exponential"),
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Called with the error of every failed attempt.
pub type ErrorCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;
/// Called right before a retry is attempted.
pub type RetryCallback<E> = Arc<dyn Fn(&E, &RetryState) + Send + Sync>;
/// Called once all retries failed. Returning an error propagates it to the caller.
pub type RetryFailedCallback<E> = Arc<dyn Fn(&E, &RetryState) -> Result<(), E> + Send + Sync>;

/// Options of a [`RetryCoordinator`].
pub struct RetryOptions<E> {
    /// How often a failed task is retried. The task runs at most `count + 1` times.
    pub count: u32,
    /// The delay between attempts.
    pub interval: RetryInterval,
    pub on_error: Option<ErrorCallback<E>>,
    pub on_error_retry: Option<RetryCallback<E>>,
    /// Swallows the error by default.
    pub on_retry_failed: Option<RetryFailedCallback<E>>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            count: 3,
            interval: RetryInterval::default(),
            on_error: None,
            on_error_retry: None,
            on_retry_failed: None,
        }
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            count: self.count,
            interval: self.interval.clone(),
            on_error: self.on_error.clone(),
            on_error_retry: self.on_error_retry.clone(),
            on_retry_failed: self.on_retry_failed.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("count", &self.count)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Drives a fallible task until it succeeds, retries are exhausted, or it becomes stale.
pub struct RetryCoordinator<E> {
    options: RetryOptions<E>,
    version: AtomicU64,
}

impl<E> fmt::Debug for RetryCoordinator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("options", &self.options)
            .field("version", &self.current())
            .finish()
    }
}

impl<E> RetryCoordinator<E> {
    pub fn new(options: RetryOptions<E>) -> Self {
        Self {
            options,
            version: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &RetryOptions<E> {
        &self.options
    }

    /// The version of the latest invocation.
    pub fn current(&self) -> Version {
        Version(self.version.load(Ordering::SeqCst))
    }

    /// Mints a new version, superseding all invocations in progress.
    pub fn next_version(&self) -> Version {
        Version(self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Orphans all invocations in progress and returns the version that was current until now.
    pub fn cancel(&self) -> Version {
        Version(self.version.fetch_add(1, Ordering::SeqCst))
    }

    pub fn is_current(&self, version: Version) -> bool {
        self.current() == version
    }
}

impl<E: fmt::Display> RetryCoordinator<E> {
    /// Runs `task` under a freshly minted version.
    ///
    /// See [`run_with_version`](Self::run_with_version).
    pub async fn run<F, Fut, T>(&self, task: F) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let version = self.next_version();
        self.run_with_version(version, task).await
    }

    /// Runs `task` until it succeeds or all retries are exhausted.
    ///
    /// Returns `Ok(Some(_))` on success. Returns `Ok(None)` when the invocation went stale, or
    /// when retries were exhausted and `on_retry_failed` swallowed the error. An error returned by
    /// `on_retry_failed` is passed through.
    pub async fn run_with_version<F, Fut, T>(
        &self,
        version: Version,
        mut task: F,
    ) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = &self.options;
        let mut current_count = 0;

        loop {
            let result = task().await;
            if !self.is_current(version) {
                tracing::trace!(?version, "Discarding result of stale invocation");
                return Ok(None);
            }

            let err = match result {
                Ok(value) => {
                    metric!(histogram("query.attempts") = u64::from(current_count) + 1);
                    return Ok(Some(value));
                }
                Err(err) => err,
            };

            current_count += 1;
            if let Some(on_error) = &options.on_error {
                on_error(&err);
            }

            let state = RetryState {
                current_count,
                retry_count: options.count,
                version,
            };

            if current_count > options.count {
                metric!(counter("query.retry.exhausted") += 1);
                metric!(histogram("query.attempts") = u64::from(current_count));
                tracing::warn!(attempts = current_count, "Giving up after error: {err}");
                return match &options.on_retry_failed {
                    Some(on_retry_failed) => on_retry_failed(&err, &state).map(|()| None),
                    None => Ok(None),
                };
            }

            let delay = options.interval.delay(current_count);
            tracing::debug!(attempt = current_count, ?delay, "Retrying after error: {err}");
            tokio::time::sleep(delay).await;

            if !self.is_current(version) {
                tracing::trace!(?version, "Dropping retry of stale invocation");
                return Ok(None);
            }

            metric!(counter("query.retry") += 1);
            if let Some(on_error_retry) = &options.on_error_retry {
                on_error_retry(&err, &state);
            }
        }
    }
}
