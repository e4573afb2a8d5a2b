//! Helpers for testing queries.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Tests involving timers should pause the Tokio clock with `tokio::time::pause()` right
//!    at the start. The clock then advances on its own whenever the runtime is idle, which
//!    makes retries, expiration and polling deterministic.
//!
//!  - Use a [`MockFetcher`] to script the responses of a fetcher and to count how often it was
//!    called. Responses are handed out in the order the fetcher is called.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `requery` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("requery_cache=trace,requery_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A scripted response of a [`MockFetcher`].
#[derive(Clone, Debug)]
struct Response<T> {
    result: Result<T, String>,
    delay: Duration,
}

struct MockInner<T> {
    latency: Duration,
    script: Mutex<VecDeque<Response<T>>>,
    fallback: Mutex<Option<Result<T, String>>>,
    hits: Mutex<BTreeMap<String, usize>>,
}

/// A fetcher with scripted responses that counts its calls.
///
/// Scripted responses are used up in order. Once they run out, the fetcher answers with the
/// response set by [`always`](Self::always), or fails.
pub struct MockFetcher<T> {
    inner: Arc<MockInner<T>>,
}

impl<T> Clone for MockFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for MockFetcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> MockFetcher<T> {
    /// A fetcher that answers immediately.
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// A fetcher that takes `latency` to answer, unless a response sets its own delay.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(MockInner {
                latency,
                script: Default::default(),
                fallback: Default::default(),
                hits: Default::default(),
            }),
        }
    }

    /// Scripts a successful response.
    pub fn respond_ok(&self, value: T) -> &Self {
        self.respond(Ok(value), self.inner.latency)
    }

    /// Scripts a failed response.
    pub fn respond_err(&self, message: &str) -> &Self {
        self.respond(Err(message.to_owned()), self.inner.latency)
    }

    /// Scripts a response with its own delay.
    pub fn respond(&self, result: Result<T, String>, delay: Duration) -> &Self {
        self.inner
            .script
            .lock()
            .unwrap()
            .push_back(Response { result, delay });
        self
    }

    /// Answers with `result` once the script has run out.
    pub fn always(&self, result: Result<T, String>) -> &Self {
        *self.inner.fallback.lock().unwrap() = Some(result);
        self
    }

    /// The fetcher function, to be passed to a query.
    pub fn fetcher<P>(
        &self,
    ) -> impl Fn(P) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync + use<P, T>
    where
        P: Debug + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        move |params: P| {
            *inner
                .hits
                .lock()
                .unwrap()
                .entry(format!("{params:?}"))
                .or_default() += 1;

            let response = inner.script.lock().unwrap().pop_front();
            let response = response.unwrap_or_else(|| Response {
                result: inner
                    .fallback
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| Err(format!("no response scripted for {params:?}"))),
                delay: inner.latency,
            });

            async move {
                if !response.delay.is_zero() {
                    tokio::time::sleep(response.delay).await;
                }
                response.result.map_err(anyhow::Error::msg)
            }
            .boxed()
        }
    }

    /// The total number of calls so far.
    pub fn accesses(&self) -> usize {
        self.inner.hits.lock().unwrap().values().sum()
    }

    /// The number of calls per parameters, formatted with [`Debug`]. This resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.inner.hits.lock().unwrap());
        map.into_iter().collect()
    }
}
