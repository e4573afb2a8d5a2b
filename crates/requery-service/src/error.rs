use std::sync::Arc;

use thiserror::Error;

use crate::retry::RetryState;

/// An error produced by a [`Query`](crate::query::Query).
///
/// This error is cheap to clone, since the result of a single fetch can be shared by any number of
/// concurrent callers.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The fetcher returned an error.
    #[error("fetch failed: {0:#}")]
    Fetch(Arc<anyhow::Error>),
    /// All retries failed, and the `on_retry_failed` callback decided to propagate the error.
    ///
    /// This is never produced on its own, see [`QueryError::retry_exhausted`].
    #[error("gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        /// The total number of fetcher invocations.
        attempts: u32,
        /// The error of the last attempt.
        source: Box<QueryError>,
    },
    /// The call was superseded by a newer call on the same query.
    ///
    /// This is only returned to whoever awaits the call and never stored as state.
    #[error("superseded by a newer call")]
    Stale,
    /// The call was cancelled.
    ///
    /// This is only returned to whoever awaits the call and never stored as state.
    #[error("cancelled")]
    Cancelled,
    /// The query was configured with invalid options.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl QueryError {
    /// Wraps an error returned by a fetcher.
    pub fn fetch(err: anyhow::Error) -> Self {
        Self::Fetch(Arc::new(err))
    }

    /// Wraps the last error of an exhausted retry loop.
    ///
    /// This is meant to be returned from an `on_retry_failed` callback that wants to propagate
    /// the failure to the caller.
    pub fn retry_exhausted(last: &QueryError, state: &RetryState) -> Self {
        Self::RetryExhausted {
            attempts: state.current_count,
            source: Box::new(last.clone()),
        }
    }

    /// Whether this error only signals that a result was discarded.
    ///
    /// Such errors are returned from awaited calls but never show up in the state of a query.
    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Stale | Self::Cancelled)
    }
}
