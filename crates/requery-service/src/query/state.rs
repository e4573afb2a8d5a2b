use crate::error::QueryError;

/// A snapshot of the state of a [`Query`](super::Query).
///
/// A query publishes a new snapshot whenever any of the fields change, see
/// [`Query::subscribe`](super::Query::subscribe).
#[derive(Clone, Debug)]
pub struct QueryState<T, P> {
    /// The result of the latest successful call, or the value last written to the cache key.
    pub data: Option<T>,
    /// The error of the latest failed call. Cleared by the next success or mutation.
    ///
    /// Only set once a call has settled: while retries are pending, this still shows the outcome
    /// of the previous call.
    pub error: Option<QueryError>,
    /// Whether a call is in progress.
    pub loading: bool,
    /// The parameters of the latest call.
    pub params: Option<P>,
    /// Whether the call in progress has been running for longer than the loading timeout.
    pub loading_slow: bool,
}

impl<T, P> Default for QueryState<T, P> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            loading: false,
            params: None,
            loading_slow: false,
        }
    }
}

impl<T, P> QueryState<T, P> {
    /// Loading without any data to show yet.
    pub fn initializing(&self) -> bool {
        self.data.is_none() && self.loading
    }

    /// Loading while still showing earlier data.
    pub fn refreshing(&self) -> bool {
        self.data.is_some() && self.loading
    }
}
