use std::sync::{Arc, Mutex};
use std::time::Duration;

use requery_service::query::{QueryClient, QueryOptions};

pub use requery_test::{MockFetcher, setup};

/// Users are fetched by id.
pub type UserClient = QueryClient<String, u32>;

/// Options of a query for users, cached under `user:{id}`.
pub fn user_options() -> QueryOptions<String, u32> {
    QueryOptions::default().cache_key_fn(|id| format!("user:{id}"))
}

/// Lets spawned tasks and timers make progress for `ms` of paused time.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// An ordered log of callback invocations.
#[derive(Clone, Debug, Default)]
pub struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    /// Returns all calls so far and resets the log.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}
