//! A keyed, shared-cache async query coordinator.
//!
//! The entry point is the [`Query`](query::Query), created either standalone or through a
//! [`QueryClient`](query::QueryClient) shared between all queries that should see each other's
//! results. The caching primitives live in the `requery-cache` crate.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod environment;
pub mod error;
pub mod logging;
pub mod query;
pub mod ratelimit;
pub mod retry;

pub use requery_cache as cache;
