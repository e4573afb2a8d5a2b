//! Caching primitives for the `requery` query coordinator.
//!
//! These primitives are meant to be composed by a higher level request controller:
//!
//! - The [`CacheStore`] is a keyed store of results and the parameters that produced them. It
//!   expires entries after some time and notifies subscribers of every key about changes.
//! - [`InFlight`] provides request coalescing, so that concurrent requests for the same key
//!   share a single computation.
//! - The store is backed by a [`CacheProvider`], which is an in-memory [`MemoryProvider`] by
//!   default but can be swapped for any other key-value storage.

#![warn(missing_docs)]

mod events;
mod inflight;
mod provider;
mod store;

pub use events::*;
pub use inflight::*;
pub use provider::*;
pub use store::*;
