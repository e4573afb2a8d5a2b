// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod caching;
pub mod lifecycle;
pub mod ratelimit;
pub mod retry;
pub mod revalidation;
pub mod utils;

pub use utils::*;
