use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use requery_service::config::Config;
use requery_service::query::{Query, QueryClient, QueryOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// Many queries hammering a set of shared cache keys.
#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct cache keys.
    pub keys: u64,
    /// The number of queries sharing the cache.
    #[serde(default = "default_queries")]
    pub queries: usize,
    /// How long the simulated fetcher takes.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// The share of fetches that fail, between `0` and `1`.
    #[serde(default)]
    pub error_rate: f64,
    /// Overrides the retry count of the configuration file.
    #[serde(default)]
    pub retry_count: Option<u32>,
    /// Overrides the stale time of the configuration file.
    #[serde(default, with = "humantime_serde")]
    pub stale_time: Option<Duration>,
}

fn default_queries() -> usize {
    1
}

pub struct PreparedWorkload {
    queries: Vec<Query<String, u64>>,
    keys: u64,
    /// The number of times the fetcher actually ran.
    pub fetches: Arc<AtomicUsize>,
}

/// How a single operation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Superseded or cancelled.
    Discarded,
}

pub fn prepare_workload(config: &Config, workload: &Workload) -> Result<PreparedWorkload> {
    if workload.keys == 0 || workload.queries == 0 {
        bail!("a workload needs at least one key and one query");
    }

    let client = QueryClient::from_config(&config.cache);
    let fetches = Arc::new(AtomicUsize::new(0));
    let latency = workload.latency;
    let error_rate = workload.error_rate.clamp(0.0, 1.0);

    let fetcher = {
        let fetches = Arc::clone(&fetches);
        move |id: u64| {
            fetches.fetch_add(1, Ordering::Relaxed);
            async move {
                tokio::time::sleep(latency).await;
                if rand::random_bool(error_rate) {
                    bail!("simulated failure for {id}");
                }
                Ok(format!("value of {id}"))
            }
        }
    };

    let mut options =
        QueryOptions::from_config(&config.query).cache_key_fn(|id| format!("stress:{id}"));
    if let Some(retry_count) = workload.retry_count {
        options = options.retry_count(retry_count);
    }
    if let Some(stale_time) = workload.stale_time {
        options = options.stale_time(stale_time);
    }

    let queries = (0..workload.queries)
        .map(|_| client.query(fetcher.clone(), options.clone()))
        .collect::<Result<_, _>>()?;

    Ok(PreparedWorkload {
        queries,
        keys: workload.keys,
        fetches,
    })
}

pub async fn process_workload(workload: &PreparedWorkload) -> Outcome {
    let query = &workload.queries[rand::random_range(0..workload.queries.len())];
    let key = rand::random_range(0..workload.keys);

    match query.run_async(key).await {
        Ok(_) => Outcome::Success,
        Err(err) if err.is_discarded() => Outcome::Discarded,
        Err(_) => Outcome::Failure,
    }
}
