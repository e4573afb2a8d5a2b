//! Provides access to the metrics system.
//!
//! Nothing is reported until [`configure_statsd`] has been called. The names emitted by the query
//! controller are prefixed with `query.`, the ones emitted for cache activity with `cache.`:
//!
//! - `query.access`, `query.fetch`, `query.error`, `query.revalidate` (counters)
//! - `query.dedup.join`, `query.cache.hit`, `cache.invalidation` (counters)
//! - `query.retry`, `query.retry.exhausted` (counters)
//! - `query.fetch.duration` (timer): the runtime of a single fetcher invocation
//! - `query.inflight` (gauge): computations in the in-flight map of a client
//! - `query.attempts` (histogram): fetcher invocations per settled call
use std::collections::BTreeMap;
use std::io;
use std::net::ToSocketAddrs;
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that attaches the global tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd_client: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd_client
    }

    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Tell the metrics system to report to statsd.
///
/// Only the first call has an effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    let Some(addr) = addrs.first() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "statsd host did not resolve",
        ));
    };
    tracing::info!("Reporting metrics to statsd at {}", addr);

    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;
    let client = MetricsClient {
        statsd_client: StatsdClient::from_sink(prefix, sink),
        tags,
    };

    if METRICS_CLIENT.set(client).is_err() {
        tracing::warn!("statsd was already configured");
    }
    Ok(())
}

/// Invoke a callback with the configured statsd client.
///
/// If statsd is not configured the callback is not invoked and the default is returned. For the
/// most part the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    match METRICS_CLIENT.get() {
        Some(client) => f(client),
        None => R::default(),
    }
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("query.fetch") += 1);
/// metric!(timer("query.fetch.duration") = start.elapsed());
/// metric!(gauge("query.inflight") = 3, "client" => "users");
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags($id, $value) $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags($id, $value) $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags($id, $value) $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags($id, $value) $(, $k => $v)*)
    };

    (@send $method:ident($id:expr, $value:expr) $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            let statsd = client.statsd();
            client.send_metric(statsd.$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}
