//! Reporting of cache metrics to statsd.
//!
//! Nothing is reported until [`configure_statsd`] is called. Until then, [`metric!`](crate::metric)
//! does not even build the metric.
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// Re-exported for the expansion of [`metric!`](crate::metric).
#[doc(hidden)]
pub use cadence::prelude;

/// The process-wide statsd client, along with the tags attached to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    global_tags: Vec<(String, String)>,
}

impl MetricsClient {
    /// The underlying statsd client, used to build metrics.
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    /// Adds the global tags to `metric` and sends it.
    pub fn send<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.global_tags
            .iter()
            .fold(metric, |metric, (key, value)| metric.with_tag(key, value))
            .send();
    }
}

/// Starts reporting metrics to the statsd server at `host`.
///
/// Every metric name is prefixed with `prefix`, and carries `tags` in addition to its own. Only
/// the first successful call has an effect.
pub fn configure_statsd<A, I>(prefix: &str, host: A, tags: I) -> io::Result<()>
where
    A: ToSocketAddrs,
    I: IntoIterator<Item = (String, String)>,
{
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;

    let client = MetricsClient {
        statsd: StatsdClient::from_sink(prefix, sink),
        global_tags: tags.into_iter().collect(),
    };

    match CLIENT.set(client) {
        Ok(()) => tracing::info!(?addrs, prefix, "Reporting metrics to statsd"),
        Err(_) => tracing::warn!(?addrs, "Metrics are already configured, ignoring"),
    }
    Ok(())
}

/// Calls `f` with the statsd client, if one is configured.
pub fn with_client<F>(f: F)
where
    F: FnOnce(&MetricsClient),
{
    if let Some(client) = CLIENT.get() {
        f(client);
    }
}

/// Emits a counter or timer metric, tagged with the given key-value pairs.
///
/// ```ignore
/// metric!(counter("caches.access") += 1, "cache" => name);
/// metric!(timer("caches.computation.duration") = elapsed, "cache" => name);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.send(client.statsd().count_with_tags($id, $value)$(.with_tag($k, $v))*);
        })
    };

    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.send(client.statsd().time_with_tags($id, $value)$(.with_tag($k, $v))*);
        })
    };
}
