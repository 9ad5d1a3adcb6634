//! Statsd client for the internal measurements of strata.
//!
//! Every metric is named by a value implementing one of [`CounterMetric`], [`GaugeMetric`],
//! [`TimerMetric`] or [`DistributionMetric`], usually a fieldless enum per crate. The trait only
//! pins the metric type, so a counter name can never be emitted as a gauge. Metrics are emitted
//! with the [`metric!`] macro:
//!
//! ```
//! use strata_statsd::{metric, CounterMetric};
//!
//! enum WorkerCounters {
//!     PointsApplied,
//! }
//!
//! impl CounterMetric for WorkerCounters {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::PointsApplied => "worker.points.applied",
//!         }
//!     }
//! }
//!
//! metric!(counter(WorkerCounters::PointsApplied) += 1, worker = "3");
//! ```
//!
//! Until [`init`] has been called, emitting a metric does nothing:
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! strata_statsd::init(strata_statsd::MetricsClientConfig {
//!     prefix: "strata",
//!     host: "127.0.0.1:8125",
//!     default_tags: BTreeMap::new(),
//!     default_sample_rate: 1.0.into(),
//! })
//! .ok();
//! ```
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use cadence::{BufferedUdpMetricSink, Metric, MetricBuilder, QueuingMetricSink, StatsdClient};
use parking_lot::RwLock;

/// Number of metrics buffered for the UDP sink before new ones are dropped.
const QUEUE_CAPACITY: usize = 100_000;

/// A sample rate, clamped to `0.0..=1.0`.
#[derive(Debug, Clone, Copy)]
pub struct SampleRate(f64);

impl From<f64> for SampleRate {
    fn from(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }
}

impl From<SampleRate> for f64 {
    fn from(value: SampleRate) -> Self {
        value.0
    }
}

/// Settings for [`init`].
#[derive(Debug)]
pub struct MetricsClientConfig<'a, A> {
    /// Prepended to every metric name.
    pub prefix: &'a str,
    /// Address of the statsd server.
    pub host: A,
    /// Tags attached to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Fraction of metrics that are sent.
    pub default_sample_rate: SampleRate,
}

/// The statsd client used by [`metric!`].
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    default_tags: BTreeMap<String, String>,
    sample_rate: f64,
}

impl MetricsClient {
    fn new(statsd: StatsdClient, default_tags: BTreeMap<String, String>, rate: SampleRate) -> Self {
        Self {
            statsd,
            default_tags,
            sample_rate: rate.into(),
        }
    }

    /// The underlying cadence client.
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    /// Attaches the default tags and sends the metric, subject to sampling.
    #[doc(hidden)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        if !sampled(self.sample_rate) {
            return;
        }

        for (key, value) in &self.default_tags {
            metric = metric.with_tag(key, value);
        }
        if self.sample_rate < 1.0 {
            metric = metric.with_sampling_rate(self.sample_rate);
        }

        if let Err(error) = metric.try_send() {
            strata_log::error!(
                error = &error as &dyn std::error::Error,
                capacity = QUEUE_CAPACITY,
                "failed to send metric",
            );
        }
    }
}

fn sampled(rate: f64) -> bool {
    rate >= 1.0 || (rate > 0.0 && rand::random::<f64>() < rate)
}

static CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    /// Replaces the global client on this thread while capturing in tests.
    static LOCAL_CLIENT: RefCell<Option<Arc<MetricsClient>>> = const { RefCell::new(None) };
}

#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Starts reporting to the statsd server in `config`.
///
/// Metrics leave through a bounded queue drained by a background thread. When the queue is full,
/// metrics are dropped and an error is logged.
pub fn init<A: ToSocketAddrs>(config: MetricsClientConfig<A>) -> Result<(), cadence::MetricError> {
    let addrs: Vec<_> = config.host.to_socket_addrs()?.collect();
    if let Some(addr) = addrs.first() {
        strata_log::info!("reporting metrics to statsd at {addr}");
    }
    if f64::from(config.default_sample_rate) == 0.0 {
        strata_log::debug!("metrics sample rate is 0, no metrics will be reported");
    }

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let sink = QueuingMetricSink::with_capacity(
        BufferedUdpMetricSink::from(&addrs[..], socket)?,
        QUEUE_CAPACITY,
    );
    let client = MetricsClient::new(
        StatsdClient::from_sink(config.prefix, sink),
        config.default_tags,
        config.default_sample_rate,
    );

    *CLIENT.write() = Some(Arc::new(client));
    Ok(())
}

/// Calls `f` with the active client, or returns the default if none is configured.
///
/// Prefer the [`metric!`] macro.
#[inline]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    let client = LOCAL_CLIENT
        .with(|local| local.borrow().clone())
        .or_else(|| CLIENT.read().clone());

    match client {
        Some(client) => f(&client),
        None => R::default(),
    }
}

/// Runs `f` with a client that records every metric emitted on the current thread.
///
/// Returns the metrics in statsd line format, without prefix.
#[cfg(any(test, feature = "test"))]
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    capture(1.0, f)
}

#[cfg(any(test, feature = "test"))]
fn capture(rate: f64, f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let client = MetricsClient::new(StatsdClient::from_sink("", sink), BTreeMap::new(), rate.into());

    let previous = LOCAL_CLIENT.with(|local| local.replace(Some(Arc::new(client))));
    f();
    LOCAL_CLIENT.with(|local| local.replace(previous));

    rx.try_iter()
        .map(|line| String::from_utf8_lossy(&line).into_owned())
        .collect()
}

/// A duration in milliseconds, such as the time spent writing to storage.
///
/// ```
/// use std::time::Instant;
/// use strata_statsd::{metric, TimerMetric};
///
/// struct WriteDuration;
///
/// impl TimerMetric for WriteDuration {
///     fn name(&self) -> &'static str {
///         "storage.write.duration"
///     }
/// }
///
/// let start = Instant::now();
/// metric!(timer(WriteDuration) = start.elapsed(), storage = "memory");
/// ```
pub trait TimerMetric {
    /// The metric name sent to statsd.
    fn name(&self) -> &'static str;
}

/// A count of events. Zero increments are not sent.
pub trait CounterMetric {
    /// The metric name sent to statsd.
    fn name(&self) -> &'static str;
}

/// A sampled value, such as the size of a batch.
pub trait DistributionMetric {
    /// The metric name sent to statsd.
    fn name(&self) -> &'static str;
}

/// A current level, such as the length of a queue.
///
/// ```
/// use strata_statsd::{metric, GaugeMetric};
///
/// struct QueueLength;
///
/// impl GaugeMetric for QueueLength {
///     fn name(&self) -> &'static str {
///         "queue.length"
///     }
/// }
///
/// metric!(gauge(QueueLength) = 12u64, queue = "flusher");
/// ```
pub trait GaugeMetric {
    /// The metric name sent to statsd.
    fn name(&self) -> &'static str;
}

/// Emits a metric through the active client.
///
/// Supported forms, each optionally followed by `key = value` tags:
///
/// - `counter(id) += value`
/// - `gauge(id) = value`
/// - `timer(id) = duration`
/// - `distribution(id) = value`
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        match $value {
            0 => {}
            value => $crate::with_client(|client| {
                use $crate::_pred::*;
                client.send_metric(
                    client.statsd().count_with_tags($crate::CounterMetric::name(&$id), value)
                        $(.with_tag(stringify!($($k).*), $v))*
                )
            }),
        }
    };

    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.statsd().gauge_with_tags($crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            let millis = $value.as_nanos() as f64 / 1e6;
            client.send_metric(
                client.statsd().distribution_with_tags($crate::TimerMetric::name(&$id), millis)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (distribution($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.statsd().distribution_with_tags($crate::DistributionMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    enum QueueGauges {
        Flusher,
        Worker,
    }

    impl GaugeMetric for QueueGauges {
        fn name(&self) -> &'static str {
            match self {
                Self::Flusher => "queue.flusher",
                Self::Worker => "queue.worker",
            }
        }
    }

    struct Applied;

    impl CounterMetric for Applied {
        fn name(&self) -> &'static str {
            "points.applied"
        }
    }

    struct BatchSize;

    impl DistributionMetric for BatchSize {
        fn name(&self) -> &'static str {
            "batch.size"
        }
    }

    struct WriteDuration;

    impl TimerMetric for WriteDuration {
        fn name(&self) -> &'static str {
            "write.duration"
        }
    }

    #[test]
    fn test_gauges_with_tags() {
        let captures = with_capturing_test_client(|| {
            metric!(gauge(QueueGauges::Flusher) = 3u64, node = "a");
            metric!(gauge(QueueGauges::Worker) = 12u64, node = "a", worker = "1");
        });

        assert_eq!(
            captures,
            ["queue.flusher:3|g|#node:a", "queue.worker:12|g|#node:a,worker:1"]
        );
    }

    #[test]
    fn test_counter_skips_zero() {
        let captures = with_capturing_test_client(|| {
            metric!(counter(Applied) += 0);
            metric!(counter(Applied) += 10, reason = "stale");
        });

        assert_eq!(captures, ["points.applied:10|c|#reason:stale"]);
    }

    #[test]
    fn test_timer_in_millis() {
        let captures = with_capturing_test_client(|| {
            metric!(timer(WriteDuration) = Duration::from_micros(2500), storage.kind = "memory");
        });

        assert_eq!(captures, ["write.duration:2.5|d|#storage.kind:memory"]);
    }

    #[test]
    fn test_distribution() {
        let captures = with_capturing_test_client(|| {
            metric!(distribution(BatchSize) = 42u64);
        });

        assert_eq!(captures, ["batch.size:42|d"]);
    }

    #[test]
    fn test_zero_sample_rate() {
        let captures = capture(0.0, || {
            metric!(counter(Applied) += 1);
            metric!(distribution(BatchSize) = 200u64);
        });

        assert!(captures.is_empty());
    }

    #[test]
    fn test_noop_without_client() {
        let sent = with_client(|_| true);
        assert!(!sent);
    }
}
