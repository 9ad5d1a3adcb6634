use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use strata_statsd::{CounterMetric, GaugeMetric};
use strata_system::{Addr, Service, ShutdownHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::statsd::{ReceiverCounters, ReceiverGauges};
use crate::{AggregatorCommand, Cluster, Ident, IncomingPoint, PacedMetric};

/// Sink for the receiver's own statistics.
pub trait StatReporter: Send + Sync {
    /// Adds `value` to the counter `name`.
    fn report_count(&self, name: &str, value: f64);

    /// Sets the gauge `name` to `value`.
    fn report_gauge(&self, name: &str, value: f64);
}

/// Discards all statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl StatReporter for NoopReporter {
    fn report_count(&self, _name: &str, _value: f64) {}

    fn report_gauge(&self, _name: &str, _value: f64) {}
}

/// Feeds statistics back into the pipeline as paced metrics.
///
/// Counters become paced sums and gauges paced gauges, named `<prefix>.<name>`. Zero counts are
/// skipped. Reporting never waits: when the paced queue is full the sample is dropped, and after
/// the receiver stopped nothing is reported.
#[derive(Debug)]
pub struct PacedReporter {
    prefix: String,
    paced: Addr<PacedMetric>,
    stopped: Arc<AtomicBool>,
}

impl PacedReporter {
    /// Creates a reporter feeding `paced`.
    pub fn new(prefix: impl Into<String>, paced: Addr<PacedMetric>, stopped: Arc<AtomicBool>) -> Self {
        Self {
            prefix: prefix.into(),
            paced,
            stopped,
        }
    }

    /// Returns the full metric name for `name`.
    pub fn metric_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{name}", self.prefix)
        }
    }

    fn report(&self, metric: PacedMetric) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }

        if self.paced.try_send(metric).is_err() {
            strata_log::trace!("paced queue full, dropping self stat");
        }
    }
}

impl StatReporter for PacedReporter {
    fn report_count(&self, name: &str, value: f64) {
        if value == 0.0 {
            return;
        }
        self.report(PacedMetric::sum(Ident::named(self.metric_name(name)), value));
    }

    fn report_gauge(&self, name: &str, value: f64) {
        self.report(PacedMetric::gauge(Ident::named(self.metric_name(name)), value));
    }
}

/// Counter deltas accumulated between two stat flushes.
type PendingCounts = [AtomicU64; ReceiverCounters::ALL.len()];

/// Records receiver statistics to statsd and the configured [`StatReporter`].
///
/// Statsd sees every increment right away. Counters for the reporter are accumulated and handed
/// over as one delta per counter on [`flush_counts`](Self::flush_counts), which the
/// [`StatsService`] calls once per stat interval.
#[derive(Clone)]
pub struct Stats {
    reporter: Arc<dyn StatReporter>,
    pending: Arc<PendingCounts>,
}

impl Stats {
    /// Creates stats that also feed `reporter`.
    pub fn new(reporter: Arc<dyn StatReporter>) -> Self {
        Self {
            reporter,
            pending: Arc::new(std::array::from_fn(|_| AtomicU64::new(0))),
        }
    }

    /// Creates stats that only go to statsd.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopReporter))
    }

    /// Replaces the reporter, keeping counts that have not been flushed yet.
    pub fn with_reporter(&self, reporter: Arc<dyn StatReporter>) -> Self {
        Self {
            reporter,
            pending: self.pending.clone(),
        }
    }

    /// Returns the reporter statistics are fed to.
    pub fn reporter(&self) -> &Arc<dyn StatReporter> {
        &self.reporter
    }

    /// Increments a counter.
    pub fn count(&self, counter: ReceiverCounters, value: u64) {
        if value == 0 {
            return;
        }

        strata_statsd::metric!(counter(counter) += value as i64);
        self.pending[counter as usize].fetch_add(value, Ordering::Relaxed);
    }

    /// Increments a counter, tagging the statsd metric with a reason.
    pub fn count_reason(&self, counter: ReceiverCounters, value: u64, reason: &'static str) {
        if value == 0 {
            return;
        }

        strata_statsd::metric!(counter(counter) += value as i64, reason = reason);
        self.pending[counter as usize].fetch_add(value, Ordering::Relaxed);
    }

    /// Hands the counts accumulated since the last call to the reporter.
    pub fn flush_counts(&self) {
        for counter in ReceiverCounters::ALL {
            let value = self.pending[counter as usize].swap(0, Ordering::Relaxed);
            if value > 0 {
                self.reporter.report_count(counter.name(), value as f64);
            }
        }
    }

    /// Sets a gauge.
    pub fn gauge(&self, gauge: ReceiverGauges, value: u64) {
        strata_statsd::metric!(gauge(gauge) = value);
        self.reporter.report_gauge(gauge.name(), value as f64);
    }
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stats").finish_non_exhaustive()
    }
}

/// Sizes shared between the services and the stat ticker.
#[derive(Debug, Default)]
pub struct PipelineGauges {
    data_sources: AtomicU64,
    flush_queue: AtomicU64,
}

impl PipelineGauges {
    /// Number of data sources cached by all workers.
    pub fn data_sources(&self) -> u64 {
        self.data_sources.load(Ordering::Relaxed)
    }

    /// Number of metrics waiting in the flush queue.
    pub fn flush_queue(&self) -> u64 {
        self.flush_queue.load(Ordering::Relaxed)
    }

    pub(crate) fn data_source_created(&self) {
        self.data_sources.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn data_sources_dropped(&self, count: usize) {
        self.data_sources
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(count as u64))
            })
            .ok();
    }

    pub(crate) fn set_flush_queue(&self, len: usize) {
        self.flush_queue.store(len as u64, Ordering::Relaxed);
    }
}

/// Periodically flushes accumulated counters and reports pipeline gauges and channel back
/// pressure.
pub struct StatsService {
    interval: Duration,
    stats: Stats,
    gauges: Arc<PipelineGauges>,
    ingress: Addr<IncomingPoint>,
    commands: Addr<AggregatorCommand>,
    paced: Addr<PacedMetric>,
    cluster: Option<Arc<dyn Cluster>>,
}

impl StatsService {
    /// Creates the stat ticker.
    pub fn new(
        interval: Duration,
        stats: Stats,
        gauges: Arc<PipelineGauges>,
        ingress: Addr<IncomingPoint>,
        commands: Addr<AggregatorCommand>,
        paced: Addr<PacedMetric>,
        cluster: Option<Arc<dyn Cluster>>,
    ) -> Self {
        Self {
            interval,
            stats,
            gauges,
            ingress,
            commands,
            paced,
            cluster,
        }
    }

    fn report(&self) {
        self.stats.flush_counts();
        self.stats
            .gauge(ReceiverGauges::CacheSize, self.gauges.data_sources());
        self.stats
            .gauge(ReceiverGauges::FlushQueue, self.gauges.flush_queue());

        if let Some(ref cluster) = self.cluster {
            self.stats
                .gauge(ReceiverGauges::ClusterMembers, cluster.num_members() as u64);
        }

        self.ingress.report_back_pressure();
        self.commands.report_back_pressure();
        self.paced.report_back_pressure();
    }
}

impl Service for StatsService {
    type Interface = ();

    async fn run(self, _rx: strata_system::Receiver<()>, mut shutdown: ShutdownHandle) {
        let interval = self.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                _ = ticker.tick() => self.report(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use strata_system::channel;

    use super::*;
    use crate::PacedKind;

    #[test]
    fn test_paced_reporter() {
        let (paced, mut rx) = channel("paced", 16);
        let stopped = Arc::new(AtomicBool::new(false));
        let reporter = PacedReporter::new("strata.10_0_0_1", paced, stopped.clone());

        reporter.report_count("receiver.points.received", 0.0);
        reporter.report_count("receiver.points.received", 3.0);
        reporter.report_gauge("receiver.cache.size", 12.0);

        let sum = rx.try_recv().unwrap();
        assert_eq!(
            sum.ident,
            Ident::named("strata.10_0_0_1.receiver.points.received")
        );
        assert_eq!(sum.kind, PacedKind::Sum);
        assert_eq!(sum.value, 3.0);

        let gauge = rx.try_recv().unwrap();
        assert_eq!(gauge.kind, PacedKind::Gauge);
        assert_eq!(gauge.value, 12.0);
        assert!(rx.try_recv().is_none());

        stopped.store(true, Ordering::Relaxed);
        reporter.report_count("receiver.points.received", 1.0);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_empty_prefix() {
        let (paced, _rx) = channel("paced", 1);
        let reporter = PacedReporter::new("", paced, Arc::default());
        assert_eq!(reporter.metric_name("foo"), "foo");
    }

    #[test]
    fn test_stats_emit_statsd() {
        let stats = Stats::noop();
        let captures = strata_statsd::with_capturing_test_client(|| {
            stats.count(ReceiverCounters::PointsReceived, 0);
            stats.count(ReceiverCounters::PointsReceived, 2);
            stats.count_reason(ReceiverCounters::PointsForwardFailed, 1, "not_ready");
            stats.gauge(ReceiverGauges::FlushQueue, 7);
        });

        similar_asserts::assert_eq!(
            captures,
            [
                "receiver.points.received:2|c",
                "receiver.points.forward_failed:1|c|#reason:not_ready",
                "receiver.flush.queue:7|g",
            ]
        );
    }

    #[test]
    fn test_counts_flushed_once() {
        let (paced, mut rx) = channel("paced", 4);
        let reporter = PacedReporter::new("strata", paced, Arc::default());
        let stats = Stats::new(Arc::new(reporter));

        // More increments than the paced queue holds.
        for _ in 0..5000 {
            stats.count(ReceiverCounters::PointsReceived, 1);
        }
        stats.count_reason(ReceiverCounters::PointsForwardFailed, 2, "not_ready");
        assert!(rx.try_recv().is_none());

        stats.flush_counts();
        let received = rx.try_recv().unwrap();
        assert_eq!(
            received.ident,
            Ident::named("strata.receiver.points.received")
        );
        assert_eq!(received.value, 5000.0);

        let failed = rx.try_recv().unwrap();
        assert_eq!(
            failed.ident,
            Ident::named("strata.receiver.points.forward_failed")
        );
        assert_eq!(failed.value, 2.0);
        assert!(rx.try_recv().is_none());

        stats.flush_counts();
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_counter_indices() {
        for (index, counter) in ReceiverCounters::ALL.into_iter().enumerate() {
            assert_eq!(counter as usize, index, "{counter:?}");
        }
    }

    #[test]
    fn test_gauges_saturate() {
        let gauges = PipelineGauges::default();
        gauges.data_source_created();
        gauges.data_sources_dropped(5);
        assert_eq!(gauges.data_sources(), 0);

        gauges.set_flush_queue(3);
        assert_eq!(gauges.flush_queue(), 3);
    }
}
