use std::time::Duration;

use strata_log::LogError;
use strata_system::{Addr, Receiver, Service, ShutdownHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::router::{ClusterRouter, Route};
use crate::statsd::ReceiverCounters;
use crate::stats::Stats;
use crate::{CachePolicy, DsCache, FlushRequest, IncomingPoint};

/// How often a worker checks idle metrics against the flush policy.
const SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Applies points to the metrics of one shard.
///
/// Every metric is owned by exactly one worker, so its state is never shared. Points owned by
/// other cluster nodes are forwarded instead of applied. The metric is resolved before it is
/// routed, so points without a matching spec are dropped by the node that received them. On
/// shutdown the worker applies what is
/// still queued and hands all pending points to the flusher regardless of the policy.
pub struct WorkerService {
    index: usize,
    cache: DsCache,
    policy: CachePolicy,
    router: ClusterRouter,
    flusher: Addr<FlushRequest>,
    stats: Stats,
    debug: bool,
}

impl WorkerService {
    /// Creates a worker.
    pub fn new(
        index: usize,
        cache: DsCache,
        policy: CachePolicy,
        router: ClusterRouter,
        flusher: Addr<FlushRequest>,
        stats: Stats,
    ) -> Self {
        Self {
            index,
            cache,
            policy,
            router,
            flusher,
            stats,
            debug: false,
        }
    }

    /// Enables trace logging of every point.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    async fn handle_point(&mut self, point: IncomingPoint) {
        if self.debug {
            strata_log::trace!(
                worker = self.index,
                ident = %point.ident,
                timestamp = %point.timestamp,
                value = point.value,
                hops = point.hops,
                "worker received point"
            );
        }

        let now = Instant::now();
        let ds = match self.cache.get_or_create(&point.ident, now).await {
            Ok(Some(ds)) => ds,
            Ok(None) => {
                self.stats.count(ReceiverCounters::PointsUnmatched, 1);
                return;
            }
            Err(error) => {
                self.stats.count(ReceiverCounters::FetchErrors, 1);
                strata_log::error!(
                    ident = %point.ident,
                    "failed to fetch data source: {}",
                    LogError(&error)
                );
                return;
            }
        };

        match self.router.route(&point) {
            Route::Local => (),
            Route::Forward(owners) => {
                self.router.forward(point, owners).await;
                return;
            }
            Route::HopLimit => {
                strata_log::debug!(ident = %point.ident, hops = point.hops, "hop limit reached");
                self.stats.count(ReceiverCounters::PointsDroppedHops, 1);
                return;
            }
        }

        if let Err(error) = ds.apply(point.timestamp, point.value, now) {
            self.stats.count(ReceiverCounters::PointsRejected, 1);
            if self.debug {
                strata_log::trace!(ident = %point.ident, "rejected point: {error}");
            }
            return;
        }
        self.stats.count(ReceiverCounters::PointsApplied, 1);

        let request = if self.policy.should_flush(ds, now) {
            ds.take_flush(now)
        } else {
            None
        };

        if let Some(request) = request {
            self.submit_flush(request).await;
        }
    }

    async fn flush_ready(&mut self) {
        let requests = self.cache.flush_ready(&self.policy, Instant::now());
        for request in requests {
            self.submit_flush(request).await;
        }
    }

    async fn submit_flush(&self, request: FlushRequest) {
        if self.debug {
            strata_log::trace!(
                worker = self.index,
                ident = %request.ident,
                points = request.point_count(),
                "requesting flush"
            );
        }

        if self.flusher.send(request).await.is_err() {
            strata_log::error!(worker = self.index, "flusher is gone, dropping flush request");
        }
    }
}

impl Service for WorkerService {
    type Interface = IncomingPoint;

    async fn run(mut self, mut rx: Receiver<Self::Interface>, mut shutdown: ShutdownHandle) {
        let mut scan = tokio::time::interval(SCAN_INTERVAL);
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                Some(point) = rx.recv() => self.handle_point(point).await,
                _ = scan.tick() => self.flush_ready().await,
            }
        }

        while let Some(point) = rx.try_recv() {
            self.handle_point(point).await;
        }

        let requests = self.cache.flush_all(Instant::now());
        strata_log::debug!(
            worker = self.index,
            metrics = requests.len(),
            "flushing all metrics on shutdown"
        );
        for request in requests {
            self.submit_flush(request).await;
        }
    }
}
