use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use strata_log::LogError;
use strata_statsd::metric;
use strata_system::{Interface, Receiver, Service, ShutdownHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::statsd::{ReceiverCounters, ReceiverDistributions, ReceiverTimers};
use crate::stats::{PipelineGauges, Stats};
use crate::{FlushRequest, Ident, Storage};

/// Storage writes taking at least this long are logged.
const SLOW_FLUSH: Duration = Duration::from_secs(1);

impl Interface for FlushRequest {}

/// Pending writes in arrival order, at most one per metric.
#[derive(Debug, Default)]
struct FlushQueue {
    order: VecDeque<Ident>,
    requests: HashMap<Ident, FlushRequest>,
}

impl FlushQueue {
    /// Queues a request. Returns `true` if it was merged into a queued request.
    fn push(&mut self, request: FlushRequest) -> bool {
        match self.requests.entry(request.ident.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().merge(request);
                true
            }
            Entry::Vacant(entry) => {
                self.order.push_back(request.ident.clone());
                entry.insert(request);
                false
            }
        }
    }

    fn pop(&mut self) -> Option<FlushRequest> {
        while let Some(ident) = self.order.pop_front() {
            if let Some(request) = self.requests.remove(&ident) {
                return Some(request);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.requests.len()
    }

    fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Writes flush requests to storage at a bounded rate.
///
/// At most one write is started per `1 / max_flush_rate_per_second`. Requests for a metric that
/// is already queued are merged into the queued entry, which keeps its position. On shutdown the
/// queue is written out without pacing.
pub struct FlusherService {
    storage: Arc<dyn Storage>,
    period: Duration,
    queue: FlushQueue,
    stats: Stats,
    gauges: Arc<PipelineGauges>,
}

impl FlusherService {
    /// Creates the flusher for the given write rate.
    pub fn new(
        storage: Arc<dyn Storage>,
        max_flush_rate_per_second: u32,
        stats: Stats,
        gauges: Arc<PipelineGauges>,
    ) -> Self {
        let period = Duration::from_secs(1) / max_flush_rate_per_second.max(1);

        Self {
            storage,
            period,
            queue: FlushQueue::default(),
            stats,
            gauges,
        }
    }

    fn enqueue(&mut self, request: FlushRequest) {
        if self.queue.push(request) {
            self.stats.count(ReceiverCounters::FlushesCoalesced, 1);
        }
        self.gauges.set_flush_queue(self.queue.len());
    }

    async fn flush_next(&mut self) {
        if let Some(request) = self.queue.pop() {
            self.gauges.set_flush_queue(self.queue.len());
            self.write(request).await;
        }
    }

    async fn write(&self, request: FlushRequest) {
        let points = request.point_count();
        let start = Instant::now();
        let result = self.storage.flush(&request).await;
        let elapsed = start.elapsed();

        metric!(timer(ReceiverTimers::FlushDuration) = elapsed);
        if elapsed >= SLOW_FLUSH {
            strata_log::warn!(
                ident = %request.ident,
                points,
                "slow storage write took {elapsed:?}"
            );
        }

        match result {
            Ok(()) => {
                self.stats.count(ReceiverCounters::Flushes, 1);
                self.stats.count(ReceiverCounters::FlushedPoints, points as u64);
                metric!(distribution(ReceiverDistributions::FlushSize) = points as u64);
            }
            Err(error) => {
                self.stats.count(ReceiverCounters::FlushErrors, 1);
                strata_log::error!(
                    ident = %request.ident,
                    points,
                    "failed to flush to storage: {}",
                    LogError(&error)
                );
            }
        }
    }
}

impl Service for FlusherService {
    type Interface = FlushRequest;

    async fn run(mut self, mut rx: Receiver<Self::Interface>, mut shutdown: ShutdownHandle) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                _ = ticker.tick(), if !self.queue.is_empty() => self.flush_next().await,
                Some(request) = rx.recv() => self.enqueue(request),
            }
        }

        while let Some(request) = rx.try_recv() {
            self.enqueue(request);
        }

        if !self.queue.is_empty() {
            strata_log::debug!("writing {} queued flushes on shutdown", self.queue.len());
        }
        while let Some(request) = self.queue.pop() {
            self.write(request).await;
        }
        self.gauges.set_flush_queue(0);
    }
}
