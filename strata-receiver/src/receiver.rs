use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use strata_log::LogError;
use strata_system::{Addr, Controller, Service, ServiceJoinHandle, channel};
use tokio::sync::mpsc;

use crate::aggregator::AggregatorForwarder;
use crate::dispatch::DispatchService;
use crate::flusher::FlusherService;
use crate::paced::PacedService;
use crate::router::{ClusterInboxService, ClusterRouter};
use crate::statsd::ReceiverCounters;
use crate::stats::{NoopReporter, PacedReporter, PipelineGauges, StatReporter, Stats, StatsService};
use crate::worker::WorkerService;
use crate::{
    AggregatorCommand, Cluster, ClusterError, DsCache, Ident, IncomingPoint, MatchingDsSpecFinder,
    PacedMetric, ReceiverConfig, Storage,
};

/// Capacity of the ingress channel for points.
const INGRESS_CAPACITY: usize = 65_536;
/// Capacity of the channel to the aggregation engine.
const AGGREGATOR_CAPACITY: usize = 1024;
/// Capacity of the channel for paced metrics.
const PACED_CAPACITY: usize = 1024;
/// Capacity of each worker's channel.
const WORKER_CAPACITY: usize = 1024;
/// Capacity of the channel to the flusher.
const FLUSHER_CAPACITY: usize = 1024;
/// Time granted to the cluster to announce that this node leaves.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(1);

/// An error returned by the [`Receiver`].
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    /// The configuration cannot be run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A spec rule has an invalid pattern.
    #[error("invalid ds rule pattern `{pattern}`")]
    InvalidRule {
        /// The offending pattern.
        pattern: String,
        /// The regex error.
        #[source]
        source: regex::Error,
    },
    /// The receiver is already running.
    #[error("receiver already started")]
    AlreadyStarted,
    /// The receiver has been stopped and cannot be restarted.
    #[error("receiver has been stopped")]
    Stopped,
}

/// Services that are shut down together.
#[derive(Default)]
struct Stage {
    controller: Controller,
    handles: Vec<ServiceJoinHandle>,
}

impl Stage {
    fn start<S: Service>(&mut self, service: S, rx: strata_system::Receiver<S::Interface>) {
        let handle = service.start_with(rx, self.controller.shutdown_handle());
        self.handles.push(handle);
    }

    async fn stop(self) {
        self.controller.shutdown(None);
        for handle in self.handles {
            let name = handle.name();
            if let Err(error) = handle.await {
                strata_log::error!(service = name, "service failed: {}", LogError(&error));
            }
        }
    }
}

/// Inbound channels created up front, so submissions before [`Receiver::start`] are buffered.
struct Inlets {
    ingress: strata_system::Receiver<IncomingPoint>,
    commands: strata_system::Receiver<AggregatorCommand>,
    paced: strata_system::Receiver<PacedMetric>,
}

enum State {
    Ready(Inlets),
    Running(Vec<Stage>),
    Stopped,
}

/// The ingestion pipeline.
///
/// Points submitted to the receiver are dispatched by identity to a fixed pool of workers, which
/// apply them to the cached state of their metric. Metrics crossing their flush thresholds are
/// written to [`Storage`] by a single flusher at a bounded rate. With a [`Cluster`] attached,
/// points owned by other nodes are forwarded to them instead.
///
/// All submission methods wait while the target channel is full. Once [`stop`](Self::stop) has
/// been called, submissions are dropped.
pub struct Receiver {
    config: ReceiverConfig,
    storage: Arc<dyn Storage>,
    finder: Arc<dyn MatchingDsSpecFinder>,
    aggregator: Option<mpsc::Sender<AggregatorCommand>>,
    cluster: Option<Arc<dyn Cluster>>,
    stopped: Arc<AtomicBool>,
    gauges: Arc<PipelineGauges>,
    stats: Stats,
    ingress: Addr<IncomingPoint>,
    commands: Addr<AggregatorCommand>,
    paced: Addr<PacedMetric>,
    state: Mutex<State>,
}

impl Receiver {
    /// Creates a receiver writing to `storage`.
    ///
    /// Metrics unknown to storage are created with the spec returned by `finder`. Without a
    /// finder, the [`ds_rules`](ReceiverConfig::ds_rules) of the configuration are used.
    pub fn new(
        config: ReceiverConfig,
        storage: Arc<dyn Storage>,
        finder: Option<Arc<dyn MatchingDsSpecFinder>>,
    ) -> Result<Self, ReceiverError> {
        config.validate()?;

        let finder = match finder {
            Some(finder) => finder,
            None => config.spec_finder()?,
        };

        let (ingress, ingress_rx) = channel("ingress", INGRESS_CAPACITY);
        let (commands, commands_rx) = channel("aggregator", AGGREGATOR_CAPACITY);
        let (paced, paced_rx) = channel("paced", PACED_CAPACITY);
        let inlets = Inlets {
            ingress: ingress_rx,
            commands: commands_rx,
            paced: paced_rx,
        };

        let mut receiver = Self {
            config,
            storage,
            finder,
            aggregator: None,
            cluster: None,
            stopped: Arc::new(AtomicBool::new(false)),
            gauges: Arc::default(),
            stats: Stats::noop(),
            ingress,
            commands,
            paced,
            state: Mutex::new(State::Ready(inlets)),
        };
        receiver.stats = Stats::new(receiver.build_reporter(None));

        Ok(receiver)
    }

    /// Attaches the command queue of the aggregation engine.
    ///
    /// Without an engine, aggregator commands and paced sums are dropped.
    pub fn with_aggregator(mut self, queue: mpsc::Sender<AggregatorCommand>) -> Self {
        self.aggregator = Some(queue);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Name prefix for metrics derived by the aggregation engine.
    pub fn stats_name_prefix(&self) -> &str {
        &self.config.stats_name_prefix
    }

    /// Attaches a cluster. Must be called before [`start`](Self::start).
    ///
    /// The address of the local node is appended to the prefix of reported statistics, so that
    /// the statistics of different nodes do not collide.
    pub fn set_cluster(&mut self, cluster: Arc<dyn Cluster>) -> Result<(), ReceiverError> {
        match *self.state.lock() {
            State::Ready(_) => (),
            State::Running(_) => return Err(ReceiverError::AlreadyStarted),
            State::Stopped => return Err(ReceiverError::Stopped),
        }

        let address = cluster
            .local_node()
            .map(|node| node.addr.to_string().replace('.', "_"));

        self.stats = self.stats.with_reporter(self.build_reporter(address.as_deref()));
        self.cluster = Some(cluster);
        Ok(())
    }

    /// Signals the cluster whether this node accepts points. Does nothing without a cluster.
    pub async fn cluster_ready(&self, ready: bool) -> Result<(), ClusterError> {
        match self.cluster {
            Some(ref cluster) => cluster.ready(ready).await,
            None => Ok(()),
        }
    }

    /// Returns the reporter for the receiver's own statistics.
    pub fn stat_reporter(&self) -> Arc<dyn StatReporter> {
        self.stats.reporter().clone()
    }

    /// Adds `value` to the self-reported counter `name`.
    pub fn report_stat_count(&self, name: &str, value: f64) {
        self.stats.reporter().report_count(name, value);
    }

    /// Sets the self-reported gauge `name`.
    pub fn report_stat_gauge(&self, name: &str, value: f64) {
        self.stats.reporter().report_gauge(name, value);
    }

    fn build_reporter(&self, address: Option<&str>) -> Arc<dyn StatReporter> {
        if !self.config.report_stats {
            return Arc::new(NoopReporter);
        }

        let prefix = match (self.config.report_stats_prefix.as_str(), address) {
            (prefix, None) => prefix.to_owned(),
            ("", Some(address)) => address.to_owned(),
            (prefix, Some(address)) => format!("{prefix}.{address}"),
        };

        Arc::new(PacedReporter::new(
            prefix,
            self.paced.clone(),
            self.stopped.clone(),
        ))
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Submits a rate sample.
    pub async fn submit(&self, ident: Ident, timestamp: DateTime<Utc>, value: f64) {
        if self.is_stopped() {
            self.stats.count(ReceiverCounters::PointsDroppedStopped, 1);
            return;
        }

        self.stats.count(ReceiverCounters::PointsReceived, 1);
        let point = IncomingPoint::new(ident, timestamp, value);
        if self.ingress.send(point).await.is_err() {
            self.stats.count(ReceiverCounters::PointsDroppedStopped, 1);
        }
    }

    /// Submits a command for the aggregation engine.
    pub async fn submit_aggregator_command(&self, command: AggregatorCommand) {
        if self.is_stopped() || self.commands.send(command).await.is_err() {
            self.stats.count(ReceiverCounters::AggregatorDropped, 1);
        }
    }

    /// Adds `value` to the paced sum of `ident`.
    pub async fn submit_paced_sum(&self, ident: Ident, value: f64) {
        self.submit_paced(PacedMetric::sum(ident, value)).await;
    }

    /// Sets the paced gauge of `ident` to `value`.
    pub async fn submit_paced_gauge(&self, ident: Ident, value: f64) {
        self.submit_paced(PacedMetric::gauge(ident, value)).await;
    }

    async fn submit_paced(&self, metric: PacedMetric) {
        if self.is_stopped() || self.paced.send(metric).await.is_err() {
            strata_log::trace!("receiver stopped, dropping paced metric");
        }
    }

    /// Spawns all services of the pipeline on the current runtime.
    pub fn start(&self) -> Result<(), ReceiverError> {
        let mut state = self.state.lock();
        let inlets = match std::mem::replace(&mut *state, State::Stopped) {
            State::Ready(inlets) => inlets,
            State::Running(stages) => {
                *state = State::Running(stages);
                return Err(ReceiverError::AlreadyStarted);
            }
            State::Stopped => return Err(ReceiverError::Stopped),
        };

        *state = State::Running(self.spawn(inlets));
        strata_log::info!(
            workers = self.config.workers,
            clustered = self.cluster.is_some(),
            "receiver started"
        );

        Ok(())
    }

    /// Starts every service and returns them grouped in shutdown order.
    fn spawn(&self, inlets: Inlets) -> Vec<Stage> {
        let config = &self.config;
        let stats = &self.stats;

        let mut front = Stage::default();
        let router = match self.cluster {
            Some(ref cluster) => {
                let (outbox, inbox) = cluster.register_channel();
                let inbox_service = ClusterInboxService::new(
                    self.ingress.clone(),
                    cluster.notify_changes(),
                    stats.clone(),
                );
                front.start(inbox_service, inbox);

                ClusterRouter::clustered(
                    cluster.clone(),
                    outbox,
                    config.max_forward_hops,
                    stats.clone(),
                )
            }
            None => ClusterRouter::local(stats.clone()),
        };

        let (_, ticker_rx) = channel("stats", 1);
        let stats_service = StatsService::new(
            config.stat_flush_interval(),
            stats.clone(),
            self.gauges.clone(),
            self.ingress.clone(),
            self.commands.clone(),
            self.paced.clone(),
            self.cluster.clone(),
        );
        front.start(stats_service, ticker_rx);

        let mut paced = Stage::default();
        let paced_service = PacedService::new(
            config.paced_interval(),
            self.commands.clone(),
            self.ingress.clone(),
        );
        paced.start(paced_service, inlets.paced);

        let (flusher_addr, flusher_rx) = channel("flusher", FLUSHER_CAPACITY);
        let mut workers = Stage::default();
        let mut worker_addrs = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let (addr, rx) = channel("worker", WORKER_CAPACITY);
            let cache = DsCache::new(
                self.storage.clone(),
                self.finder.clone(),
                self.gauges.clone(),
            );
            let worker = WorkerService::new(
                index,
                cache,
                config.cache_policy(),
                router.clone(),
                flusher_addr.clone(),
                stats.clone(),
            )
            .with_debug(config.debug);

            workers.start(worker, rx);
            worker_addrs.push(addr);
        }

        let mut dispatch = Stage::default();
        dispatch.start(DispatchService::new(worker_addrs), inlets.ingress);

        let mut flusher = Stage::default();
        let flusher_service = FlusherService::new(
            self.storage.clone(),
            config.max_flush_rate_per_second,
            stats.clone(),
            self.gauges.clone(),
        );
        flusher.start(flusher_service, flusher_rx);

        let mut aggregator = Stage::default();
        let forwarder = AggregatorForwarder::new(self.aggregator.clone(), stats.clone());
        aggregator.start(forwarder, inlets.commands);

        vec![front, paced, dispatch, workers, flusher, aggregator]
    }

    /// Stops the pipeline.
    ///
    /// New submissions are dropped from here on. Every stage drains what it has already accepted
    /// before the next one is shut down, so all accepted points have been handed to storage when
    /// this returns. This includes points submitted before [`start`](Self::start) was ever called.
    /// A clustered node first announces that it is no longer ready and leaves.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, State::Stopped)
        };
        let stages = match previous {
            State::Running(stages) => stages,
            // Points submitted before start are still waiting in the inlets.
            State::Ready(inlets) => self.spawn(inlets),
            State::Stopped => return,
        };

        if let Some(ref cluster) = self.cluster {
            if let Err(error) = cluster.ready(false).await {
                strata_log::warn!("failed to mark node as not ready: {}", LogError(&error));
            }
            if let Err(error) = cluster.leave(LEAVE_TIMEOUT).await {
                strata_log::warn!("failed to leave cluster: {}", LogError(&error));
            }
        }

        for stage in stages {
            stage.stop().await;
        }

        if let Some(ref cluster) = self.cluster {
            if let Err(error) = cluster.shutdown().await {
                strata_log::warn!("failed to shut down cluster: {}", LogError(&error));
            }
        }

        strata_log::info!("receiver stopped");
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if matches!(*self.state.get_mut(), State::Running(_)) {
            strata_log::error!("receiver dropped while running, pending points may be lost");
        }
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("config", &self.config)
            .field("clustered", &self.cluster.is_some())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use chrono::TimeZone;

    use super::*;
    use crate::testutils::MemoryStorage;
    use crate::{ClusterHub, DsSpec, SimpleDsFinder};

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn receiver(config: ReceiverConfig, storage: &MemoryStorage) -> Receiver {
        let spec = DsSpec {
            step: 1,
            heartbeat: 60,
            rras: vec![],
        };

        Receiver::new(
            config,
            Arc::new(storage.clone()),
            Some(Arc::new(SimpleDsFinder::new(spec))),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_at_max_cached_points() {
        strata_test::setup();

        let storage = MemoryStorage::new();
        let config = ReceiverConfig {
            min_cache_duration: 0,
            max_cache_duration: 3_600_000,
            max_cached_points: 256,
            ..Default::default()
        };
        let receiver = receiver(config, &storage);
        receiver.start().unwrap();

        let ident = Ident::named("x");
        for second in 0..300 {
            receiver.submit(ident.clone(), ts(1_000 + second), 1.0).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let flushes = storage.flushes_for(&ident);
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].request.point_count(), 256);

        receiver.stop().await;
        assert_eq!(storage.flushes_for(&ident).len(), 2);
        assert_eq!(storage.sample_count(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_flush_after_max_cache_duration() {
        let storage = MemoryStorage::new();
        let receiver = receiver(ReceiverConfig::default(), &storage);
        receiver.start().unwrap();

        let started = tokio::time::Instant::now();
        let ident = Ident::named("y");
        receiver.submit(ident.clone(), ts(1_000), 1.0).await;

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(storage.flushes().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let flushes = storage.flushes_for(&ident);
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].request.sample_count(), 1);
        assert!(flushes[0].at - started >= Duration::from_secs(5));

        receiver.stop().await;
        assert_eq!(storage.flushes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_everything() {
        let storage = MemoryStorage::new();
        let receiver = receiver(ReceiverConfig::default(), &storage);
        receiver.start().unwrap();

        let points = [("a", 4), ("b", 3), ("c", 3)];
        for (name, count) in points {
            for second in 0..count {
                receiver
                    .submit(Ident::named(name), ts(1_000 + second), 1.0)
                    .await;
            }
        }

        receiver.stop().await;

        assert_eq!(storage.sample_count(), 10);
        for (name, count) in points {
            let flushes = storage.flushes_for(&Ident::named(name));
            let samples: u64 = flushes.iter().map(|f| f.request.sample_count()).sum();
            assert_eq!(samples, count as u64, "metric {name}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_sum_once_per_tick() {
        let storage = MemoryStorage::new();
        let (engine, mut commands) = mpsc::channel(16);
        let receiver = receiver(ReceiverConfig::default(), &storage).with_aggregator(engine);
        receiver.start().unwrap();

        for _ in 0..3 {
            receiver.submit_paced_sum(Ident::named("z"), 5.0).await;
        }

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let command = commands.try_recv().unwrap();
        assert_eq!(command, AggregatorCommand::counter(Ident::named("z"), 15.0));
        assert!(commands.try_recv().is_err());

        receiver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_gauge_becomes_point() {
        let storage = MemoryStorage::new();
        let receiver = receiver(ReceiverConfig::default(), &storage);
        receiver.start().unwrap();

        receiver.submit_paced_gauge(Ident::named("g"), 3.0).await;
        receiver.submit_paced_gauge(Ident::named("g"), 7.0).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        receiver.stop().await;

        let flushes = storage.flushes_for(&Ident::named("g"));
        assert_eq!(flushes.len(), 1);
        let slots = &flushes[0].request.updates[0].slots;
        assert_eq!(slots.values().next().unwrap().value(), 7.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_flush_rate() {
        let storage = MemoryStorage::new();
        let config = ReceiverConfig {
            min_cache_duration: 0,
            max_cached_points: 1,
            max_flush_rate_per_second: 10,
            ..Default::default()
        };
        let receiver = receiver(config, &storage);
        receiver.start().unwrap();

        for index in 0..8 {
            receiver
                .submit(Ident::named(format!("m{index}")), ts(1_000), 1.0)
                .await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let flushes = storage.flushes();
        assert_eq!(flushes.len(), 8);
        for pair in flushes.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(100));
        }

        receiver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_after_stop() {
        let storage = MemoryStorage::new();
        let receiver = receiver(ReceiverConfig::default(), &storage);
        receiver.start().unwrap();
        receiver.stop().await;

        let captures = strata_statsd::with_capturing_test_client(|| {
            futures::executor::block_on(receiver.submit(Ident::named("late"), ts(1_000), 1.0));
        });

        assert_eq!(captures, ["receiver.points.dropped.stopped:1|c"]);
        assert!(storage.flushes().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let storage = MemoryStorage::new();
        let mut receiver = receiver(ReceiverConfig::default(), &storage);
        receiver.start().unwrap();

        assert!(matches!(
            receiver.start(),
            Err(ReceiverError::AlreadyStarted)
        ));
        assert!(matches!(
            receiver.set_cluster(Arc::new(crate::SingleNode::default())),
            Err(ReceiverError::AlreadyStarted)
        ));

        receiver.stop().await;
        assert!(matches!(receiver.start(), Err(ReceiverError::Stopped)));
    }

    #[test]
    fn test_zero_workers() {
        let config = ReceiverConfig {
            workers: 0,
            ..Default::default()
        };
        let result = Receiver::new(config, Arc::new(MemoryStorage::new()), None);
        assert!(matches!(result, Err(ReceiverError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stat_prefix_includes_node_address() {
        let storage = MemoryStorage::new();
        let (engine, mut commands) = mpsc::channel(64);
        let config = ReceiverConfig {
            report_stats: true,
            ..Default::default()
        };
        let mut receiver = receiver(config, &storage).with_aggregator(engine);

        let hub = ClusterHub::new();
        let node = hub.join("a", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        receiver.set_cluster(Arc::new(node)).unwrap();
        receiver.start().unwrap();

        receiver.report_stat_count("custom", 2.0);
        receiver.report_stat_count("ignored", 0.0);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let mut names = Vec::new();
        while let Ok(command) = commands.try_recv() {
            names.extend(command.ident.name().map(str::to_owned));
        }
        assert!(names.contains(&"strata.10_0_0_1.custom".to_owned()));
        assert!(!names.iter().any(|name| name.ends_with(".ignored")));

        receiver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_nodes_forward_to_owner() {
        strata_test::setup();

        let hub = ClusterHub::new();
        let node_a = hub.join("a", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let node_b = hub.join("b", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        let storage_a = MemoryStorage::new();
        let storage_b = MemoryStorage::new();
        let mut receiver_a = receiver(ReceiverConfig::default(), &storage_a);
        let mut receiver_b = receiver(ReceiverConfig::default(), &storage_b);
        receiver_a.set_cluster(Arc::new(node_a.clone())).unwrap();
        receiver_b.set_cluster(Arc::new(node_b.clone())).unwrap();

        receiver_a.start().unwrap();
        receiver_b.start().unwrap();
        receiver_a.cluster_ready(true).await.unwrap();
        receiver_b.cluster_ready(true).await.unwrap();

        let idents: Vec<_> = (0..20).map(|i| Ident::named(format!("m{i}"))).collect();
        let owners: Vec<_> = idents
            .iter()
            .map(|ident| node_a.owner_nodes(ident)[0].name.clone())
            .collect();

        for ident in &idents {
            receiver_a.submit(ident.clone(), ts(1_000), 1.0).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        receiver_a.stop().await;
        receiver_b.stop().await;

        for (ident, owner) in idents.iter().zip(&owners) {
            let (owning, other) = match owner.as_str() {
                "a" => (&storage_a, &storage_b),
                _ => (&storage_b, &storage_a),
            };
            assert_eq!(owning.flushes_for(ident).len(), 1, "{ident} owned by {owner}");
            assert!(other.flushes_for(ident).is_empty(), "{ident} owned by {owner}");
        }
        assert_eq!(storage_a.sample_count() + storage_b.sample_count(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hop_limit_drops() {
        let hub = ClusterHub::new();
        let node_a = hub.join("a", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let node_b = hub.join("b", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        node_b.ready(true).await.unwrap();
        let (_, mut inbox_b) = node_b.register_channel();

        let storage = MemoryStorage::new();
        let config = ReceiverConfig {
            max_forward_hops: 0,
            ..Default::default()
        };
        let mut receiver = receiver(config, &storage);
        receiver.set_cluster(Arc::new(node_a)).unwrap();
        receiver.start().unwrap();

        receiver.submit(Ident::named("foo"), ts(1_000), 1.0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        receiver.stop().await;

        assert!(storage.flushes().is_empty());
        assert!(inbox_b.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ownership_change_without_migration() {
        let hub = ClusterHub::new();
        let node_a = hub.join("a", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let node_b = hub.join("b", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        let storage_a = MemoryStorage::new();
        let storage_b = MemoryStorage::new();
        let mut receiver_a = receiver(ReceiverConfig::default(), &storage_a);
        let mut receiver_b = receiver(ReceiverConfig::default(), &storage_b);
        receiver_a.set_cluster(Arc::new(node_a.clone())).unwrap();
        receiver_b.set_cluster(Arc::new(node_b.clone())).unwrap();

        receiver_a.start().unwrap();
        receiver_b.start().unwrap();
        receiver_a.cluster_ready(true).await.unwrap();
        receiver_b.cluster_ready(true).await.unwrap();

        let ident = (0..)
            .map(|i| Ident::named(format!("m{i}")))
            .find(|ident| node_a.owner_nodes(ident)[0].name == "b")
            .unwrap();

        receiver_a.submit(ident.clone(), ts(1_000), 1.0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Once b is no longer ready, a owns the metric and starts from scratch.
        receiver_b.cluster_ready(false).await.unwrap();
        receiver_a.submit(ident.clone(), ts(1_001), 2.0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        receiver_a.stop().await;
        receiver_b.stop().await;

        let flushed = |storage: &MemoryStorage| -> Vec<f64> {
            storage
                .flushes_for(&ident)
                .iter()
                .flat_map(|flush| flush.request.updates[0].slots.values().map(|s| s.value()))
                .collect()
        };
        assert_eq!(flushed(&storage_b), [1.0]);
        assert_eq!(flushed(&storage_a), [2.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start() {
        let storage = MemoryStorage::new();
        let receiver = receiver(ReceiverConfig::default(), &storage);

        for second in 0..3 {
            receiver
                .submit(Ident::named("early"), ts(1_000 + second), 1.0)
                .await;
        }
        receiver.stop().await;

        assert_eq!(storage.sample_count(), 3);
        assert!(matches!(receiver.start(), Err(ReceiverError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_stats_count_every_point() {
        let storage = MemoryStorage::new();
        let (engine, mut commands) = mpsc::channel(1024);
        let config = ReceiverConfig {
            report_stats: true,
            stat_flush_interval: 1000,
            ..Default::default()
        };
        let receiver = receiver(config, &storage).with_aggregator(engine);
        receiver.start().unwrap();

        for index in 0..5000 {
            let ident = Ident::named(format!("m{}", index % 50));
            receiver.submit(ident, ts(1_000 + index / 50), 1.0).await;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        receiver.stop().await;

        let mut received = 0.0;
        while let Ok(command) = commands.try_recv() {
            if command.ident.name() == Some("strata.receiver.points.received") {
                received += command.value;
            }
        }
        assert_eq!(received, 5000.0);
    }
}
