//! The ingestion front-end of strata.
//!
//! A [`Receiver`] accepts points for metrics identified by a set of tags ([`Ident`]) and keeps
//! the recent state of every metric in memory. Points are dispatched to a fixed pool of workers by
//! the hash of their identity, so each metric is owned by exactly one worker. A worker
//! consolidates points into the pending slots of the metric's archives and hands them to a single
//! flusher once the [`CachePolicy`] says so. The flusher writes to [`Storage`] at a bounded rate,
//! coalescing requests for metrics that are still waiting.
//!
//! ## Clustering
//!
//! With a [`Cluster`] attached, a point whose owner is another node is forwarded to that node
//! instead of being applied locally. Every forward increments the hop count of the point, and
//! points exceeding [`ReceiverConfig::max_forward_hops`] are dropped, which prevents loops while
//! membership is in flux.
//!
//! ## Paced Metrics
//!
//! High frequency updates can be submitted as paced sums or gauges. These are accumulated in
//! memory and emitted once per [`ReceiverConfig::paced_interval`]: sums as counter commands for
//! the aggregation engine, gauges as regular points.
//!
//! ## Statistics
//!
//! The receiver emits its own statistics to statsd via [`strata_statsd`]. When
//! [`ReceiverConfig::report_stats`] is enabled, the same statistics are also fed back into the
//! pipeline as paced metrics, see [`PacedReporter`].
#![warn(missing_docs)]

mod aggregator;
mod cache;
mod cluster;
mod config;
mod dispatch;
mod ds;
mod flusher;
mod ident;
mod paced;
mod point;
mod policy;
mod receiver;
mod router;
mod spec;
pub mod stats;
pub mod statsd;
mod storage;
mod worker;

#[cfg(any(test, feature = "test"))]
pub mod testutils;

pub use self::aggregator::{AggregatorCommand, AggregatorCommandKind};
pub use self::cache::DsCache;
pub use self::cluster::{
    Cluster, ClusterError, ClusterHub, ClusterMsg, Node, SingleNode, StaticCluster,
};
pub use self::config::ReceiverConfig;
pub use self::ds::{ApplyError, ArchiveUpdate, DataSource, FlushRequest, PendingSlot};
pub use self::ident::{Ident, NAME_TAG};
pub use self::paced::{PacedKind, PacedMetric};
pub use self::point::IncomingPoint;
pub use self::policy::CachePolicy;
pub use self::receiver::{Receiver, ReceiverError};
pub use self::router::{ForwardedPoint, Route};
pub use self::spec::{
    ConsolidationFn, DsRule, DsSpec, MatchingDsSpecFinder, RegexDsFinder, RraSpec,
    SimpleDsFinder,
};
pub use self::stats::{NoopReporter, PacedReporter, PipelineGauges, StatReporter};
pub use self::storage::{Storage, StorageError};
