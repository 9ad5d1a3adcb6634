use strata_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Counter metrics for the receiver.
///
/// When stat reporting is enabled, these are also fed back into the pipeline under the
/// configured prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverCounters {
    /// Incremented for every point accepted through the submission API.
    PointsReceived,

    /// Points submitted after the receiver was stopped.
    PointsDroppedStopped,

    /// Points not owned by this node that already used up their forwarding hops.
    PointsDroppedHops,

    /// Points whose identity is unknown to storage and not matched by the spec finder.
    PointsUnmatched,

    /// Points older than the newest point of their metric, or with non-finite values.
    PointsRejected,

    /// Points applied to a local metric.
    PointsApplied,

    /// Point copies sent to the owning node.
    PointsForwarded,

    /// Point copies that could not be sent to an owning node.
    ///
    /// Tagged by `reason`: either the node is not ready or the cluster transport is gone.
    PointsForwardFailed,

    /// Points received from other nodes.
    ForwardedReceived,

    /// Cluster messages that did not decode to a point.
    ForwardedInvalid,

    /// Failed lookups of a data source in storage.
    FetchErrors,

    /// Successful writes to storage.
    Flushes,

    /// Pending slots written to storage.
    FlushedPoints,

    /// Failed writes to storage. The points of a failed write are lost.
    FlushErrors,

    /// Flush requests merged into an already queued request for the same metric.
    FlushesCoalesced,

    /// Commands passed on to the aggregation engine.
    AggregatorCommands,

    /// Commands dropped because no aggregation engine is attached or it has shut down.
    AggregatorDropped,

    /// Observed changes of cluster membership.
    ClusterChanges,
}

impl ReceiverCounters {
    /// Every counter, in declaration order.
    pub(crate) const ALL: [Self; 18] = [
        Self::PointsReceived,
        Self::PointsDroppedStopped,
        Self::PointsDroppedHops,
        Self::PointsUnmatched,
        Self::PointsRejected,
        Self::PointsApplied,
        Self::PointsForwarded,
        Self::PointsForwardFailed,
        Self::ForwardedReceived,
        Self::ForwardedInvalid,
        Self::FetchErrors,
        Self::Flushes,
        Self::FlushedPoints,
        Self::FlushErrors,
        Self::FlushesCoalesced,
        Self::AggregatorCommands,
        Self::AggregatorDropped,
        Self::ClusterChanges,
    ];
}

impl CounterMetric for ReceiverCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::PointsReceived => "receiver.points.received",
            Self::PointsDroppedStopped => "receiver.points.dropped.stopped",
            Self::PointsDroppedHops => "receiver.points.dropped.hops",
            Self::PointsUnmatched => "receiver.points.unmatched",
            Self::PointsRejected => "receiver.points.rejected",
            Self::PointsApplied => "receiver.points.applied",
            Self::PointsForwarded => "receiver.points.forwarded",
            Self::PointsForwardFailed => "receiver.points.forward_failed",
            Self::ForwardedReceived => "receiver.forwarded.received",
            Self::ForwardedInvalid => "receiver.forwarded.invalid",
            Self::FetchErrors => "receiver.fetch.errors",
            Self::Flushes => "receiver.flush.count",
            Self::FlushedPoints => "receiver.flush.points",
            Self::FlushErrors => "receiver.flush.errors",
            Self::FlushesCoalesced => "receiver.flush.coalesced",
            Self::AggregatorCommands => "receiver.aggregator.commands",
            Self::AggregatorDropped => "receiver.aggregator.dropped",
            Self::ClusterChanges => "receiver.cluster.changes",
        }
    }
}

/// Gauge metrics for the receiver, emitted every stat interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverGauges {
    /// Number of data sources held by all workers.
    CacheSize,

    /// Number of metrics waiting in the flush queue.
    FlushQueue,

    /// Number of cluster members. Only emitted when clustered.
    ClusterMembers,
}

impl GaugeMetric for ReceiverGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::CacheSize => "receiver.cache.size",
            Self::FlushQueue => "receiver.flush.queue",
            Self::ClusterMembers => "receiver.cluster.members",
        }
    }
}

/// Timer metrics for the receiver.
pub enum ReceiverTimers {
    /// Time in milliseconds spent in a single storage write.
    FlushDuration,
}

impl TimerMetric for ReceiverTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushDuration => "receiver.flush.duration",
        }
    }
}

/// Distribution metrics for the receiver.
pub enum ReceiverDistributions {
    /// Number of pending slots carried by a single storage write.
    FlushSize,
}

impl DistributionMetric for ReceiverDistributions {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushSize => "receiver.flush.size",
        }
    }
}
