use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CachePolicy, DsRule, DsSpec, MatchingDsSpecFinder, ReceiverError, RegexDsFinder, SimpleDsFinder};

/// Parameters used by the [`Receiver`](crate::Receiver).
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// The number of workers applying points in parallel.
    ///
    /// Defaults to `4`. Must be positive. Metrics are assigned to workers by the hash of their
    /// identity, so changing this requires a restart.
    pub workers: usize,

    /// Minimum time in milliseconds between two flushes of the same metric.
    ///
    /// Defaults to `1000`. This floor applies to every flush trigger, even when it is larger than
    /// [`max_cache_duration`](Self::max_cache_duration).
    pub min_cache_duration: u64,

    /// Time in milliseconds after which pending points of a metric are flushed.
    ///
    /// Defaults to `5000`.
    pub max_cache_duration: u64,

    /// Number of pending points that trigger a flush of a metric.
    ///
    /// Defaults to `256`.
    pub max_cached_points: usize,

    /// Maximum number of storage writes per second across all metrics.
    ///
    /// Defaults to `100`. Must be positive.
    pub max_flush_rate_per_second: u32,

    /// Interval in milliseconds at which gauges and accumulated counters about the receiver are
    /// reported.
    ///
    /// Defaults to `10000`. Statsd receives counters immediately, this only paces what
    /// [`report_stats`](Self::report_stats) feeds back into the pipeline.
    pub stat_flush_interval: u64,

    /// Name prefix for metrics derived by the aggregation engine.
    ///
    /// Defaults to `"stats"`.
    pub stats_name_prefix: String,

    /// Feed the receiver's own statistics back into the pipeline.
    ///
    /// Defaults to `false`. Statistics are always emitted to statsd when it is configured.
    pub report_stats: bool,

    /// Name prefix for statistics fed back into the pipeline.
    ///
    /// Defaults to `"strata"`. When clustered, the address of the local node is appended.
    pub report_stats_prefix: String,

    /// Interval in milliseconds at which paced metrics are emitted.
    ///
    /// Defaults to `1000`.
    pub paced_interval: u64,

    /// Number of times a point may be forwarded between nodes before it is dropped.
    ///
    /// Defaults to `1`.
    pub max_forward_hops: u32,

    /// Log every point at trace level.
    pub debug: bool,

    /// Rules for creating metrics unknown to storage, matched against the metric name in order.
    ///
    /// Metrics not matching any rule use the default spec. Without rules, every well-formed
    /// metric uses the default spec.
    pub ds_rules: Vec<DsRule>,
}

impl ReceiverConfig {
    /// Checks the configuration for values the receiver cannot run with.
    pub fn validate(&self) -> Result<(), ReceiverError> {
        if self.workers == 0 {
            return Err(ReceiverError::InvalidConfig("workers must be positive"));
        }

        if self.max_flush_rate_per_second == 0 {
            return Err(ReceiverError::InvalidConfig(
                "max_flush_rate_per_second must be positive",
            ));
        }

        Ok(())
    }

    /// Returns the per-metric flush policy.
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            min_cache_duration: Duration::from_millis(self.min_cache_duration),
            max_cache_duration: Duration::from_millis(self.max_cache_duration),
            max_cached_points: self.max_cached_points,
        }
    }

    /// Returns the interval of the stat ticker.
    pub fn stat_flush_interval(&self) -> Duration {
        Duration::from_millis(self.stat_flush_interval)
    }

    /// Returns the emission interval of paced metrics.
    pub fn paced_interval(&self) -> Duration {
        Duration::from_millis(self.paced_interval)
    }

    /// Builds the spec finder described by [`ds_rules`](Self::ds_rules).
    pub fn spec_finder(&self) -> Result<Arc<dyn MatchingDsSpecFinder>, ReceiverError> {
        if self.ds_rules.is_empty() {
            return Ok(Arc::new(SimpleDsFinder::new(DsSpec::default())));
        }

        let finder = RegexDsFinder::new(&self.ds_rules, Some(DsSpec::default()))?;
        Ok(Arc::new(finder))
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            min_cache_duration: 1000,
            max_cache_duration: 5000,
            max_cached_points: 256,
            max_flush_rate_per_second: 100,
            stat_flush_interval: 10_000,
            stats_name_prefix: "stats".to_owned(),
            report_stats: false,
            report_stats_prefix: "strata".to_owned(),
            paced_interval: 1000,
            max_forward_hops: 1,
            debug: false,
            ds_rules: Vec::new(),
        }
    }
}
