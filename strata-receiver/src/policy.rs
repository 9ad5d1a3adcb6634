use std::time::Duration;

use tokio::time::Instant;

use crate::DataSource;

/// Decides when the pending points of a metric are handed off for flushing.
///
/// A metric is flushed once it has pending points, at least `min_cache_duration` has passed since
/// its last flush, and either `max_cache_duration` has passed or it holds `max_cached_points`
/// points. The minimum duration always wins, even when configured above the maximum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    /// Minimum time between two flushes of the same metric.
    pub min_cache_duration: Duration,
    /// Time after which pending points are flushed regardless of their number.
    pub max_cache_duration: Duration,
    /// Number of pending points that triggers a flush.
    pub max_cached_points: usize,
}

impl CachePolicy {
    /// Returns `true` if `ds` should be flushed at `now`.
    pub fn should_flush(&self, ds: &DataSource, now: Instant) -> bool {
        if !ds.has_pending() {
            return false;
        }

        let since_flush = now.saturating_duration_since(ds.last_flush());
        if since_flush < self.min_cache_duration {
            return false;
        }

        since_flush >= self.max_cache_duration || ds.point_count() >= self.max_cached_points
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            min_cache_duration: Duration::from_secs(1),
            max_cache_duration: Duration::from_secs(5),
            max_cached_points: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{DsSpec, Ident};

    fn data_source(points: usize, created: Instant) -> DataSource {
        let spec = DsSpec {
            step: 1,
            heartbeat: 60,
            rras: vec![],
        };
        let mut ds = DataSource::new(Ident::named("foo"), spec, created);
        for offset in 0..points {
            let timestamp = Utc.timestamp_opt(1_000 + offset as i64, 0).unwrap();
            ds.apply(timestamp, 1.0, created).unwrap();
        }
        ds
    }

    #[test]
    fn test_nothing_pending() {
        let created = Instant::now();
        let ds = data_source(0, created);
        let policy = CachePolicy::default();

        assert!(!policy.should_flush(&ds, created + Duration::from_secs(3600)));
    }

    #[test]
    fn test_max_duration() {
        let created = Instant::now();
        let ds = data_source(1, created);
        let policy = CachePolicy::default();

        assert!(!policy.should_flush(&ds, created + Duration::from_millis(4999)));
        assert!(policy.should_flush(&ds, created + Duration::from_secs(5)));
    }

    #[test]
    fn test_max_points() {
        let created = Instant::now();
        let policy = CachePolicy {
            min_cache_duration: Duration::ZERO,
            ..Default::default()
        };

        assert!(!policy.should_flush(&data_source(255, created), created));
        assert!(policy.should_flush(&data_source(256, created), created));
    }

    #[test]
    fn test_min_always_wins() {
        let created = Instant::now();
        let ds = data_source(1000, created);
        let policy = CachePolicy {
            min_cache_duration: Duration::from_secs(10),
            max_cache_duration: Duration::from_secs(1),
            max_cached_points: 1,
        };

        for millis in [0, 500, 1000, 5000, 9999] {
            let now = created + Duration::from_millis(millis);
            assert!(!policy.should_flush(&ds, now), "flushed after {millis}ms");
        }
        assert!(policy.should_flush(&ds, created + Duration::from_secs(10)));
    }

    #[test]
    fn test_measured_from_last_flush() {
        let created = Instant::now();
        let mut ds = data_source(1, created);
        let policy = CachePolicy::default();

        let flushed = created + Duration::from_secs(5);
        assert!(policy.should_flush(&ds, flushed));
        ds.take_flush(flushed);

        let timestamp = Utc.timestamp_opt(2_000, 0).unwrap();
        ds.apply(timestamp, 1.0, flushed).unwrap();
        assert!(!policy.should_flush(&ds, flushed + Duration::from_secs(4)));
        assert!(policy.should_flush(&ds, flushed + Duration::from_secs(5)));
    }
}
