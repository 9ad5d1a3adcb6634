use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::{ConsolidationFn, DsSpec, Ident, RraSpec};

/// An error returned when a point cannot be applied to a [`DataSource`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    /// The point is older than the newest point already applied.
    #[error("point at {timestamp} is older than last update at {last_update}")]
    Stale {
        /// Timestamp of the rejected point.
        timestamp: DateTime<Utc>,
        /// Timestamp of the newest applied point.
        last_update: DateTime<Utc>,
    },
    /// The value is NaN or infinite.
    #[error("value {0} is not finite")]
    NotFinite(f64),
}

/// A consolidated archive slot that has not been written to storage yet.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingSlot {
    value: f64,
    count: u32,
}

impl PendingSlot {
    fn new(value: f64) -> Self {
        Self { value, count: 1 }
    }

    /// The consolidated value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The number of points consolidated into this slot.
    pub fn count(&self) -> u32 {
        self.count
    }

    fn merge(&mut self, cf: ConsolidationFn, other: PendingSlot) {
        self.value = cf.merge(self.value, self.count, other.value, other.count);
        self.count = self.count.saturating_add(other.count);
    }
}

/// Pending slots of one archive, keyed by slot start in unix seconds.
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveUpdate {
    /// The archive these slots belong to.
    pub rra: RraSpec,
    /// Consolidated slots by slot start.
    pub slots: BTreeMap<i64, PendingSlot>,
}

impl ArchiveUpdate {
    fn merge(&mut self, other: ArchiveUpdate) {
        let cf = self.rra.cf;
        for (start, slot) in other.slots {
            self.slots
                .entry(start)
                .and_modify(|pending| pending.merge(cf, slot))
                .or_insert(slot);
        }
    }
}

/// Points drained from a [`DataSource`] on their way to storage.
#[derive(Clone, Debug, PartialEq)]
pub struct FlushRequest {
    /// The metric these points belong to.
    pub ident: Ident,
    /// The creation spec, so storage can create the series on first write.
    pub spec: Arc<DsSpec>,
    /// Pending slots per archive, in the order of [`DsSpec::archives`].
    pub updates: Vec<ArchiveUpdate>,
    /// Timestamp of the newest point included.
    pub last_update: DateTime<Utc>,
}

impl FlushRequest {
    /// Returns the number of pending slots across all archives.
    pub fn point_count(&self) -> usize {
        self.updates.iter().map(|update| update.slots.len()).sum()
    }

    /// Returns the number of raw points consolidated into this request's base archive.
    pub fn sample_count(&self) -> u64 {
        self.updates.first().map_or(0, |update| {
            update.slots.values().map(|s| u64::from(s.count)).sum()
        })
    }

    /// Merges a later request for the same metric into this one.
    pub(crate) fn merge(&mut self, other: FlushRequest) {
        debug_assert_eq!(self.ident, other.ident);

        for (update, other) in self.updates.iter_mut().zip(other.updates) {
            update.merge(other);
        }
        self.last_update = self.last_update.max(other.last_update);
    }
}

/// The in-memory state of one metric.
///
/// Points are consolidated into the pending slots of every archive as they arrive. The state is
/// owned by exactly one worker and handed to storage as a [`FlushRequest`].
#[derive(Debug)]
pub struct DataSource {
    ident: Ident,
    spec: Arc<DsSpec>,
    archives: Vec<ArchiveUpdate>,
    last_update: Option<DateTime<Utc>>,
    last_flush: Instant,
    oldest_unflushed: Option<Instant>,
}

impl DataSource {
    /// Creates an empty data source. `now` counts as its last flush.
    pub fn new(ident: Ident, spec: DsSpec, now: Instant) -> Self {
        let archives = spec
            .archives()
            .into_iter()
            .map(|rra| ArchiveUpdate {
                rra,
                slots: BTreeMap::new(),
            })
            .collect();

        Self {
            ident,
            spec: Arc::new(spec),
            archives,
            last_update: None,
            last_flush: now,
            oldest_unflushed: None,
        }
    }

    /// The identity of this metric.
    pub fn ident(&self) -> &Ident {
        &self.ident
    }

    /// The creation spec of this metric.
    pub fn spec(&self) -> &DsSpec {
        &self.spec
    }

    /// Timestamp of the newest applied point.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// When pending points were last handed off for flushing.
    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }

    /// When the oldest pending point was applied.
    pub fn oldest_unflushed(&self) -> Option<Instant> {
        self.oldest_unflushed
    }

    /// Returns the number of pending slots across all archives.
    pub fn point_count(&self) -> usize {
        self.archives.iter().map(|archive| archive.slots.len()).sum()
    }

    /// Returns `true` if there are points waiting to be flushed.
    pub fn has_pending(&self) -> bool {
        self.archives.iter().any(|archive| !archive.slots.is_empty())
    }

    /// Consolidates a point into every archive.
    pub fn apply(
        &mut self,
        timestamp: DateTime<Utc>,
        value: f64,
        now: Instant,
    ) -> Result<(), ApplyError> {
        if !value.is_finite() {
            return Err(ApplyError::NotFinite(value));
        }

        if let Some(last_update) = self.last_update {
            if timestamp < last_update {
                return Err(ApplyError::Stale {
                    timestamp,
                    last_update,
                });
            }
        }

        let seconds = timestamp.timestamp();
        for archive in &mut self.archives {
            let cf = archive.rra.cf;
            let step = i64::try_from(archive.rra.step.max(1)).unwrap_or(i64::MAX);
            let start = seconds.div_euclid(step) * step;

            archive
                .slots
                .entry(start)
                .and_modify(|slot| slot.merge(cf, PendingSlot::new(value)))
                .or_insert_with(|| PendingSlot::new(value));
        }

        self.last_update = Some(timestamp);
        self.oldest_unflushed.get_or_insert(now);
        Ok(())
    }

    /// Drains all pending points into a [`FlushRequest`].
    ///
    /// Returns `None` if nothing is pending. Otherwise `now` becomes the last flush.
    pub fn take_flush(&mut self, now: Instant) -> Option<FlushRequest> {
        if !self.has_pending() {
            return None;
        }

        let updates = self
            .archives
            .iter_mut()
            .map(|archive| ArchiveUpdate {
                rra: archive.rra.clone(),
                slots: std::mem::take(&mut archive.slots),
            })
            .collect();

        self.last_flush = now;
        self.oldest_unflushed = None;

        Some(FlushRequest {
            ident: self.ident.clone(),
            spec: self.spec.clone(),
            updates,
            last_update: self.last_update.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn two_archives() -> DsSpec {
        DsSpec {
            step: 10,
            heartbeat: 600,
            rras: vec![
                RraSpec {
                    cf: ConsolidationFn::Average,
                    step: 10,
                    rows: 60,
                },
                RraSpec {
                    cf: ConsolidationFn::Max,
                    step: 60,
                    rows: 60,
                },
            ],
        }
    }

    #[test]
    fn test_apply_consolidates() {
        let now = Instant::now();
        let mut ds = DataSource::new(Ident::named("foo"), two_archives(), now);

        ds.apply(ts(1000), 1.0, now).unwrap();
        ds.apply(ts(1005), 3.0, now).unwrap();
        ds.apply(ts(1015), 10.0, now).unwrap();

        // Two 10s slots plus one 60s slot.
        assert_eq!(ds.point_count(), 3);

        let request = ds.take_flush(now).unwrap();
        let base = &request.updates[0].slots;
        assert_eq!(base[&1000].value(), 2.0);
        assert_eq!(base[&1000].count(), 2);
        assert_eq!(base[&1010].value(), 10.0);

        let coarse = &request.updates[1].slots;
        assert_eq!(coarse[&960].value(), 10.0);
        assert_eq!(request.sample_count(), 3);
        assert_eq!(request.last_update, ts(1015));
    }

    #[test]
    fn test_rejects_stale() {
        let now = Instant::now();
        let mut ds = DataSource::new(Ident::named("foo"), two_archives(), now);

        ds.apply(ts(1000), 1.0, now).unwrap();
        ds.apply(ts(1000), 2.0, now).unwrap();

        let error = ds.apply(ts(999), 1.0, now).unwrap_err();
        assert_eq!(
            error,
            ApplyError::Stale {
                timestamp: ts(999),
                last_update: ts(1000)
            }
        );
        assert_eq!(ds.last_update(), Some(ts(1000)));
    }

    #[test]
    fn test_rejects_non_finite() {
        let now = Instant::now();
        let mut ds = DataSource::new(Ident::named("foo"), two_archives(), now);

        assert!(ds.apply(ts(1000), f64::NAN, now).is_err());
        assert!(ds.apply(ts(1000), f64::INFINITY, now).is_err());
        assert!(!ds.has_pending());
    }

    #[test]
    fn test_huge_step_single_slot() {
        let now = Instant::now();
        let spec = DsSpec {
            step: u64::MAX,
            heartbeat: 600,
            rras: vec![RraSpec {
                cf: ConsolidationFn::Last,
                step: u64::MAX,
                rows: 1,
            }],
        };
        let mut ds = DataSource::new(Ident::named("foo"), spec, now);

        ds.apply(ts(1000), 1.0, now).unwrap();
        ds.apply(ts(2_000_000), 2.0, now).unwrap();

        let request = ds.take_flush(now).unwrap();
        let slots = &request.updates[0].slots;
        assert_eq!(slots.keys().copied().collect::<Vec<_>>(), [0]);
        assert_eq!(slots[&0].count(), 2);
    }

    #[test]
    fn test_take_flush_resets() {
        let created = Instant::now();
        let mut ds = DataSource::new(Ident::named("foo"), two_archives(), created);
        assert_eq!(ds.last_flush(), created);
        assert!(ds.take_flush(created).is_none());

        let applied = created + Duration::from_secs(1);
        ds.apply(ts(1000), 1.0, applied).unwrap();
        ds.apply(ts(1001), 1.0, applied + Duration::from_secs(1))
            .unwrap();
        assert_eq!(ds.oldest_unflushed(), Some(applied));

        let flushed = created + Duration::from_secs(3);
        assert!(ds.take_flush(flushed).is_some());
        assert_eq!(ds.last_flush(), flushed);
        assert_eq!(ds.oldest_unflushed(), None);
        assert_eq!(ds.point_count(), 0);

        // Later points still have to be newer than everything flushed before.
        assert!(ds.apply(ts(999), 1.0, flushed).is_err());
    }

    #[test]
    fn test_merge_requests() {
        let now = Instant::now();
        let mut ds = DataSource::new(Ident::named("foo"), two_archives(), now);

        ds.apply(ts(1000), 2.0, now).unwrap();
        let mut first = ds.take_flush(now).unwrap();

        ds.apply(ts(1001), 4.0, now).unwrap();
        ds.apply(ts(1020), 7.0, now).unwrap();
        let second = ds.take_flush(now).unwrap();

        first.merge(second);
        assert_eq!(first.updates[0].slots[&1000].value(), 3.0);
        assert_eq!(first.updates[0].slots[&1000].count(), 2);
        assert_eq!(first.updates[0].slots[&1020].value(), 7.0);
        assert_eq!(first.updates[1].slots[&960].value(), 4.0);
        assert_eq!(first.updates[1].slots[&1020].value(), 7.0);
        assert_eq!(first.point_count(), 4);
        assert_eq!(first.last_update, ts(1020));
    }
}
