use std::sync::Arc;

use hashbrown::HashMap;
use tokio::time::Instant;

use crate::stats::PipelineGauges;
use crate::{CachePolicy, DataSource, FlushRequest, Ident, MatchingDsSpecFinder, Storage};
use crate::storage::StorageError;

/// The metric states owned by one worker.
///
/// Data sources are created on first sight of an identity: the spec known to storage takes
/// precedence, otherwise the finder decides whether and how to create the metric.
pub struct DsCache {
    entries: HashMap<Ident, DataSource>,
    storage: Arc<dyn Storage>,
    finder: Arc<dyn MatchingDsSpecFinder>,
    gauges: Arc<PipelineGauges>,
}

impl DsCache {
    /// Creates an empty cache.
    pub fn new(
        storage: Arc<dyn Storage>,
        finder: Arc<dyn MatchingDsSpecFinder>,
        gauges: Arc<PipelineGauges>,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            storage,
            finder,
            gauges,
        }
    }

    /// Returns the number of cached data sources.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no data source is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the cached data source for `ident`.
    pub fn get(&self, ident: &Ident) -> Option<&DataSource> {
        self.entries.get(ident)
    }

    /// Returns the data source for `ident`, creating it if necessary.
    ///
    /// Returns `Ok(None)` if the metric is unknown to storage and the finder has no spec for it.
    pub async fn get_or_create(
        &mut self,
        ident: &Ident,
        now: Instant,
    ) -> Result<Option<&mut DataSource>, StorageError> {
        if !self.entries.contains_key(ident) {
            let spec = match self.storage.fetch(ident).await? {
                Some(spec) => spec,
                None => match self.finder.find_matching_spec(ident) {
                    Some(spec) => spec,
                    None => return Ok(None),
                },
            };

            strata_log::debug!(ident = %ident, step = spec.step, "creating data source");
            self.entries
                .insert(ident.clone(), DataSource::new(ident.clone(), spec, now));
            self.gauges.data_source_created();
        }

        Ok(self.entries.get_mut(ident))
    }

    /// Drains every data source the policy wants flushed at `now`.
    pub fn flush_ready(&mut self, policy: &CachePolicy, now: Instant) -> Vec<FlushRequest> {
        self.entries
            .values_mut()
            .filter(|ds| policy.should_flush(ds, now))
            .filter_map(|ds| ds.take_flush(now))
            .collect()
    }

    /// Drains every data source with pending points, ignoring the policy.
    pub fn flush_all(&mut self, now: Instant) -> Vec<FlushRequest> {
        self.entries
            .values_mut()
            .filter_map(|ds| ds.take_flush(now))
            .collect()
    }

    /// Returns the number of pending slots across all cached data sources.
    pub fn pending_points(&self) -> usize {
        self.entries.values().map(DataSource::point_count).sum()
    }
}

impl Drop for DsCache {
    fn drop(&mut self) {
        self.gauges.data_sources_dropped(self.entries.len());

        let pending = self.pending_points();
        if pending > 0 {
            strata_log::error!("metric cache dropping {pending} pending points");
        }
    }
}
