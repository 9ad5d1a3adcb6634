//! In-memory storage for tests.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{DsSpec, FlushRequest, Ident, Storage, StorageError};

/// A write recorded by [`MemoryStorage`].
#[derive(Clone, Debug)]
pub struct RecordedFlush {
    /// When the write reached storage.
    pub at: Instant,
    /// The written request.
    pub request: FlushRequest,
}

#[derive(Debug, Default)]
struct Inner {
    specs: HashMap<Ident, DsSpec>,
    flushes: Vec<RecordedFlush>,
    failing: bool,
}

/// Storage keeping specs and writes in memory.
///
/// Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `ident` known to storage with the given spec.
    pub fn insert_spec(&self, ident: Ident, spec: DsSpec) {
        self.inner.lock().specs.insert(ident, spec);
    }

    /// Makes every subsequent call fail with [`StorageError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().failing = failing;
    }

    /// Returns all recorded writes in order.
    pub fn flushes(&self) -> Vec<RecordedFlush> {
        self.inner.lock().flushes.clone()
    }

    /// Returns the recorded writes for one metric.
    pub fn flushes_for(&self, ident: &Ident) -> Vec<RecordedFlush> {
        self.inner
            .lock()
            .flushes
            .iter()
            .filter(|flush| &flush.request.ident == ident)
            .cloned()
            .collect()
    }

    /// Returns the number of raw points written across all metrics.
    pub fn sample_count(&self) -> u64 {
        self.inner
            .lock()
            .flushes
            .iter()
            .map(|flush| flush.request.sample_count())
            .sum()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn fetch(&self, ident: &Ident) -> Result<Option<DsSpec>, StorageError> {
        let inner = self.inner.lock();
        if inner.failing {
            return Err(StorageError::Unavailable("memory storage failing".to_owned()));
        }

        Ok(inner.specs.get(ident).cloned())
    }

    async fn flush(&self, request: &FlushRequest) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.failing {
            return Err(StorageError::Unavailable("memory storage failing".to_owned()));
        }

        inner.flushes.push(RecordedFlush {
            at: Instant::now(),
            request: request.clone(),
        });
        Ok(())
    }
}
