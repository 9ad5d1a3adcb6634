use async_trait::async_trait;

use crate::{DsSpec, FlushRequest, Ident};

/// An error reported by a [`Storage`] backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend cannot be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The backend refused the write.
    #[error("write rejected for {ident}: {reason}")]
    Rejected {
        /// The metric whose write was rejected.
        ident: Ident,
        /// Why the write was rejected.
        reason: String,
    },
    /// Any other backend failure.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Durable storage for metric data.
///
/// Calls for the same metric never overlap. A flush carries the creation spec, so backends can
/// create series they do not know yet on their first write.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Looks up the spec of an existing data source.
    ///
    /// Returns `Ok(None)` if storage does not know the metric.
    async fn fetch(&self, ident: &Ident) -> Result<Option<DsSpec>, StorageError>;

    /// Writes the pending points of one metric.
    async fn flush(&self, request: &FlushRequest) -> Result<(), StorageError>;
}
