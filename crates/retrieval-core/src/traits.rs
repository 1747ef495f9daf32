use std::time::Duration;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::types::{BackendId, BackendKind, DocumentChunk, Filters, HealthState, IndexDescription, RawMatch};

/// Uniform capability surface over one physical vector store.
///
/// Implementations must be cheap to share behind an `Arc` and safe to call
/// from many tasks at once; in particular `upsert` may run concurrently with
/// `search` on the same index.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn id(&self) -> &BackendId;

    fn kind(&self) -> BackendKind;

    /// Establish or validate connectivity. Calling it again is a no-op once it
    /// has succeeded.
    async fn connect(&self) -> Result<(), BackendError>;

    /// Cheap, side-effect-free liveness probe bounded by `timeout`.
    async fn health_check(&self, timeout: Duration) -> Result<HealthState, BackendError>;

    async fn list_collections(&self) -> Result<Vec<String>, BackendError>;

    /// `top_k` is at least 1. Filter keys the backend cannot apply are
    /// reported as [`BackendError::UnsupportedFilter`].
    async fn search(
        &self,
        index: &str,
        query: &[f32],
        top_k: usize,
        filters: &Filters,
    ) -> Result<Vec<RawMatch>, BackendError>;

    async fn upsert(&self, index: &str, chunks: &[DocumentChunk]) -> Result<(), BackendError>;

    async fn describe_index(&self, index: &str) -> Result<IndexDescription, BackendError>;
}
