use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use retrieval_core::config::MOCK_BACKEND_ID;
use retrieval_core::error::BackendError;
use retrieval_core::traits::VectorBackend;
use retrieval_core::types::{BackendId, BackendKind, DocumentChunk, Filters, HealthState, IndexDescription, MatchMetadata, RawMatch};

const PLACEHOLDERS: &[&str] = &[
    "Fallback mode: no document backend is available right now, so this is placeholder text rather than a retrieved passage.",
    "Fallback mode: search results will return once a configured backend recovers.",
    "Fallback mode: check backend status for details on which stores are unreachable.",
];

/// Last-resort backend serving fixed placeholder passages.
///
/// Never fails a search and always reports Healthy. Writes are rejected.
pub struct MockBackend {
    id: BackendId,
}

impl MockBackend {
    pub fn new() -> Self { Self { id: BackendId::from(MOCK_BACKEND_ID) } }

    fn placeholders(top_k: usize) -> Vec<RawMatch> {
        PLACEHOLDERS
            .iter()
            .enumerate()
            .take(top_k)
            .map(|(i, text)| RawMatch {
                id: format!("fallback-{i}"),
                score: 0.0,
                metadata: MatchMetadata::from(json!({
                    "text": text,
                    "source": "fallback-mode",
                    "chunk_id": format!("fallback-{i}"),
                })),
            })
            .collect()
    }
}

impl Default for MockBackend {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl VectorBackend for MockBackend {
    fn id(&self) -> &BackendId { &self.id }

    fn kind(&self) -> BackendKind { BackendKind::Mock }

    async fn connect(&self) -> Result<(), BackendError> { Ok(()) }

    async fn health_check(&self, _timeout: Duration) -> Result<HealthState, BackendError> { Ok(HealthState::Healthy) }

    async fn list_collections(&self) -> Result<Vec<String>, BackendError> { Ok(Vec::new()) }

    async fn search(&self, _index: &str, _query: &[f32], top_k: usize, _filters: &Filters) -> Result<Vec<RawMatch>, BackendError> {
        Ok(Self::placeholders(top_k))
    }

    async fn upsert(&self, _index: &str, _chunks: &[DocumentChunk]) -> Result<(), BackendError> {
        Err(BackendError::InvalidRequest("the fallback backend is read-only".into()))
    }

    async fn describe_index(&self, _index: &str) -> Result<IndexDescription, BackendError> {
        Ok(IndexDescription { dimension: 0, vector_count: PLACEHOLDERS.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrieval_core::normalize::normalize;

    #[tokio::test]
    async fn placeholders_are_labeled_and_truncated() {
        let mock = MockBackend::new();
        let hits = mock.search("anything", &[1.0], 2, &Filters::new()).await.unwrap();
        assert_eq!(hits.len(), 2);
        for h in &hits {
            let r = normalize(h, mock.id());
            assert!(r.content.starts_with("Fallback mode"));
            assert!(!r.anomaly);
            assert_eq!(r.origin_backend.as_str(), MOCK_BACKEND_ID);
        }
        assert_eq!(mock.search("x", &[], 50, &Filters::new()).await.unwrap().len(), PLACEHOLDERS.len());
        assert_eq!(mock.health_check(Duration::ZERO).await.unwrap(), HealthState::Healthy);
    }
}
