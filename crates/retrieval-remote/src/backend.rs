use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use retrieval_core::error::BackendError;
use retrieval_core::traits::VectorBackend;
use retrieval_core::types::{BackendId, BackendKind, DocumentChunk, Filters, HealthState, IndexDescription, RawMatch};

use crate::wire::{self, SearchRequest, UpsertRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const ERROR_BODY_LIMIT: usize = 200;

/// Remote managed vector service speaking the Qdrant REST dialect.
///
/// Every request carries an explicit timeout. Transport failures, auth
/// rejections, throttling and server errors surface as
/// [`BackendError::Unreachable`]; client errors as
/// [`BackendError::InvalidRequest`].
pub struct RemoteManagedBackend {
    id: BackendId,
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
    client: Client,
    connected: OnceCell<()>,
}

impl RemoteManagedBackend {
    pub fn new(id: BackendId, base_url: &str, api_key: Option<String>, request_timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(request_timeout))
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::Unreachable(format!("http client: {e}")))?;
        Ok(Self {
            id,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            request_timeout,
            client,
            connected: OnceCell::new(),
        })
    }

    pub fn base_url(&self) -> &str { &self.base_url }

    fn request(&self, method: Method, path: &str, timeout: Duration) -> RequestBuilder {
        let mut req = self.client.request(method, format!("{}{}", self.base_url, path)).timeout(timeout);
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }
        req
    }

    async fn execute(&self, operation: &str, req: RequestBuilder, timeout: Duration) -> Result<Vec<u8>, BackendError> {
        let resp = req.send().await.map_err(|e| transport_error(&e, timeout))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = classify_status(status, &body);
            warn!(backend = %self.id, operation, status = status.as_u16(), error = %err, "remote request failed");
            return Err(err);
        }
        let bytes = resp.bytes().await.map_err(|e| transport_error(&e, timeout))?;
        Ok(bytes.to_vec())
    }
}

fn transport_error(e: &reqwest::Error, timeout: Duration) -> BackendError {
    if e.is_timeout() {
        BackendError::Unreachable(format!("no response within {timeout:?}"))
    } else if e.is_connect() {
        BackendError::Unreachable(format!("connection failed: {e}"))
    } else {
        BackendError::Unreachable(e.to_string())
    }
}

/// Maps a non-success HTTP status to the adapter outcome.
pub fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let detail: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    match status.as_u16() {
        401 | 403 => BackendError::Unreachable(format!("authentication rejected ({status})")),
        429 => BackendError::Unreachable(format!("rate limited ({status})")),
        400 | 404 | 422 => BackendError::InvalidRequest(format!("{status}: {detail}")),
        500..=599 => BackendError::Unreachable(format!("server error {status}: {detail}")),
        400..=499 => BackendError::InvalidRequest(format!("{status}: {detail}")),
        _ => BackendError::Unreachable(format!("unexpected status {status}")),
    }
}

fn collection_path(index: &str) -> Result<String, BackendError> {
    if index.trim().is_empty() || index.contains(['/', '?', '#', '\\']) {
        return Err(BackendError::InvalidRequest(format!("invalid collection name '{index}'")));
    }
    Ok(format!("/collections/{index}"))
}

#[async_trait]
impl VectorBackend for RemoteManagedBackend {
    fn id(&self) -> &BackendId { &self.id }

    fn kind(&self) -> BackendKind { BackendKind::RemoteManaged }

    async fn connect(&self) -> Result<(), BackendError> {
        self.connected
            .get_or_try_init(|| async {
                let req = self.request(Method::GET, "/healthz", self.request_timeout);
                self.execute("connect", req, self.request_timeout).await?;
                info!(backend = %self.id, url = %self.base_url, "connected to remote vector service");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn health_check(&self, timeout: Duration) -> Result<HealthState, BackendError> {
        let req = self.request(Method::GET, "/healthz", timeout);
        match tokio::time::timeout(timeout, self.execute("health_check", req, timeout)).await {
            Ok(Ok(_)) => Ok(HealthState::Healthy),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::Timeout(timeout)),
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>, BackendError> {
        let req = self.request(Method::GET, "/collections", self.request_timeout);
        let body = self.execute("list_collections", req, self.request_timeout).await?;
        wire::parse_collections(&body)
    }

    async fn search(&self, index: &str, query: &[f32], top_k: usize, filters: &Filters) -> Result<Vec<RawMatch>, BackendError> {
        if top_k == 0 {
            return Err(BackendError::InvalidRequest("top_k must be at least 1".into()));
        }
        if query.is_empty() {
            return Err(BackendError::InvalidRequest("query vector is empty".into()));
        }
        let path = format!("{}/points/search", collection_path(index)?);
        let body = SearchRequest { vector: query, limit: top_k, with_payload: true, filter: wire::build_filter(filters) };
        let req = self.request(Method::POST, &path, self.request_timeout).json(&body);
        let bytes = self.execute("search", req, self.request_timeout).await?;
        let hits = wire::parse_search_response(&bytes)?;
        debug!(backend = %self.id, index, hits = hits.len(), "remote search");
        Ok(hits)
    }

    async fn upsert(&self, index: &str, chunks: &[DocumentChunk]) -> Result<(), BackendError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let path = format!("{}/points?wait=true", collection_path(index)?);
        let body = UpsertRequest { points: chunks.iter().map(wire::to_point).collect() };
        let req = self.request(Method::PUT, &path, self.request_timeout).json(&body);
        self.execute("upsert", req, self.request_timeout).await?;
        debug!(backend = %self.id, index, points = chunks.len(), "remote upsert");
        Ok(())
    }

    async fn describe_index(&self, index: &str) -> Result<IndexDescription, BackendError> {
        let req = self.request(Method::GET, &collection_path(index)?, self.request_timeout);
        let body = self.execute("describe_index", req, self.request_timeout).await?;
        wire::parse_collection_info(&body)
    }
}
