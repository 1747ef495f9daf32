use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use retrieval_core::config::{ChainEntryConfig, HealthConfig, RetrievalConfig, MOCK_BACKEND_ID};
use retrieval_core::error::{BackendError, Result, RetrievalError};
use retrieval_core::normalize::Normalizer;
use retrieval_core::traits::VectorBackend;
use retrieval_core::types::{
    BackendDescriptor, BackendId, BackendKind, BackendStatus, CollectionRef, ConnectionParams, DocumentChunk, Filters, HealthState,
    IndexDescription, Role, SearchResponse,
};

use crate::factory::build_backend;
use crate::health::HealthMonitor;
use crate::mock::MockBackend;

struct BackendEntry {
    backend: Arc<dyn VectorBackend>,
    connection: ConnectionParams,
    search_timeout: Duration,
    health_timeout: Duration,
}

#[derive(Clone)]
struct ChainLink {
    backend: Arc<dyn VectorBackend>,
    descriptor: BackendDescriptor,
    index: String,
    search_timeout: Duration,
}

#[derive(Default)]
struct Topology {
    chains: HashMap<CollectionRef, Vec<ChainLink>>,
}

/// Diagnostic view of one link of a collection's chain.
#[derive(Debug, Clone, Serialize)]
pub struct LinkDescription {
    pub backend: BackendId,
    pub kind: BackendKind,
    pub role: Role,
    pub index: String,
    pub state: HealthState,
    pub description: Option<IndexDescription>,
    pub error: Option<String>,
}

/// Shorthand for one chain entry.
pub fn chain_entry(backend: &str, index: &str, role: Role) -> ChainEntryConfig {
    ChainEntryConfig { backend: backend.to_string(), index: index.to_string(), role }
}

/// Assembles a router from adapters and collection chains.
pub struct RouterBuilder {
    health: HealthConfig,
    backends: HashMap<BackendId, BackendEntry>,
    collections: BTreeMap<String, Vec<ChainEntryConfig>>,
}

impl RouterBuilder {
    pub fn new(health: HealthConfig) -> Self {
        Self { health, backends: HashMap::new(), collections: BTreeMap::new() }
    }

    /// Registers an already constructed adapter.
    pub fn backend(self, backend: Arc<dyn VectorBackend>, search_timeout: Duration, health_timeout: Duration) -> Self {
        self.backend_with(backend, ConnectionParams::Builtin, search_timeout, health_timeout)
    }

    fn backend_with(mut self, backend: Arc<dyn VectorBackend>, connection: ConnectionParams, search_timeout: Duration, health_timeout: Duration) -> Self {
        self.backends.insert(backend.id().clone(), BackendEntry { backend, connection, search_timeout, health_timeout });
        self
    }

    pub fn collection(mut self, name: &str, chain: Vec<ChainEntryConfig>) -> Self {
        self.collections.insert(name.to_string(), chain);
        self
    }

    pub fn build(self) -> Result<RetrievalRouter> {
        if self.health.failure_threshold == 0 {
            return Err(RetrievalError::InvalidConfig("health.failure_threshold must be at least 1".into()));
        }
        if self.health.interval_secs == 0 {
            return Err(RetrievalError::InvalidConfig("health.interval_secs must be at least 1".into()));
        }
        if self.backends.keys().any(|id| id.as_str() == MOCK_BACKEND_ID) {
            return Err(RetrievalError::InvalidConfig(format!("backend id '{MOCK_BACKEND_ID}' is reserved")));
        }
        for (id, e) in &self.backends {
            if e.search_timeout.is_zero() || e.health_timeout.is_zero() {
                return Err(RetrievalError::InvalidConfig(format!("backend '{id}': timeouts must be non-zero")));
            }
            if e.search_timeout <= e.health_timeout {
                return Err(RetrievalError::InvalidConfig(format!(
                    "backend '{id}': search timeout {:?} must exceed health timeout {:?}",
                    e.search_timeout, e.health_timeout
                )));
            }
        }
        let topology = build_topology(&self.collections, &self.backends)?;
        let monitor = HealthMonitor::new(self.health);
        for id in self.backends.keys() {
            monitor.register(id);
        }
        info!(backends = self.backends.len(), collections = topology.chains.len(), "retrieval router ready");
        Ok(RetrievalRouter {
            backends: self.backends,
            topology: RwLock::new(Arc::new(topology)),
            monitor,
            normalizer: Normalizer::new(),
            mock: MockBackend::new(),
        })
    }
}

fn build_topology(collections: &BTreeMap<String, Vec<ChainEntryConfig>>, backends: &HashMap<BackendId, BackendEntry>) -> Result<Topology> {
    let mut chains = HashMap::with_capacity(collections.len());
    for (name, entries) in collections {
        if entries.is_empty() {
            return Err(RetrievalError::InvalidConfig(format!("collection '{name}' has an empty backend chain")));
        }
        let mut ordered: Vec<&ChainEntryConfig> = entries.iter().collect();
        ordered.sort_by_key(|e| e.role);
        let mut links = Vec::with_capacity(ordered.len());
        for (ordinal, entry) in ordered.into_iter().enumerate() {
            let id = BackendId::from(entry.backend.as_str());
            let backend = backends
                .get(&id)
                .ok_or_else(|| RetrievalError::InvalidConfig(format!("collection '{name}' references unknown backend '{id}'")))?;
            if entry.index.trim().is_empty() {
                return Err(RetrievalError::InvalidConfig(format!("collection '{name}': empty index name for backend '{id}'")));
            }
            links.push(ChainLink {
                backend: backend.backend.clone(),
                descriptor: BackendDescriptor {
                    id,
                    kind: backend.backend.kind(),
                    connection: backend.connection.clone(),
                    role: entry.role,
                    ordinal,
                },
                index: entry.index.clone(),
                search_timeout: backend.search_timeout,
            });
        }
        chains.insert(CollectionRef::from(name.as_str()), links);
    }
    Ok(Topology { chains })
}

/// Single entry point for retrieval: resolves a collection to its backend
/// chain, fails over along it and normalizes whatever answers.
///
/// `search` never fails because of backend trouble. When every backend in
/// the chain is unavailable the placeholder set is returned with
/// `degraded = true`. Only caller mistakes surface as errors.
pub struct RetrievalRouter {
    backends: HashMap<BackendId, BackendEntry>,
    topology: RwLock<Arc<Topology>>,
    monitor: HealthMonitor,
    normalizer: Normalizer,
    mock: MockBackend,
}

impl RetrievalRouter {
    pub fn builder(health: HealthConfig) -> RouterBuilder { RouterBuilder::new(health) }

    /// Builds adapters for every configured backend and the collection
    /// chains. Health probing is not started.
    pub fn from_config(config: &RetrievalConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = RouterBuilder::new(config.health.clone());
        for b in &config.backends {
            let (backend, connection) = build_backend(b, &config.base_dir)?;
            builder = builder.backend_with(backend, connection, b.search_timeout(), b.health_timeout());
        }
        for (name, chain) in &config.collections {
            builder = builder.collection(name, chain.clone());
        }
        builder.build()
    }

    pub fn monitor(&self) -> &HealthMonitor { &self.monitor }

    /// Starts periodic health probes for every backend.
    pub fn start_monitoring(&self) {
        let backends = self.backends.values().map(|e| (e.backend.clone(), e.health_timeout)).collect();
        self.monitor.start(backends);
    }

    pub fn shutdown(&self) { self.monitor.shutdown(); }

    /// Probes every backend once, concurrently, and returns the fresh statuses.
    pub async fn probe_all(&self) -> Vec<BackendStatus> {
        let probes = self.backends.values().map(|e| self.monitor.probe_now(e.backend.as_ref(), e.health_timeout));
        let mut statuses = futures::future::join_all(probes).await;
        statuses.sort_by(|a, b| a.backend.cmp(&b.backend));
        statuses
    }

    /// Calls `connect` on every backend; failures are reported, not raised.
    pub async fn connect_all(&self) -> Vec<(BackendId, std::result::Result<(), String>)> {
        let calls = self.backends.values().map(|e| async move {
            let id = e.backend.id().clone();
            let result = guarded(e.search_timeout, e.backend.connect()).await.map_err(|err| err.to_string());
            if let Err(err) = &result {
                warn!(backend = %id, error = %err, "connect failed");
            }
            (id, result)
        });
        let mut results = futures::future::join_all(calls).await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    fn spawn_probe(&self, id: &BackendId) {
        if let Some(entry) = self.backends.get(id) {
            self.monitor.spawn_probe(entry.backend.clone(), entry.health_timeout);
        }
    }

    pub fn collections(&self) -> Vec<CollectionRef> {
        let topology = self.topology.read().clone();
        let mut names: Vec<_> = topology.chains.keys().cloned().collect();
        names.sort();
        names
    }

    /// The collection's chain in attempt order.
    pub fn chain(&self, collection: &CollectionRef) -> Result<Vec<BackendDescriptor>> {
        let topology = self.topology.read().clone();
        let links = topology.chains.get(collection).ok_or_else(|| RetrievalError::UnknownCollection(collection.clone()))?;
        Ok(links.iter().map(|l| l.descriptor.clone()).collect())
    }

    fn links(&self, collection: &CollectionRef) -> Result<Vec<ChainLink>> {
        let topology = self.topology.read().clone();
        topology.chains.get(collection).cloned().ok_or_else(|| RetrievalError::UnknownCollection(collection.clone()))
    }

    pub async fn search(&self, collection: &CollectionRef, query: &[f32], top_k: usize, filters: &Filters) -> Result<SearchResponse> {
        validate_search(query, top_k, filters)?;
        let chain = self.links(collection)?;
        let mut skipped: Vec<String> = Vec::new();

        for link in &chain {
            let id = &link.descriptor.id;
            if self.monitor.status(id).state == HealthState::Unreachable {
                debug!(collection = %collection, backend = %id, "skipping unreachable backend");
                skipped.push(format!("{id}: unreachable"));
                if self.monitor.recheck_due(id) {
                    self.spawn_probe(id);
                }
                continue;
            }
            let outcome = guarded(link.search_timeout, link.backend.search(&link.index, query, top_k, filters)).await;
            match outcome {
                Ok(raws) => {
                    self.monitor.record_search_success(id);
                    debug!(collection = %collection, backend = %id, hits = raws.len(), "search served");
                    return Ok(SearchResponse {
                        results: self.normalizer.normalize_all(&raws, id),
                        used_backend: id.clone(),
                        degraded: false,
                        notice: None,
                    });
                }
                Err(BackendError::PartialResult { matches, reason }) => {
                    self.monitor.record_search_success(id);
                    warn!(collection = %collection, backend = %id, usable = matches.len(), reason = %reason, "partial search result");
                    return Ok(SearchResponse {
                        results: self.normalizer.normalize_all(&matches, id),
                        used_backend: id.clone(),
                        degraded: false,
                        notice: Some(format!("partial results from '{id}': {reason}")),
                    });
                }
                Err(BackendError::InvalidRequest(msg)) => {
                    return Err(RetrievalError::InvalidRequest(format!("backend '{id}' rejected the request: {msg}")));
                }
                Err(BackendError::UnsupportedFilter(key)) => {
                    info!(collection = %collection, backend = %id, key = %key, "filter not supported; trying next backend");
                    skipped.push(format!("{id}: filter '{key}' unsupported"));
                }
                Err(err) => {
                    warn!(collection = %collection, backend = %id, error = %err, "search failed; failing over");
                    skipped.push(format!("{id}: {err}"));
                    if self.monitor.record_search_failure(id, &err) {
                        self.spawn_probe(id);
                    }
                }
            }
        }

        let notice = format!(
            "no backend could serve collection '{collection}' ({}); showing fallback placeholder content",
            skipped.join("; ")
        );
        warn!(collection = %collection, "{notice}");
        let raws = self.mock.search(collection.as_str(), query, top_k, filters).await.unwrap_or_default();
        Ok(SearchResponse {
            results: self.normalizer.normalize_all(&raws, self.mock.id()),
            used_backend: self.mock.id().clone(),
            degraded: true,
            notice: Some(notice),
        })
    }

    /// Writes `chunks` to every backend in the collection's chain, in chain
    /// order. The first failure aborts the write and is returned.
    pub async fn upsert(&self, collection: &CollectionRef, chunks: &[DocumentChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        validate_chunks(chunks)?;
        let chain = self.links(collection)?;
        for link in &chain {
            let id = &link.descriptor.id;
            let call = AssertUnwindSafe(link.backend.upsert(&link.index, chunks)).catch_unwind();
            let result = match call.await {
                Ok(r) => r,
                Err(panic) => Err(BackendError::Storage(format!("backend panicked: {}", panic_message(panic.as_ref())))),
            };
            if let Err(source) = result {
                warn!(collection = %collection, backend = %id, error = %source, "upsert failed");
                return Err(RetrievalError::UpsertFailed { backend: id.clone(), source });
            }
            debug!(collection = %collection, backend = %id, chunks = chunks.len(), "upserted");
        }
        info!(collection = %collection, chunks = chunks.len(), backends = chain.len(), "upsert complete");
        Ok(())
    }

    /// Cached status of each backend in the chain. Never probes.
    pub fn backend_status(&self, collection: &CollectionRef) -> Result<Vec<BackendStatus>> {
        let chain = self.links(collection)?;
        Ok(chain.iter().map(|l| self.monitor.status(&l.descriptor.id)).collect())
    }

    pub async fn describe(&self, collection: &CollectionRef) -> Result<Vec<LinkDescription>> {
        let chain = self.links(collection)?;
        let mut out = Vec::with_capacity(chain.len());
        for link in &chain {
            let described = guarded(link.search_timeout, link.backend.describe_index(&link.index)).await;
            let (description, error) = match described {
                Ok(d) => (Some(d), None),
                Err(e) => (None, Some(e.to_string())),
            };
            out.push(LinkDescription {
                backend: link.descriptor.id.clone(),
                kind: link.descriptor.kind,
                role: link.descriptor.role,
                index: link.index.clone(),
                state: self.monitor.status(&link.descriptor.id).state,
                description,
                error,
            });
        }
        Ok(out)
    }

    /// Replaces the collection mapping from a new configuration. Backend
    /// definitions are fixed at startup; chains may only reference them.
    pub fn reload(&self, config: &RetrievalConfig) -> Result<()> {
        config.validate()?;
        for b in &config.backends {
            if !self.backends.contains_key(&b.backend_id()) {
                warn!(backend = %b.id, "backend added after startup is ignored until restart");
            }
        }
        self.reload_collections(&config.collections)
    }

    /// Atomically swaps in new chains. On error the current mapping stays.
    pub fn reload_collections(&self, collections: &BTreeMap<String, Vec<ChainEntryConfig>>) -> Result<()> {
        let topology = build_topology(collections, &self.backends)?;
        let count = topology.chains.len();
        *self.topology.write() = Arc::new(topology);
        info!(collections = count, "collection mapping reloaded");
        Ok(())
    }
}

impl Drop for RetrievalRouter {
    fn drop(&mut self) { self.monitor.shutdown(); }
}

/// Runs a backend call under `timeout`, turning panics into failures.
async fn guarded<T, F>(timeout: Duration, call: F) -> std::result::Result<T, BackendError>
where
    F: Future<Output = std::result::Result<T, BackendError>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
        Err(_) => Err(BackendError::Timeout(timeout)),
        Ok(Err(panic)) => Err(BackendError::Storage(format!("backend panicked: {}", panic_message(panic.as_ref())))),
        Ok(Ok(result)) => result,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn validate_search(query: &[f32], top_k: usize, filters: &Filters) -> Result<()> {
    if top_k == 0 {
        return Err(RetrievalError::InvalidRequest("top_k must be at least 1".into()));
    }
    if query.is_empty() {
        return Err(RetrievalError::InvalidRequest("query vector is empty".into()));
    }
    if query.iter().any(|x| !x.is_finite()) {
        return Err(RetrievalError::InvalidRequest("query vector contains non-finite values".into()));
    }
    if filters.keys().any(|k| k.trim().is_empty()) {
        return Err(RetrievalError::InvalidRequest("filter keys must not be empty".into()));
    }
    Ok(())
}

fn validate_chunks(chunks: &[DocumentChunk]) -> Result<()> {
    for c in chunks {
        if c.id.trim().is_empty() {
            return Err(RetrievalError::InvalidRequest("chunk id must not be empty".into()));
        }
        if c.embedding.is_empty() || c.embedding.iter().any(|x| !x.is_finite()) {
            return Err(RetrievalError::InvalidRequest(format!("chunk '{}' has an empty or non-finite embedding", c.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_arguments_are_validated() {
        let f = Filters::new();
        assert!(validate_search(&[0.1], 0, &f).is_err());
        assert!(validate_search(&[], 3, &f).is_err());
        assert!(validate_search(&[f32::NAN], 3, &f).is_err());
        let mut blank = Filters::new();
        blank.insert(" ".into(), "x".into());
        assert!(validate_search(&[0.1], 3, &blank).unwrap_err().is_invalid_request());
        assert!(validate_search(&[0.1], 3, &f).is_ok());
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }
}
