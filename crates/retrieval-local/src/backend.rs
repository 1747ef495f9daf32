use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lancedb::Connection;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use retrieval_core::error::BackendError;
use retrieval_core::traits::VectorBackend;
use retrieval_core::types::{BackendId, BackendKind, DocumentChunk, Filters, HealthState, IndexDescription, RawMatch};

use crate::index::{IndexState, LocalIndex};
use crate::metadata_store::MetadataStore;
use crate::schema::vector_dimension;
use crate::table::{self, storage};

type IndexCell = Arc<OnceCell<Arc<LocalIndex>>>;

/// Local approximate-nearest-neighbor backend over a directory of LanceDB
/// tables, one per physical index, each with a `<index>.meta.json` store.
///
/// Each physical index is loaded at most once per backend instance; callers
/// arriving during the load wait for it and then share the same
/// [`LocalIndex`].
pub struct LocalAnnBackend {
    id: BackendId,
    root: PathBuf,
    conn: OnceCell<Connection>,
    indexes: Mutex<HashMap<String, IndexCell>>,
    create_lock: tokio::sync::Mutex<()>,
    loads: AtomicUsize,
}

impl LocalAnnBackend {
    pub fn new(id: BackendId, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root: root.into(),
            conn: OnceCell::new(),
            indexes: Mutex::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path { &self.root }

    /// Number of physical index loads performed so far.
    pub fn load_count(&self) -> usize { self.loads.load(Ordering::SeqCst) }

    fn store_path(&self, index: &str) -> PathBuf { self.root.join(format!("{index}.meta.json")) }

    async fn root_exists(&self) -> bool {
        tokio::fs::try_exists(&self.root).await.unwrap_or(false)
    }

    async fn connection(&self) -> Result<&Connection, BackendError> {
        self.conn
            .get_or_try_init(|| async {
                if !self.root_exists().await {
                    return Err(BackendError::Unreachable(format!("index directory {} not found", self.root.display())));
                }
                table::open_db(&self.root.to_string_lossy()).await
            })
            .await
    }

    /// The loaded index `name`, loading it on first use.
    pub async fn open_index(&self, name: &str) -> Result<Arc<LocalIndex>, BackendError> {
        validate_index_name(name)?;
        let cell = {
            let mut map = self.indexes.lock();
            map.entry(name.to_string()).or_default().clone()
        };
        let index = cell.get_or_try_init(|| self.load(name)).await?;
        Ok(index.clone())
    }

    async fn load(&self, name: &str) -> Result<Arc<LocalIndex>, BackendError> {
        let conn = self.connection().await?;
        if !table::table_exists(conn, name).await? {
            return Err(BackendError::IndexNotFound(format!("{} in {}", name, self.root.display())));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let tbl = conn.open_table(name).execute().await.map_err(storage)?;
        let schema = tbl.schema().await.map_err(storage)?;
        let dimension = vector_dimension(&schema)
            .ok_or_else(|| BackendError::IndexInconsistent(format!("index '{name}' has no fixed-size vector column")))?;
        let vector_count = tbl.count_rows(None).await.map_err(storage)?;
        let store = MetadataStore::load(&self.store_path(name)).await?;
        info!(backend = %self.id, index = name, dimension, vector_count, metadata_entries = store.len(), "local index loaded");
        Ok(Arc::new(LocalIndex::new(name, dimension, IndexState { table: tbl, store, vector_count })))
    }

    fn loaded_indexes(&self) -> Vec<Arc<LocalIndex>> {
        self.indexes.lock().values().filter_map(|cell| cell.get().cloned()).collect()
    }

    /// Loaded index `name`, creating an empty one of width `dim` if it does
    /// not exist yet.
    async fn open_or_create(&self, name: &str, dim: usize) -> Result<Arc<LocalIndex>, BackendError> {
        match self.open_index(name).await {
            Err(BackendError::IndexNotFound(_)) => {
                let conn = self.connection().await?;
                {
                    let _guard = self.create_lock.lock().await;
                    let width = i32::try_from(dim).map_err(|_| BackendError::InvalidRequest(format!("dimension {dim} too large")))?;
                    table::ensure_table(conn, name, width).await?;
                    let path = self.store_path(name);
                    if !tokio::fs::try_exists(&path).await.map_err(storage)? {
                        MetadataStore::new().save(&path).await?;
                    }
                    info!(backend = %self.id, index = name, dimension = dim, "created local index");
                }
                self.open_index(name).await
            }
            other => other,
        }
    }
}

fn validate_index_name(name: &str) -> Result<(), BackendError> {
    if name.trim().is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(BackendError::InvalidRequest(format!("invalid index name '{name}'")));
    }
    Ok(())
}

fn validate_chunks(chunks: &[DocumentChunk]) -> Result<usize, BackendError> {
    if let Some(c) = chunks.iter().find(|c| c.id.trim().is_empty()) {
        return Err(BackendError::InvalidRequest(format!("chunk with source '{}' has an empty id", c.source)));
    }
    let dim = chunks.first().map_or(0, |c| c.embedding.len());
    if dim == 0 {
        return Err(BackendError::InvalidRequest("chunk embeddings must not be empty".into()));
    }
    for c in chunks {
        if c.embedding.len() != dim {
            return Err(BackendError::InvalidRequest(format!(
                "chunk '{}' has {} dimensions, expected {}",
                c.id,
                c.embedding.len(),
                dim
            )));
        }
        if c.embedding.iter().any(|x| !x.is_finite()) {
            return Err(BackendError::InvalidRequest(format!("chunk '{}' has a non-finite embedding", c.id)));
        }
    }
    Ok(dim)
}

#[async_trait]
impl VectorBackend for LocalAnnBackend {
    fn id(&self) -> &BackendId { &self.id }

    fn kind(&self) -> BackendKind { BackendKind::LocalAnn }

    async fn connect(&self) -> Result<(), BackendError> {
        self.connection().await.map(|_| ())
    }

    async fn health_check(&self, timeout: Duration) -> Result<HealthState, BackendError> {
        let probe = async {
            if !self.root_exists().await {
                return Err(BackendError::Unreachable(format!("index directory {} not found", self.root.display())));
            }
            let inconsistent: Vec<String> = self
                .loaded_indexes()
                .into_iter()
                .filter(|i| !i.is_consistent())
                .map(|i| i.name().to_string())
                .collect();
            if inconsistent.is_empty() {
                Ok(HealthState::Healthy)
            } else {
                warn!(backend = %self.id, indexes = ?inconsistent, "inconsistent local indexes");
                Ok(HealthState::Degraded)
            }
        };
        tokio::time::timeout(timeout, probe).await.map_err(|_| BackendError::Timeout(timeout))?
    }

    async fn list_collections(&self) -> Result<Vec<String>, BackendError> {
        let conn = self.connection().await?;
        conn.table_names().execute().await.map_err(storage)
    }

    async fn search(&self, index: &str, query: &[f32], top_k: usize, filters: &Filters) -> Result<Vec<RawMatch>, BackendError> {
        if top_k == 0 {
            return Err(BackendError::InvalidRequest("top_k must be at least 1".into()));
        }
        let predicate = table::filter_predicate(filters)?;
        let idx = self.open_index(index).await?;
        idx.search(query, top_k, predicate).await
    }

    async fn upsert(&self, index: &str, chunks: &[DocumentChunk]) -> Result<(), BackendError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let dim = validate_chunks(chunks)?;
        let idx = self.open_or_create(index, dim).await?;
        if idx.dimension() != dim {
            return Err(BackendError::InvalidRequest(format!(
                "chunks have {} dimensions, index '{}' has {}",
                dim,
                index,
                idx.dimension()
            )));
        }
        idx.upsert(chunks, &self.store_path(index)).await
    }

    async fn describe_index(&self, index: &str) -> Result<IndexDescription, BackendError> {
        Ok(self.open_index(index).await?.describe().await)
    }
}
