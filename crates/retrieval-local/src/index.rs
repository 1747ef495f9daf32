use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow_array::{Float32Array, Int64Array};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use retrieval_core::error::BackendError;
use retrieval_core::types::{DocumentChunk, IndexDescription, RawMatch};

use crate::metadata_store::{chunk_record, MetadataStore};
use crate::table::{chunks_to_record_batch, merge_rows, storage};

/// A loaded physical index: the LanceDB table plus its metadata store.
///
/// Searches share the read lock; upserts hold the write lock only while the
/// table and store are mutated.
pub struct LocalIndex {
    name: String,
    dimension: usize,
    state: RwLock<IndexState>,
    consistent: AtomicBool,
}

pub(crate) struct IndexState {
    pub(crate) table: Table,
    pub(crate) store: MetadataStore,
    pub(crate) vector_count: usize,
}

impl IndexState {
    fn is_consistent(&self) -> bool {
        self.vector_count == self.store.len() && self.store.declared_count().map_or(true, |d| d == self.store.len())
    }
}

impl LocalIndex {
    pub(crate) fn new(name: &str, dimension: usize, state: IndexState) -> Self {
        let consistent = state.is_consistent();
        if !consistent {
            warn!(
                index = name,
                vectors = state.vector_count,
                metadata_entries = state.store.len(),
                declared = ?state.store.declared_count(),
                "index and metadata store disagree; serving degraded"
            );
        }
        Self { name: name.to_string(), dimension, state: RwLock::new(state), consistent: AtomicBool::new(consistent) }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn dimension(&self) -> usize { self.dimension }

    /// False when the vector count and metadata entry count disagree.
    pub fn is_consistent(&self) -> bool { self.consistent.load(Ordering::Acquire) }

    pub async fn describe(&self) -> IndexDescription {
        let state = self.state.read().await;
        IndexDescription { dimension: self.dimension, vector_count: state.vector_count }
    }

    pub async fn metadata_entries(&self) -> usize { self.state.read().await.store.len() }

    pub(crate) async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        predicate: Option<String>,
    ) -> Result<Vec<RawMatch>, BackendError> {
        if query.len() != self.dimension {
            return Err(BackendError::InvalidRequest(format!(
                "query has {} dimensions, index '{}' has {}",
                query.len(),
                self.name,
                self.dimension
            )));
        }
        let state = self.state.read().await;
        let mut q = state
            .table
            .vector_search(query.to_vec())
            .map_err(storage)?
            .distance_type(DistanceType::Cosine)
            .limit(top_k);
        if let Some(p) = predicate {
            q = q.only_if(p);
        }
        let mut stream = q.execute().await.map_err(storage)?;
        let mut matches = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(storage)? {
            let row_ids = batch
                .column_by_name("row_id")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
                .ok_or_else(|| BackendError::Storage("row_id column missing".into()))?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| BackendError::Storage("_distance column missing".into()))?;
            for i in 0..batch.num_rows() {
                let Ok(row_id) = u64::try_from(row_ids.value(i)) else { continue };
                matches.push(RawMatch {
                    id: row_id.to_string(),
                    score: 1.0 - distances.value(i),
                    metadata: state.store.metadata_for(row_id),
                });
            }
        }
        debug!(index = %self.name, hits = matches.len(), "local search");
        Ok(matches)
    }

    /// Writes `chunks`, replacing any chunk whose id is already stored.
    ///
    /// The metadata store is persisted before the table is touched. If either
    /// step fails, the in-memory store is rolled back and the on-disk store
    /// rewritten, so the table and store never disagree after an error.
    pub(crate) async fn upsert(&self, chunks: &[DocumentChunk], store_path: &Path) -> Result<(), BackendError> {
        let dim = i32::try_from(self.dimension).map_err(storage)?;
        let chunks = last_write_wins(chunks);
        let mut state = self.state.write().await;

        let first_new = state.store.next_row_id().max(state.vector_count as u64);
        let mut next = first_new;
        let mut rows = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let row_id = state.store.row_for_chunk(&chunk.id).unwrap_or_else(|| {
                next += 1;
                next - 1
            });
            rows.push((row_id, chunk));
        }
        let batch = chunks_to_record_batch(&rows, dim)?;

        let previous: Vec<(u64, Option<Value>)> =
            rows.iter().map(|&(row_id, chunk)| (row_id, state.store.insert(row_id, chunk_record(chunk)))).collect();
        if let Err(e) = state.store.save(store_path).await {
            restore(&mut state.store, previous);
            return Err(e);
        }
        if let Err(e) = merge_rows(&state.table, batch).await {
            restore(&mut state.store, previous);
            if let Err(save_err) = state.store.save(store_path).await {
                warn!(index = %self.name, error = %save_err, "metadata store could not be rolled back after a failed write");
                self.consistent.store(false, Ordering::Release);
            }
            return Err(e);
        }

        let inserted = rows.iter().filter(|(row_id, _)| *row_id >= first_new).count();
        state.vector_count = match state.table.count_rows(None).await {
            Ok(n) => n,
            Err(e) => {
                warn!(index = %self.name, error = %e, "row count unavailable after write");
                state.vector_count + inserted
            }
        };
        self.consistent.store(state.is_consistent(), Ordering::Release);
        debug!(index = %self.name, written = rows.len(), inserted, total = state.vector_count, "local upsert");
        Ok(())
    }
}

/// Keeps only the last occurrence of each chunk id.
fn last_write_wins(chunks: &[DocumentChunk]) -> Vec<&DocumentChunk> {
    let mut latest: HashMap<&str, usize> = HashMap::with_capacity(chunks.len());
    for (i, c) in chunks.iter().enumerate() {
        latest.insert(c.id.as_str(), i);
    }
    chunks.iter().enumerate().filter(|(i, c)| latest.get(c.id.as_str()) == Some(i)).map(|(_, c)| c).collect()
}

fn restore(store: &mut MetadataStore, previous: Vec<(u64, Option<Value>)>) {
    for (row_id, record) in previous.into_iter().rev() {
        match record {
            Some(record) => { store.insert(row_id, record); }
            None => { store.remove(row_id); }
        }
    }
}
