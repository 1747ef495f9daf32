//! Thin layer over LanceDB for physical index tables.
//!
//! Rows are keyed by `chunk_id`: writes go through `merge_insert`, so writing
//! a chunk that is already present replaces its row.

use arrow_array::{FixedSizeListArray, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use lancedb::{connect, Connection, Table};
use std::sync::Arc;

use retrieval_core::error::BackendError;
use retrieval_core::types::{DocumentChunk, Filters};

use crate::schema::{build_index_schema, FILTERABLE_COLUMNS};

pub(crate) fn storage(e: impl std::fmt::Display) -> BackendError { BackendError::Storage(e.to_string()) }

pub async fn open_db(uri: &str) -> Result<Connection, BackendError> {
    connect(uri).execute().await.map_err(storage)
}

pub async fn table_exists(conn: &Connection, name: &str) -> Result<bool, BackendError> {
    let names = conn.table_names().execute().await.map_err(storage)?;
    Ok(names.iter().any(|n| n == name))
}

pub async fn ensure_table(conn: &Connection, name: &str, dim: i32) -> Result<(), BackendError> {
    if table_exists(conn, name).await? {
        return Ok(());
    }
    let schema = build_index_schema(dim);
    let iter = RecordBatchIterator::new(vec![].into_iter(), schema.clone());
    conn.create_table(name, Box::new(iter)).execute().await.map_err(storage)?;
    Ok(())
}

/// One row per `(row_id, chunk)` pair.
pub fn chunks_to_record_batch(rows: &[(u64, &DocumentChunk)], dim: i32) -> Result<RecordBatch, BackendError> {
    let schema = build_index_schema(dim);
    let mut row_ids = Vec::with_capacity(rows.len());
    let mut chunk_ids = Vec::with_capacity(rows.len());
    let mut sources = Vec::with_capacity(rows.len());
    let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::with_capacity(rows.len());
    for &(row_id, chunk) in rows {
        let row_id = i64::try_from(row_id).map_err(|_| BackendError::Storage("row id overflow".into()))?;
        row_ids.push(row_id);
        chunk_ids.push(chunk.id.clone());
        sources.push(chunk.source.clone());
        vectors.push(Some(chunk.embedding.iter().map(|&x| Some(x)).collect()));
    }
    let record_batch = RecordBatch::try_new(schema, vec![
        Arc::new(Int64Array::from(row_ids)),
        Arc::new(StringArray::from(chunk_ids)),
        Arc::new(StringArray::from(sources)),
        Arc::new(FixedSizeListArray::from_iter_primitive::<arrow_array::types::Float32Type, _, _>(vectors.into_iter(), dim)),
    ]).map_err(storage)?;
    Ok(record_batch)
}

/// Inserts `batch`, replacing rows whose `chunk_id` is already present.
pub async fn merge_rows(table: &Table, batch: RecordBatch) -> Result<(), BackendError> {
    let schema = batch.schema();
    let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
    let mut mi = table.merge_insert(&["chunk_id"]);
    mi.when_matched_update_all(None).when_not_matched_insert_all();
    mi.execute(reader).await.map_err(storage)?;
    Ok(())
}

/// `key = 'value'` conjunction over the filterable columns.
pub fn filter_predicate(filters: &Filters) -> Result<Option<String>, BackendError> {
    if filters.is_empty() {
        return Ok(None);
    }
    let mut clauses = Vec::with_capacity(filters.len());
    for (key, value) in filters {
        if !FILTERABLE_COLUMNS.contains(&key.as_str()) {
            return Err(BackendError::UnsupportedFilter(key.clone()));
        }
        clauses.push(format!("{} = '{}'", key, value.replace('\'', "''")));
    }
    Ok(Some(clauses.join(" AND ")))
}
