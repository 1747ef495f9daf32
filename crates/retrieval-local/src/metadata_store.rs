//! Companion store mapping vector row ids to chunk records.
//!
//! The file is a versioned JSON blob carrying its own entry count:
//! `{"format_version": 1, "vector_count": N, "records": {"0": {...}, ...}}`.
//! Two legacy layouts are also read: a bare object keyed by row id and a JSON
//! array indexed by row id. Records themselves may be objects using any of the
//! historical content field names, or a bare string holding the text; reading
//! content out of them is left to the normalizer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use retrieval_core::error::BackendError;
use retrieval_core::types::{DocumentChunk, MatchMetadata};
use tracing::{debug, warn};

use crate::table::storage;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Deserialize)]
#[serde(untagged)]
enum StoreFile {
    Versioned { format_version: u32, vector_count: usize, records: BTreeMap<String, Value> },
    Map(BTreeMap<String, Value>),
    List(Vec<Value>),
}

#[derive(Serialize)]
struct StoreFileOut<'a> {
    format_version: u32,
    vector_count: usize,
    records: BTreeMap<String, &'a Value>,
}

#[derive(Debug, Default)]
pub struct MetadataStore {
    records: BTreeMap<u64, Value>,
    by_chunk: HashMap<String, u64>,
    declared_count: Option<usize>,
}

impl MetadataStore {
    pub fn new() -> Self { Self::default() }

    /// Reads the store at `path`. A missing file yields an empty store, which
    /// the consistency check then reports against the index.
    pub async fn load(path: &Path) -> Result<Self, BackendError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "metadata store missing; treating as empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(storage(e)),
        };
        let file: StoreFile = serde_json::from_slice(&bytes)
            .map_err(|e| BackendError::Storage(format!("{}: {}", path.display(), e)))?;
        let mut store = Self::new();
        match file {
            StoreFile::Versioned { format_version, vector_count, records } => {
                if format_version > FORMAT_VERSION {
                    return Err(BackendError::Storage(format!("{}: unsupported format_version {}", path.display(), format_version)));
                }
                store.declared_count = Some(vector_count);
                store.insert_keyed(records);
            }
            StoreFile::Map(records) => store.insert_keyed(records),
            StoreFile::List(records) => {
                for (row_id, record) in (0u64..).zip(records) {
                    store.insert(row_id, record);
                }
            }
        }
        debug!(path = %path.display(), entries = store.records.len(), "metadata store loaded");
        Ok(store)
    }

    fn insert_keyed(&mut self, records: BTreeMap<String, Value>) {
        for (key, record) in records {
            match key.trim().parse::<u64>() {
                Ok(row_id) => { self.insert(row_id, record); }
                Err(_) => warn!(key = %key, "ignoring metadata record with non-numeric row id"),
            }
        }
    }

    /// Writes the store atomically: a temp file in the same directory is
    /// renamed over `path`.
    pub async fn save(&mut self, path: &Path) -> Result<(), BackendError> {
        let out = StoreFileOut {
            format_version: FORMAT_VERSION,
            vector_count: self.records.len(),
            records: self.records.iter().map(|(k, v)| (k.to_string(), v)).collect(),
        };
        let bytes = serde_json::to_vec(&out).map_err(storage)?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), BackendError> {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(storage)?;
            tmp.write_all(&bytes).map_err(storage)?;
            tmp.as_file().sync_all().map_err(storage)?;
            tmp.persist(&path).map_err(|e| storage(e.error))?;
            Ok(())
        })
        .await
        .map_err(storage)??;
        self.declared_count = Some(self.records.len());
        Ok(())
    }

    pub fn len(&self) -> usize { self.records.len() }

    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    /// Entry count embedded in the file, when the versioned layout was read.
    pub fn declared_count(&self) -> Option<usize> { self.declared_count }

    pub fn get(&self, row_id: u64) -> Option<&Value> { self.records.get(&row_id) }

    /// Row holding `chunk_id`, for records that carry one.
    pub fn row_for_chunk(&self, chunk_id: &str) -> Option<u64> { self.by_chunk.get(chunk_id).copied() }

    pub fn next_row_id(&self) -> u64 {
        self.records.keys().next_back().map_or(0, |k| k + 1)
    }

    /// Stores `record` at `row_id` and returns the record it replaced.
    pub fn insert(&mut self, row_id: u64, record: Value) -> Option<Value> {
        if let Some(chunk_id) = record_chunk_id(&record) {
            self.by_chunk.insert(chunk_id.to_string(), row_id);
        }
        let previous = self.records.insert(row_id, record);
        self.unindex(previous.as_ref(), row_id);
        previous
    }

    pub fn remove(&mut self, row_id: u64) -> Option<Value> {
        let previous = self.records.remove(&row_id);
        self.unindex(previous.as_ref(), row_id);
        previous
    }

    fn unindex(&mut self, previous: Option<&Value>, row_id: u64) {
        let Some(old_id) = previous.and_then(record_chunk_id) else { return };
        let still_here = self.records.get(&row_id).and_then(record_chunk_id) == Some(old_id);
        if !still_here && self.by_chunk.get(old_id) == Some(&row_id) {
            self.by_chunk.remove(old_id);
        }
    }

    /// The stored record for `row_id` as hit metadata.
    pub fn metadata_for(&self, row_id: u64) -> MatchMetadata {
        self.records.get(&row_id).cloned().map_or(MatchMetadata::Missing, MatchMetadata::from)
    }
}

fn record_chunk_id(record: &Value) -> Option<&str> {
    record.get("chunk_id").and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// The record stored for an upserted chunk.
pub fn chunk_record(chunk: &DocumentChunk) -> Value {
    json!({
        "chunk_id": chunk.id,
        "text": chunk.content,
        "source": chunk.source,
        "page": chunk.page,
        "offset": chunk.offset,
        "metadata": chunk.metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrieval_core::normalize::normalize;
    use retrieval_core::types::{BackendId, RawMatch, NO_CONTENT};

    fn store_from(json: &str) -> MetadataStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.meta.json");
        std::fs::write(&path, json).unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(MetadataStore::load(&path)).unwrap()
    }

    fn content(store: &MetadataStore, row_id: u64) -> (String, bool) {
        let raw = RawMatch { id: row_id.to_string(), score: 1.0, metadata: store.metadata_for(row_id) };
        let r = normalize(&raw, &BackendId::from("local"));
        (r.content, r.anomaly)
    }

    #[test]
    fn tolerates_historical_content_conventions() {
        let store = store_from(r#"{"format_version":1,"vector_count":4,"records":{
            "0": {"text": "primary"},
            "1": {"page_content": "alias", "metadata": {"source": "a.pdf"}},
            "2": "legacy bare text",
            "3": {"title": "no body"}
        }}"#);
        assert_eq!(store.declared_count(), Some(4));
        assert_eq!(content(&store, 0), ("primary".to_string(), false));
        assert_eq!(content(&store, 1), ("alias".to_string(), false));
        assert_eq!(content(&store, 2), ("legacy bare text".to_string(), false));
        assert_eq!(content(&store, 3), (NO_CONTENT.to_string(), true));
        assert_eq!(store.metadata_for(99), MatchMetadata::Missing);
        assert_eq!(content(&store, 99), (NO_CONTENT.to_string(), true));
    }

    #[test]
    fn reads_legacy_layouts() {
        let map = store_from(r#"{"0": "zero", "5": {"content": "five"}, "x": "ignored"}"#);
        assert_eq!(map.len(), 2);
        assert_eq!(map.declared_count(), None);
        assert_eq!(map.next_row_id(), 6);

        let list = store_from(r#"["a", {"text": "b", "chunk_id": "c1"}]"#);
        assert_eq!(list.len(), 2);
        assert_eq!(content(&list, 1).0, "b");
        assert_eq!(list.row_for_chunk("c1"), Some(1));
    }

    #[test]
    fn chunk_index_follows_inserts_and_removals() {
        let mut store = MetadataStore::new();
        assert_eq!(store.insert(0, json!({"chunk_id": "a", "text": "v1"})), None);
        assert_eq!(store.row_for_chunk("a"), Some(0));

        let previous = store.insert(0, json!({"chunk_id": "a", "text": "v2"}));
        assert_eq!(previous, Some(json!({"chunk_id": "a", "text": "v1"})));
        assert_eq!(store.row_for_chunk("a"), Some(0));

        store.insert(0, json!({"chunk_id": "b", "text": "other"}));
        assert_eq!(store.row_for_chunk("a"), None);
        assert_eq!(store.row_for_chunk("b"), Some(0));

        store.remove(0);
        assert_eq!(store.row_for_chunk("b"), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn save_round_trips_with_embedded_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.meta.json");
        let mut store = MetadataStore::default();
        store.insert(0, json!({"text": "zero"}));
        store.insert(1, json!("one"));
        store.save(&path).await.unwrap();

        let loaded = MetadataStore::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.declared_count(), Some(2));
        assert_eq!(loaded.get(1), Some(&json!("one")));
    }
}
