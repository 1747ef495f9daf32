//! Request bodies and response parsing for the Qdrant-compatible REST API.
//!
//! Responses arrive wrapped as `{"result": ..., "status": "ok", "time": ...}`.
//! Search hits are parsed one by one so that a few malformed entries do not
//! discard the usable rest of the page.

use std::hash::Hasher;

use serde::Serialize;
use serde_json::{json, Value};
use twox_hash::XxHash64;

use retrieval_core::error::BackendError;
use retrieval_core::types::{DocumentChunk, Filters, IndexDescription, MatchMetadata, RawMatch};

#[derive(Debug, Serialize)]
pub struct SearchRequest<'a> {
    pub vector: &'a [f32],
    pub limit: usize,
    pub with_payload: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<SearchFilter>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct SearchFilter {
    pub must: Vec<FieldCondition>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct FieldCondition {
    pub key: String,
    #[serde(rename = "match")]
    pub matches: MatchValue,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct MatchValue {
    pub value: String,
}

/// Equality filters as a conjunction of `match` conditions on payload keys.
pub fn build_filter(filters: &Filters) -> Option<SearchFilter> {
    if filters.is_empty() {
        return None;
    }
    let must = filters
        .iter()
        .map(|(k, v)| FieldCondition { key: k.clone(), matches: MatchValue { value: v.clone() } })
        .collect();
    Some(SearchFilter { must })
}

#[derive(Debug, Serialize)]
pub struct UpsertRequest {
    pub points: Vec<PointStruct>,
}

#[derive(Debug, Serialize)]
pub struct PointStruct {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// Numeric point id derived from the chunk id; the service only accepts
/// unsigned integers or UUIDs.
pub fn point_id(chunk_id: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(chunk_id.as_bytes());
    hasher.finish()
}

pub fn to_point(chunk: &DocumentChunk) -> PointStruct {
    PointStruct {
        id: point_id(&chunk.id),
        vector: chunk.embedding.clone(),
        payload: json!({
            "chunk_id": chunk.id,
            "text": chunk.content,
            "source": chunk.source,
            "page": chunk.page,
            "offset": chunk.offset,
            "metadata": chunk.metadata,
        }),
    }
}

fn malformed(what: &str, detail: impl std::fmt::Display) -> BackendError {
    BackendError::Storage(format!("malformed {what} response: {detail}"))
}

fn result_of<'a>(body: &'a Value, what: &str) -> Result<&'a Value, BackendError> {
    body.get("result").ok_or_else(|| malformed(what, "missing 'result'"))
}

fn parse_hit(hit: &Value) -> Option<RawMatch> {
    let obj = hit.as_object()?;
    let id = match obj.get("id")? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    #[allow(clippy::cast_possible_truncation)]
    let score = obj.get("score")?.as_f64().filter(|s| s.is_finite())? as f32;
    let metadata = obj.get("payload").cloned().map_or(MatchMetadata::Missing, MatchMetadata::from);
    Some(RawMatch { id, score, metadata })
}

/// Hits of a search response. Some malformed hits yield
/// [`BackendError::PartialResult`] with the rest; an unusable body is a
/// storage error.
pub fn parse_search_response(body: &[u8]) -> Result<Vec<RawMatch>, BackendError> {
    let body: Value = serde_json::from_slice(body).map_err(|e| malformed("search", e))?;
    let hits = result_of(&body, "search")?.as_array().ok_or_else(|| malformed("search", "'result' is not a list"))?;
    let matches: Vec<RawMatch> = hits.iter().filter_map(parse_hit).collect();
    let bad = hits.len() - matches.len();
    if bad == 0 {
        return Ok(matches);
    }
    if matches.is_empty() {
        return Err(malformed("search", format!("all {bad} hits unusable")));
    }
    Err(BackendError::PartialResult { reason: format!("{bad} of {} hits were malformed", hits.len()), matches })
}

pub fn parse_collections(body: &[u8]) -> Result<Vec<String>, BackendError> {
    let body: Value = serde_json::from_slice(body).map_err(|e| malformed("collections", e))?;
    let list = result_of(&body, "collections")?
        .get("collections")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("collections", "missing 'collections' list"))?;
    Ok(list.iter().filter_map(|c| c.get("name").and_then(Value::as_str)).map(str::to_string).collect())
}

/// Dimension and point count from a collection info response. Named vector
/// configs report the first named vector's size.
pub fn parse_collection_info(body: &[u8]) -> Result<IndexDescription, BackendError> {
    let body: Value = serde_json::from_slice(body).map_err(|e| malformed("collection", e))?;
    let result = result_of(&body, "collection")?;
    let vectors = result.pointer("/config/params/vectors").ok_or_else(|| malformed("collection", "missing vector params"))?;
    let size = vectors
        .get("size")
        .and_then(Value::as_u64)
        .or_else(|| vectors.as_object().and_then(|m| m.values().find_map(|v| v.get("size").and_then(Value::as_u64))))
        .ok_or_else(|| malformed("collection", "missing vector size"))?;
    let count = ["points_count", "vectors_count"]
        .iter()
        .find_map(|k| result.get(*k).and_then(Value::as_u64))
        .unwrap_or(0);
    Ok(IndexDescription {
        dimension: usize::try_from(size).map_err(|e| malformed("collection", e))?,
        vector_count: usize::try_from(count).map_err(|e| malformed("collection", e))?,
    })
}
