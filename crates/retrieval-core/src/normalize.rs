//! Conversion of backend-native hits into the canonical [`SearchResult`].
//!
//! [`normalize`] is a pure function of the hit and its origin. [`Normalizer`]
//! wraps it and reports anomalous record shapes once each.

use tracing::warn;

use crate::anomaly::AnomalyLog;
use crate::fields::{self, CHUNK_ID_FIELDS, CONTENT_FIELDS, SOURCE_FIELDS};
use crate::types::{BackendId, MatchMetadata, PageRef, RawMatch, SearchResult, NO_CONTENT, UNKNOWN};

pub fn normalize(raw: &RawMatch, origin: &BackendId) -> SearchResult {
    match &raw.metadata {
        MatchMetadata::Text(text) => {
            let blank = text.trim().is_empty();
            SearchResult {
                content: if blank { NO_CONTENT.to_string() } else { text.clone() },
                source: UNKNOWN.to_string(),
                page: PageRef::Unknown,
                score: raw.score,
                chunk_id: UNKNOWN.to_string(),
                origin_backend: origin.clone(),
                anomaly: blank,
            }
        }
        MatchMetadata::Missing => SearchResult {
            content: NO_CONTENT.to_string(),
            source: UNKNOWN.to_string(),
            page: PageRef::Unknown,
            score: raw.score,
            chunk_id: raw_id(raw).unwrap_or_else(|| UNKNOWN.to_string()),
            origin_backend: origin.clone(),
            anomaly: true,
        },
        MatchMetadata::Structured(record) => {
            let content = fields::lookup_text(record, CONTENT_FIELDS);
            let anomaly = content.is_none();
            SearchResult {
                content: content.unwrap_or_else(|| NO_CONTENT.to_string()),
                source: fields::lookup_text(record, SOURCE_FIELDS).unwrap_or_else(|| UNKNOWN.to_string()),
                page: fields::lookup_page(record).map_or(PageRef::Unknown, PageRef::Number),
                score: raw.score,
                chunk_id: fields::lookup_text(record, CHUNK_ID_FIELDS)
                    .or_else(|| raw_id(raw))
                    .unwrap_or_else(|| UNKNOWN.to_string()),
                origin_backend: origin.clone(),
                anomaly,
            }
        }
    }
}

fn raw_id(raw: &RawMatch) -> Option<String> {
    let id = raw.id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

#[derive(Debug, Default)]
pub struct Normalizer {
    anomalies: AnomalyLog,
}

impl Normalizer {
    pub fn new() -> Self { Self::default() }

    pub fn normalize(&self, raw: &RawMatch, origin: &BackendId) -> SearchResult {
        let result = normalize(raw, origin);
        if result.anomaly {
            let shape = fields::shape_of(&raw.metadata);
            if self.anomalies.first_sighting(origin.as_str(), &shape) {
                warn!(backend = %origin, id = %raw.id, shape = %shape, "normalization anomaly: no usable content field");
            }
        }
        result
    }

    /// Normalizes a backend's hits, keeping the order the backend returned.
    pub fn normalize_all(&self, raws: &[RawMatch], origin: &BackendId) -> Vec<SearchResult> {
        raws.iter().map(|r| self.normalize(r, origin)).collect()
    }

    pub fn distinct_anomaly_shapes(&self) -> usize { self.anomalies.distinct_shapes() }
}
