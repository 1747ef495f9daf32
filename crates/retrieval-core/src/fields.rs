//! Prioritized field lookup over heterogeneous metadata records.
//!
//! Stored records use several historical conventions for where the chunk text,
//! source and page live. Each lookup walks an ordered list of field names and
//! takes the first present, non-empty value. Top-level fields win over fields
//! nested under one of [`NESTED_FIELDS`].

use serde_json::{Map, Value};

use crate::types::MatchMetadata;

pub const CONTENT_FIELDS: &[&str] = &["text", "content", "page_content", "chunk_text", "chunk", "body"];
pub const SOURCE_FIELDS: &[&str] = &["source", "source_file", "file_name", "filename", "doc_path", "path", "document", "url"];
pub const PAGE_FIELDS: &[&str] = &["page", "page_number", "page_num", "pageno"];
pub const CHUNK_ID_FIELDS: &[&str] = &["chunk_id", "chunk_index", "id"];
pub const NESTED_FIELDS: &[&str] = &["metadata", "payload"];

/// First non-empty textual value among `keys`.
pub fn lookup_text(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    find_map_nested(record, |r| keys.iter().find_map(|k| r.get(*k).and_then(value_to_text)))
}

/// First value among [`PAGE_FIELDS`] that parses as a page number.
pub fn lookup_page(record: &Map<String, Value>) -> Option<u32> {
    find_map_nested(record, |r| PAGE_FIELDS.iter().find_map(|k| r.get(*k).and_then(parse_page)))
}

fn find_map_nested<T>(record: &Map<String, Value>, f: impl Fn(&Map<String, Value>) -> Option<T>) -> Option<T> {
    f(record).or_else(|| {
        NESTED_FIELDS
            .iter()
            .filter_map(|n| record.get(*n).and_then(Value::as_object))
            .find_map(&f)
    })
}

/// Scalar values rendered as text. Blank strings, objects and arrays do not count.
pub fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse a numeric-looking value into a page number.
///
/// Accepts non-negative integers, integral floats and strings holding either.
pub fn parse_page(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|x| u32::try_from(x).ok())
            .or_else(|| n.as_f64().and_then(integral_page)),
        Value::String(s) => {
            let t = s.trim();
            t.parse::<u32>().ok().or_else(|| t.parse::<f64>().ok().and_then(integral_page))
        }
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn integral_page(f: f64) -> Option<u32> {
    if f.is_finite() && f.fract() == 0.0 && f >= 0.0 && f <= f64::from(u32::MAX) {
        Some(f as u32)
    } else {
        None
    }
}

/// Stable description of a record's shape: its sorted key set, or the
/// payload kind for non-structured metadata.
pub fn shape_of(metadata: &MatchMetadata) -> String {
    match metadata {
        MatchMetadata::Structured(record) => record_shape(record),
        MatchMetadata::Text(_) => "<text>".to_string(),
        MatchMetadata::Missing => "<missing>".to_string(),
    }
}

pub fn record_shape(record: &Map<String, Value>) -> String {
    let mut keys: Vec<&str> = record.keys().map(String::as_str).collect();
    keys.sort_unstable();
    format!("{{{}}}", keys.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v { Value::Object(m) => m, _ => panic!("expected object") }
    }

    #[test]
    fn first_non_empty_field_wins() {
        let r = obj(json!({"text": "  ", "content": "second", "page_content": "third"}));
        assert_eq!(lookup_text(&r, CONTENT_FIELDS).as_deref(), Some("second"));
    }

    #[test]
    fn top_level_beats_nested() {
        let r = obj(json!({"source": "top.pdf", "metadata": {"source": "nested.pdf"}}));
        assert_eq!(lookup_text(&r, SOURCE_FIELDS).as_deref(), Some("top.pdf"));
        let r = obj(json!({"metadata": {"file_name": "nested.pdf"}}));
        assert_eq!(lookup_text(&r, SOURCE_FIELDS).as_deref(), Some("nested.pdf"));
    }

    #[test]
    fn page_parsing() {
        assert_eq!(parse_page(&json!(12)), Some(12));
        assert_eq!(parse_page(&json!(3.0)), Some(3));
        assert_eq!(parse_page(&json!(" 7 ")), Some(7));
        assert_eq!(parse_page(&json!("12.0")), Some(12));
        assert_eq!(parse_page(&json!(2.5)), None);
        assert_eq!(parse_page(&json!(-1)), None);
        assert_eq!(parse_page(&json!("Unknown")), None);
        assert_eq!(parse_page(&json!("page 4")), None);
        assert_eq!(parse_page(&json!(null)), None);
    }

    #[test]
    fn page_falls_through_to_numeric_alias() {
        let r = obj(json!({"page": "n/a", "page_number": "9"}));
        assert_eq!(lookup_page(&r), Some(9));
    }

    #[test]
    fn shape_is_sorted_keys() {
        let r = obj(json!({"b": 1, "a": 2}));
        assert_eq!(record_shape(&r), "{a,b}");
        assert_eq!(shape_of(&MatchMetadata::Text("x".into())), "<text>");
    }
}
