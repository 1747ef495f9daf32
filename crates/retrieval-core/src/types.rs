//! Domain types shared by the backend adapters and the router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

pub type ChunkId = String;
pub type Meta = HashMap<String, String>;

/// Key/value equality constraints applied to a search.
pub type Filters = BTreeMap<String, String>;

/// Content used when no usable text field could be found for a hit.
pub const NO_CONTENT: &str = "[no content available]";
/// Sentinel for source and chunk id when the backend did not supply one.
pub const UNKNOWN: &str = "unknown";

/// Logical, caller-facing name of a retrievable document set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionRef(String);

impl CollectionRef {
    pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for CollectionRef {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for CollectionRef {
    fn from(s: String) -> Self { Self(s) }
}

/// Identity of one physical backend as named in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for BackendId {
    fn from(s: String) -> Self { Self(s) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    LocalAnn,
    RemoteManaged,
    Mock,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { Self::LocalAnn => "local-ann", Self::RemoteManaged => "remote-managed", Self::Mock => "mock" };
        f.write_str(s)
    }
}

/// Position of a backend within a collection's chain. Primaries are tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Primary,
    Fallback,
}

/// How to reach a backend.
#[derive(Clone, PartialEq, Eq)]
pub enum ConnectionParams {
    Local { path: PathBuf },
    Remote { url: String, api_key: Option<String> },
    Builtin,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => f.debug_struct("Local").field("path", path).finish(),
            Self::Remote { url, api_key } => f
                .debug_struct("Remote")
                .field("url", url)
                .field("api_key", &api_key.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::Builtin => f.write_str("Builtin"),
        }
    }
}

/// A backend as it appears in one collection's chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub id: BackendId,
    pub kind: BackendKind,
    pub connection: ConnectionParams,
    pub role: Role,
    pub ordinal: usize,
}

/// A chunk of a source document as written by ingestion.
///
/// - `id`: globally unique chunk identifier
/// - `source`: source document identifier (file name, URL, ...)
/// - `page`/`offset`: optional position within the source
/// - `metadata`: origin-defined key/value pairs
/// - `embedding`: the vector used to index the chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: ChunkId,
    pub content: String,
    pub source: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub metadata: Meta,
    pub embedding: Vec<f32>,
}

/// Metadata payload attached to a backend-native hit.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchMetadata {
    Structured(serde_json::Map<String, serde_json::Value>),
    /// Legacy/degraded records where the payload is the text itself.
    Text(String),
    Missing,
}

impl From<serde_json::Value> for MatchMetadata {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Object(map) => Self::Structured(map),
            Value::String(s) => Self::Text(s),
            Value::Number(n) => Self::Text(n.to_string()),
            Value::Bool(b) => Self::Text(b.to_string()),
            Value::Null | Value::Array(_) => Self::Missing,
        }
    }
}

/// Backend-native search hit before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMatch {
    pub id: String,
    pub score: f32,
    pub metadata: MatchMetadata,
}

/// Page number of a hit, or the explicit unknown sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageRef {
    Number(u32),
    Unknown,
}

impl PageRef {
    pub fn number(self) -> Option<u32> {
        match self { Self::Number(n) => Some(n), Self::Unknown => None }
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self { Self::Number(n) => write!(f, "{n}"), Self::Unknown => f.write_str(UNKNOWN) }
    }
}

impl Serialize for PageRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.serialize_u32(*n),
            Self::Unknown => serializer.serialize_str(UNKNOWN),
        }
    }
}

/// The only hit shape a caller ever sees.
///
/// Every field is populated; missing data uses [`NO_CONTENT`], [`UNKNOWN`] or
/// [`PageRef::Unknown`]. `score` keeps the origin backend's native scale and
/// is not comparable across backends. `anomaly` marks hits whose metadata
/// could not be resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub content: String,
    pub source: String,
    pub page: PageRef,
    pub score: f32,
    pub chunk_id: ChunkId,
    pub origin_backend: BackendId,
    pub anomaly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { Self::Unknown => "unknown", Self::Healthy => "healthy", Self::Degraded => "degraded", Self::Unreachable => "unreachable" };
        f.write_str(s)
    }
}

/// Cached health of one backend. Written only by the health monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub backend: BackendId,
    pub state: HealthState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl BackendStatus {
    pub fn unknown(backend: BackendId) -> Self {
        Self { backend, state: HealthState::Unknown, last_checked_at: None, last_error: None, consecutive_failures: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexDescription {
    pub dimension: usize,
    pub vector_count: usize,
}

/// Outcome of a routed search.
///
/// `degraded` is set when every real backend was unavailable and the
/// placeholder set was returned; `notice` then carries the reason.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub used_backend: BackendId,
    pub degraded: bool,
    pub notice: Option<String>,
}
