use std::time::Duration;

use thiserror::Error;

use crate::types::{BackendId, CollectionRef, RawMatch};

/// Adapter-level failure. The router decides per variant whether to fail
/// over, surface, or absorb it.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("partial result with {} usable matches: {reason}", .matches.len())]
    PartialResult { matches: Vec<RawMatch>, reason: String },

    #[error("filter key '{0}' is not supported by this backend")]
    UnsupportedFilter(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("index inconsistent: {0}")]
    IndexInconsistent(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BackendError {
    /// True when the backend positively reported an outage, as opposed to a
    /// timeout or an unclassified failure.
    pub fn is_explicit_outage(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::IndexNotFound(_))
    }
}

/// Error returned to callers of the retrieval layer.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(CollectionRef),

    #[error("upsert to backend '{backend}' failed: {source}")]
    UpsertFailed { backend: BackendId, source: BackendError },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RetrievalError {
    /// Caller errors: bad arguments or an unconfigured collection.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::UnknownCollection(_))
    }
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
