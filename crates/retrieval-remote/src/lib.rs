//! Remote managed vector service adapter.
//!
//! Talks to a Qdrant-compatible REST endpoint: `/healthz` for probes,
//! `/collections/{name}/points/search` for queries and
//! `/collections/{name}/points` for writes.

pub mod backend;
pub mod wire;

pub use backend::{classify_status, RemoteManagedBackend};
