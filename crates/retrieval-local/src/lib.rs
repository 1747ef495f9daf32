//! retrieval-local
//!
//! Local approximate-nearest-neighbor backend. Each physical index is a
//! LanceDB table (`<root>/<index>.lance`) with a companion metadata store
//! (`<root>/<index>.meta.json`) mapping row ids to chunk records.

pub mod backend;
pub mod index;
pub mod metadata_store;
pub mod schema;
pub mod table;

pub use backend::LocalAnnBackend;
pub use index::LocalIndex;
pub use metadata_store::MetadataStore;
