#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod anomaly;
pub mod config;
pub mod error;
pub mod fields;
pub mod normalize;
pub mod traits;
pub mod types;

pub use error::{BackendError, RetrievalError};
pub use normalize::{normalize, Normalizer};
pub use traits::VectorBackend;
