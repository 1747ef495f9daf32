//! retrieval-router
//!
//! Resolves logical collections to ordered backend chains, fails over along
//! them using cached health, and always answers: with real normalized
//! results, or with clearly labeled placeholders and `degraded = true`.

pub mod factory;
pub mod health;
pub mod mock;
pub mod router;

pub use health::{HealthMonitor, ProbeOutcome};
pub use mock::MockBackend;
pub use router::{chain_entry, LinkDescription, RetrievalRouter, RouterBuilder};
