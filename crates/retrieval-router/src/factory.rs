use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use retrieval_core::config::BackendConfig;
use retrieval_core::error::{Result, RetrievalError};
use retrieval_core::traits::VectorBackend;
use retrieval_core::types::ConnectionParams;
use retrieval_local::LocalAnnBackend;
use retrieval_remote::RemoteManagedBackend;

/// Adapter for one configured backend. Nothing is opened yet; connections
/// are made lazily on first use.
pub fn build_backend(cfg: &BackendConfig, base: &Path) -> Result<(Arc<dyn VectorBackend>, ConnectionParams)> {
    let connection = cfg.connection(base)?;
    let backend: Arc<dyn VectorBackend> = match &connection {
        ConnectionParams::Local { path } => Arc::new(LocalAnnBackend::new(cfg.backend_id(), path.clone())),
        ConnectionParams::Remote { url, api_key } => Arc::new(
            RemoteManagedBackend::new(cfg.backend_id(), url, api_key.clone(), cfg.search_timeout())
                .map_err(|e| RetrievalError::InvalidConfig(format!("backend '{}': {}", cfg.id, e)))?,
        ),
        ConnectionParams::Builtin => {
            return Err(RetrievalError::InvalidConfig(format!("backend '{}' cannot be configured", cfg.id)));
        }
    };
    debug!(backend = %cfg.id, kind = %cfg.kind, connection = ?connection, "built backend adapter");
    Ok((backend, connection))
}
