//! Figment-based configuration for backends and collection chains.
//!
//! Merges `config.toml` + `config.<env>.toml` + `RETRIEVAL_*` env vars and
//! validates the result before anything is built from it, so a bad reload never
//! replaces a working mapping.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RetrievalError};
use crate::types::{BackendId, BackendKind, ConnectionParams, Role};

/// Id reserved for the built-in placeholder backend.
pub const MOCK_BACKEND_ID: &str = "fallback-mock";

pub const DEFAULT_SEARCH_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 1_500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Collection name to its ordered backend chain.
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<ChainEntryConfig>>,
    /// Directory relative local paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    /// Consecutive failures that force a backend to Unreachable.
    pub failure_threshold: u32,
    /// Consecutive search failures that trigger an immediate probe.
    pub search_failures_before_probe: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_secs: 30, failure_threshold: 3, search_failures_before_probe: 2 }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration { Duration::from_secs(self.interval_secs) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub kind: BackendKind,
    /// Index directory of a `local_ann` backend.
    #[serde(default)]
    pub path: Option<String>,
    /// Base URL of a `remote_managed` backend.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
}

fn default_search_timeout_ms() -> u64 { DEFAULT_SEARCH_TIMEOUT_MS }
fn default_health_timeout_ms() -> u64 { DEFAULT_HEALTH_TIMEOUT_MS }

impl BackendConfig {
    pub fn backend_id(&self) -> BackendId { BackendId::new(self.id.clone()) }
    pub fn search_timeout(&self) -> Duration { Duration::from_millis(self.search_timeout_ms) }
    pub fn health_timeout(&self) -> Duration { Duration::from_millis(self.health_timeout_ms) }

    /// Connection parameters with `~` and `${VAR}` expanded and local paths
    /// resolved against `base`.
    pub fn connection(&self, base: &Path) -> Result<ConnectionParams> {
        match self.kind {
            BackendKind::LocalAnn => {
                let path = self.path.as_deref().ok_or_else(|| invalid(format!("backend '{}': local_ann requires 'path'", self.id)))?;
                let path = index_root(base, path).map_err(|e| invalid(format!("backend '{}': {}", self.id, e)))?;
                Ok(ConnectionParams::Local { path })
            }
            BackendKind::RemoteManaged => {
                let url = self.url.as_deref().ok_or_else(|| invalid(format!("backend '{}': remote_managed requires 'url'", self.id)))?;
                let url = expand_env(url).map_err(|e| invalid(format!("backend '{}': {}", self.id, e)))?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid(format!("backend '{}': url must start with http:// or https://", self.id)));
                }
                let api_key = match self.api_key.as_deref() {
                    Some(k) => Some(expand_env(k).map_err(|e| invalid(format!("backend '{}': api_key: {}", self.id, e)))?),
                    None => None,
                };
                Ok(ConnectionParams::Remote { url, api_key })
            }
            BackendKind::Mock => Err(invalid(format!("backend '{}': kind 'mock' is built in and cannot be configured", self.id))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntryConfig {
    pub backend: String,
    pub index: String,
    #[serde(default)]
    pub role: Role,
}

impl RetrievalConfig {
    /// Merge `config.toml` + `config.<RUST_ENV>.toml` + `RETRIEVAL_*` env vars
    /// from the current directory.
    pub fn load() -> Result<Self> { Self::load_from(Path::new(".")) }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        let mut config = Self::from_figment(Self::figment_for(dir, &env_name))?;
        config.base_dir = dir.to_path_buf();
        Ok(config)
    }

    pub fn figment_for(dir: &Path, env_name: &str) -> Figment {
        let mut figment = Figment::new().merge(Toml::file(dir.join("config.toml")));
        match env_name {
            "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
            _ => {}
        }
        figment.merge(Env::prefixed("RETRIEVAL_").split("__"))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().map_err(|e| invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Figment::from(Toml::string(toml)))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let mut config = Self::from_figment(Figment::from(Toml::file(path)))?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    pub fn backend(&self, id: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health.failure_threshold == 0 {
            return Err(invalid("health.failure_threshold must be at least 1"));
        }
        if self.health.interval_secs == 0 {
            return Err(invalid("health.interval_secs must be at least 1"));
        }
        let mut ids = HashSet::new();
        for b in &self.backends {
            if b.id.trim().is_empty() {
                return Err(invalid("backend id must not be empty"));
            }
            if b.id == MOCK_BACKEND_ID {
                return Err(invalid(format!("backend id '{MOCK_BACKEND_ID}' is reserved")));
            }
            if !ids.insert(b.id.as_str()) {
                return Err(invalid(format!("duplicate backend id '{}'", b.id)));
            }
            if b.health_timeout_ms == 0 || b.search_timeout_ms <= b.health_timeout_ms {
                return Err(invalid(format!(
                    "backend '{}': search_timeout_ms ({}) must exceed health_timeout_ms ({}) and both must be non-zero",
                    b.id, b.search_timeout_ms, b.health_timeout_ms
                )));
            }
            b.connection(&self.base_dir)?;
        }
        for (name, chain) in &self.collections {
            if chain.is_empty() {
                return Err(invalid(format!("collection '{name}' has an empty backend chain")));
            }
            for entry in chain {
                if !ids.contains(entry.backend.as_str()) {
                    return Err(invalid(format!("collection '{name}' references unknown backend '{}'", entry.backend)));
                }
                if entry.index.trim().is_empty() {
                    return Err(invalid(format!("collection '{name}': index name for backend '{}' is empty", entry.backend)));
                }
            }
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> RetrievalError { RetrievalError::InvalidConfig(msg.into()) }

fn expand_env(s: &str) -> std::result::Result<String, String> {
    shellexpand::env(s).map(|c| c.into_owned()).map_err(|e| e.to_string())
}

/// Local index root for a configured `path`: `~` and environment variables
/// are expanded, then a relative result is anchored at `base`, the directory
/// the configuration was read from. An unset variable is an error.
fn index_root(base: &Path, raw: &str) -> std::result::Result<PathBuf, String> {
    let expanded = shellexpand::full(raw).map_err(|e| format!("path '{raw}': {e}"))?;
    let path = PathBuf::from(expanded.as_ref());
    Ok(if path.is_absolute() { path } else { base.join(path) })
}
