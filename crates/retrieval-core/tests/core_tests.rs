use std::fs;

use retrieval_core::config::{RetrievalConfig, DEFAULT_HEALTH_TIMEOUT_MS};
use retrieval_core::types::{BackendKind, ConnectionParams, Role};
use tempfile::TempDir;

const BYLAWS: &str = r#"
[health]
interval_secs = 10

[[backends]]
id = "local"
kind = "local_ann"
path = "indexes"

[[backends]]
id = "remote"
kind = "remote_managed"
url = "http://localhost:6333"
search_timeout_ms = 5000
health_timeout_ms = 500

[[collections.bylaws]]
backend = "remote"
index = "bylaws_v2"
role = "fallback"

[[collections.bylaws]]
backend = "local"
index = "bylaws"
"#;

#[test]
fn parses_backends_and_chains() {
    let config = RetrievalConfig::from_toml_str(BYLAWS).expect("valid config");
    assert_eq!(config.health.interval_secs, 10);
    assert_eq!(config.health.failure_threshold, 3, "default threshold");
    assert_eq!(config.backends.len(), 2);

    let remote = config.backend("remote").expect("remote backend");
    assert_eq!(remote.kind, BackendKind::RemoteManaged);
    assert_eq!(remote.search_timeout_ms, 5000);
    let local = config.backend("local").expect("local backend");
    assert_eq!(local.health_timeout_ms, DEFAULT_HEALTH_TIMEOUT_MS);

    let chain = &config.collections["bylaws"];
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].role, Role::Fallback);
    assert_eq!(chain[1].role, Role::Primary, "role defaults to primary");
}

#[test]
fn rejects_unknown_backend_reference() {
    let toml = r#"
[[backends]]
id = "local"
kind = "local_ann"
path = "/tmp/x"

[[collections.docs]]
backend = "missing"
index = "docs"
"#;
    let err = RetrievalConfig::from_toml_str(toml).expect_err("unknown backend");
    assert!(err.to_string().contains("unknown backend 'missing'"), "{err}");
}

#[test]
fn rejects_search_timeout_not_above_health_timeout() {
    let toml = r#"
[[backends]]
id = "remote"
kind = "remote_managed"
url = "http://localhost:6333"
search_timeout_ms = 1000
health_timeout_ms = 1000
"#;
    assert!(RetrievalConfig::from_toml_str(toml).is_err());
}

#[test]
fn rejects_duplicate_and_reserved_ids() {
    let dup = r#"
[[backends]]
id = "a"
kind = "local_ann"
path = "/x"

[[backends]]
id = "a"
kind = "local_ann"
path = "/y"
"#;
    assert!(RetrievalConfig::from_toml_str(dup).is_err());
    let reserved = r#"
[[backends]]
id = "fallback-mock"
kind = "local_ann"
path = "/x"
"#;
    assert!(RetrievalConfig::from_toml_str(reserved).is_err());
}

#[test]
fn rejects_remote_without_scheme() {
    let toml = r#"
[[backends]]
id = "remote"
kind = "remote_managed"
url = "localhost:6333"
"#;
    assert!(RetrievalConfig::from_toml_str(toml).is_err());
}

#[test]
fn env_overlay_file_overrides_base() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("config.toml"), BYLAWS).unwrap();
    fs::write(tmp.path().join("config.test.toml"), "[health]\nfailure_threshold = 5\n").unwrap();

    let figment = RetrievalConfig::figment_for(tmp.path(), "test");
    let config = RetrievalConfig::from_figment(figment).expect("merged config");
    assert_eq!(config.health.failure_threshold, 5);
    assert_eq!(config.health.interval_secs, 10, "base value survives the overlay");
}

#[test]
fn local_paths_resolve_against_config_dir() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("retrieval.toml");
    fs::write(&file, BYLAWS).unwrap();
    let config = RetrievalConfig::from_toml_file(&file).expect("config");
    let local = config.backend("local").unwrap();
    match local.connection(&config.base_dir).unwrap() {
        ConnectionParams::Local { path } => assert_eq!(path, tmp.path().join("indexes")),
        other => panic!("unexpected connection {other:?}"),
    }
}

#[test]
fn local_path_with_unset_variable_is_rejected() {
    let toml = r#"
[[backends]]
id = "local"
kind = "local_ann"
path = "${RETRIEVAL_TEST_UNSET_INDEX_ROOT}/indexes"
"#;
    let err = RetrievalConfig::from_toml_str(toml).expect_err("unset variable");
    assert!(err.to_string().contains("RETRIEVAL_TEST_UNSET_INDEX_ROOT"), "{err}");
}
