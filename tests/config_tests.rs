//! Comprehensive tests for configuration loading
//! Tests file parsing, environment overrides and validation

use std::io::Write;
use std::sync::Mutex;
use worldcomm::config::{read_configuration, CoordinatorConfig, ServerConfig};
use worldcomm::error::CommError;

// Environment overrides are process-global; tests touching or
// observing them take this lock so parallel runs stay deterministic.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn test_read_coordinator_config_with_defaults() {
    let _env = ENV_LOCK.lock().expect("env lock");
    let file = write_config(
        r#"{
            "coordinator_url": "ws://coordinator.local/connect",
            "identity_url": "http://identity.local",
            "server_secret": "secret"
        }"#,
    );
    let config: CoordinatorConfig = read_configuration(file.path()).expect("read config");
    config.validate().expect("valid config");

    assert_eq!(config.port, 9090);
    assert_eq!(config.auth_ttl, 60);
    assert_eq!(config.report_period, 10);
    assert_eq!(config.outbound_queue_size, 256);
}

#[test]
fn test_read_server_config_with_defaults() {
    let _env = ENV_LOCK.lock().expect("env lock");
    let file = write_config(
        r#"{
            "coordinator_url": "ws://coordinator.local/connect",
            "identity_url": "http://identity.local",
            "server_secret": "secret"
        }"#,
    );
    let config: ServerConfig = read_configuration(file.path()).expect("read config");
    config.validate().expect("valid config");

    assert_eq!(config.subscription_max_per_peer, 1024);
    assert_eq!(config.subscription_debounce_ms, 100);
    assert_eq!(config.auth_timeout_secs, 10);
    assert_eq!(config.ice_timeout_secs, 20);
    assert_eq!(config.send_timeout_secs, 5);
    assert_eq!(config.max_body_len, 64 * 1024);
    assert!(config.exit_on_coordinator_close);
    assert!(!config.ice_servers.is_empty());
}

#[test]
fn test_environment_overrides() {
    let _env = ENV_LOCK.lock().expect("env lock");
    let file = write_config(
        r#"{
            "coordinator_url": "ws://coordinator.local/connect",
            "identity_url": "http://identity.local",
            "server_secret": "from-file",
            "auth_ttl": 60
        }"#,
    );
    // Env overrides replace top-level keys; numbers parse as JSON.
    std::env::set_var("WORLDCOMM_SERVER_SECRET", "from-env");
    std::env::set_var("WORLDCOMM_AUTH_TTL", "120");
    let config: ServerConfig = read_configuration(file.path()).expect("read config");
    std::env::remove_var("WORLDCOMM_SERVER_SECRET");
    std::env::remove_var("WORLDCOMM_AUTH_TTL");

    assert_eq!(config.server_secret, "from-env");
    assert_eq!(config.auth_ttl, 120);
}

#[test]
fn test_missing_file_is_config_error() {
    let result: Result<ServerConfig, _> =
        read_configuration(std::path::Path::new("/does/not/exist.json"));
    assert!(matches!(result, Err(CommError::Config(_))));
}

#[test]
fn test_malformed_file_is_config_error() {
    let file = write_config("not json");
    let result: Result<ServerConfig, _> = read_configuration(file.path());
    assert!(matches!(result, Err(CommError::Config(_))));
}

#[test]
fn test_validation_rejects_empty_secret() {
    let _env = ENV_LOCK.lock().expect("env lock");
    let file = write_config(
        r#"{
            "coordinator_url": "ws://coordinator.local/connect",
            "identity_url": "http://identity.local",
            "server_secret": ""
        }"#,
    );
    let config: ServerConfig = read_configuration(file.path()).expect("read config");
    assert!(matches!(config.validate(), Err(CommError::Config(_))));
}

#[test]
fn test_validation_rejects_missing_urls() {
    let _env = ENV_LOCK.lock().expect("env lock");
    let file = write_config(r#"{ "coordinator_url": "", "identity_url": "", "server_secret": "s" }"#);
    let config: CoordinatorConfig = read_configuration(file.path()).expect("read config");
    assert!(matches!(config.validate(), Err(CommError::Config(_))));
}

#[test]
fn test_validation_rejects_zero_queue() {
    let _env = ENV_LOCK.lock().expect("env lock");
    let file = write_config(
        r#"{
            "coordinator_url": "ws://coordinator.local/connect",
            "identity_url": "http://identity.local",
            "server_secret": "secret",
            "outbound_queue_size": 0
        }"#,
    );
    let config: ServerConfig = read_configuration(file.path()).expect("read config");
    assert!(matches!(config.validate(), Err(CommError::Config(_))));
}
