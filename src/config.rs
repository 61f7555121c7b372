//! Configuration loading
//!
//! JSON config files deserialized with serde, with per-key environment
//! overrides (`WORLDCOMM_<UPPER_SNAKE_KEY>`) applied before
//! deserialization and validation after it. Config errors abort
//! startup; nothing here is recoverable at runtime.

use crate::error::{CommError, CommResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for config overrides
const ENV_PREFIX: &str = "WORLDCOMM_";

/// Coordinator service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_coordinator_port")]
    pub port: u16,
    /// Public URL clients sign their connect requests against
    pub coordinator_url: String,
    /// Identity service base URL
    pub identity_url: String,
    /// Shared secret presented by communication servers
    pub server_secret: String,
    /// Credential timestamp window, seconds
    #[serde(default = "default_auth_ttl")]
    pub auth_ttl: i64,
    /// Hard cap on simultaneously registered peers
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Stats snapshot interval, seconds
    #[serde(default = "default_report_period")]
    pub report_period: u64,
    /// Per-socket outbound queue length; overflow closes the socket
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Communication server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Coordinator signaling endpoint, e.g. `ws://host:port/connect`
    pub coordinator_url: String,
    /// Identity service base URL
    pub identity_url: String,
    /// Shared secret for the coordinator and other servers
    pub server_secret: String,
    /// Credential timestamp window, seconds
    #[serde(default = "default_auth_ttl")]
    pub auth_ttl: i64,
    /// STUN server URLs injected into every peer connection
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    /// Hard cap on simultaneously connected peers
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Stats snapshot interval, seconds
    #[serde(default = "default_report_period")]
    pub report_period: u64,
    /// Per-lane outbound queue length
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    /// Topic cap per peer; additions beyond it are dropped
    #[serde(default = "default_subscription_max_per_peer")]
    pub subscription_max_per_peer: usize,
    /// Aggregate subscription coalescing window, milliseconds
    #[serde(default = "default_subscription_debounce_ms")]
    pub subscription_debounce_ms: u64,
    /// Seconds a peer may sit unauthenticated after channels open
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Seconds allowed for ICE establishment
    #[serde(default = "default_ice_timeout_secs")]
    pub ice_timeout_secs: u64,
    /// Seconds allowed for connection accept
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Reliable-lane per-message send timeout, seconds
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Per-envelope body limit, bytes
    #[serde(default = "default_max_body_len")]
    pub max_body_len: usize,
    /// Exit the process when the coordinator link closes instead of
    /// letting established sessions drain
    #[serde(default = "default_true")]
    pub exit_on_coordinator_close: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_coordinator_port() -> u16 {
    9090
}
fn default_auth_ttl() -> i64 {
    60
}
fn default_max_peers() -> usize {
    1024
}
fn default_report_period() -> u64 {
    10
}
fn default_outbound_queue_size() -> usize {
    256
}
fn default_subscription_max_per_peer() -> usize {
    1024
}
fn default_subscription_debounce_ms() -> u64 {
    100
}
fn default_auth_timeout_secs() -> u64 {
    10
}
fn default_ice_timeout_secs() -> u64 {
    20
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_send_timeout_secs() -> u64 {
    5
}
fn default_max_body_len() -> usize {
    64 * 1024
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

/// Read a config file and apply environment overrides.
///
/// The file is parsed to a JSON object first so `WORLDCOMM_<KEY>`
/// variables can replace individual top-level keys before the typed
/// deserialization runs. String-typed keys take the variable verbatim;
/// everything else is parsed as JSON.
pub fn read_configuration<T: DeserializeOwned>(path: &Path) -> CommResult<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CommError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let mut value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| CommError::Config(format!("cannot parse {}: {}", path.display(), e)))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| CommError::Config("config root must be an object".to_string()))?;

    for (env_key, env_value) in std::env::vars() {
        let Some(key) = env_key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let key = key.to_ascii_lowercase();
        let parsed = match serde_json::from_str::<serde_json::Value>(&env_value) {
            Ok(v) if !v.is_string() => v,
            _ => serde_json::Value::String(env_value),
        };
        object.insert(key, parsed);
    }

    serde_json::from_value(value).map_err(|e| CommError::Config(format!("invalid config: {}", e)))
}

impl CoordinatorConfig {
    pub fn validate(&self) -> CommResult<()> {
        if self.coordinator_url.is_empty() {
            return Err(CommError::Config("coordinator_url is required".to_string()));
        }
        if self.identity_url.is_empty() {
            return Err(CommError::Config("identity_url is required".to_string()));
        }
        if self.server_secret.is_empty() {
            return Err(CommError::Config("server_secret is required".to_string()));
        }
        if self.auth_ttl <= 0 {
            return Err(CommError::Config("auth_ttl must be positive".to_string()));
        }
        if self.outbound_queue_size == 0 {
            return Err(CommError::Config(
                "outbound_queue_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> CommResult<()> {
        if self.coordinator_url.is_empty() {
            return Err(CommError::Config("coordinator_url is required".to_string()));
        }
        if self.identity_url.is_empty() {
            return Err(CommError::Config("identity_url is required".to_string()));
        }
        if self.server_secret.is_empty() {
            return Err(CommError::Config("server_secret is required".to_string()));
        }
        if self.auth_ttl <= 0 {
            return Err(CommError::Config("auth_ttl must be positive".to_string()));
        }
        if self.ice_servers.is_empty() {
            return Err(CommError::Config(
                "at least one ICE server is required".to_string(),
            ));
        }
        if self.outbound_queue_size == 0 {
            return Err(CommError::Config(
                "outbound_queue_size must be positive".to_string(),
            ));
        }
        if self.subscription_max_per_peer == 0 {
            return Err(CommError::Config(
                "subscription_max_per_peer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
