//! Configuration management for rlaas.
//!
//! Values come from an optional YAML file with `RLAAS_`-prefixed environment
//! variables layered on top, using `__` between nested keys
//! (`RLAAS_STORE__REDIS_URL=redis://cache:6379`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{RlaasError, Result};

/// Main configuration for the rlaas service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RlaasConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rule table and rule cache configuration
    #[serde(default)]
    pub rules: RulesConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Deadline for one limit check, in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 50051))
}

fn default_request_timeout() -> u64 {
    2000
}

/// Which counter store to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis; required when more than one instance serves traffic.
    Redis,
    /// Process-local store for single-instance use.
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on one store round trip in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Connection attempts made at startup before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Pause between startup connection attempts in milliseconds
    #[serde(default = "default_connect_backoff")]
    pub connect_backoff_ms: u64,

    /// Expiry for token bucket state of idle identities, in seconds
    #[serde(default = "default_bucket_ttl")]
    pub bucket_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
            command_timeout_ms: default_command_timeout(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff(),
            bucket_ttl_secs: default_bucket_ttl(),
        }
    }
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_command_timeout() -> u64 {
    500
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_connect_backoff() -> u64 {
    2000
}

fn default_bucket_ttl() -> u64 {
    3600
}

/// Which durable rule table to read rules from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleBackend {
    Sqlite,
    Memory,
}

/// Rule table and rule cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_rule_backend")]
    pub backend: RuleBackend,

    /// SQLite database file holding the rules table
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// How long a loaded rule snapshot is served before reloading, in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Keep serving the last loaded rules when a reload fails
    #[serde(default = "default_true")]
    pub serve_stale_on_error: bool,

    /// Insert the built-in baseline rules at startup if they are missing
    #[serde(default = "default_true")]
    pub seed_defaults: bool,

    /// YAML file of additional rules inserted at startup if missing
    #[serde(default)]
    pub seed_file: Option<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            backend: default_rule_backend(),
            database_path: default_database_path(),
            cache_ttl_secs: default_cache_ttl(),
            serve_stale_on_error: true,
            seed_defaults: true,
            seed_file: None,
        }
    }
}

fn default_rule_backend() -> RuleBackend {
    RuleBackend::Sqlite
}

fn default_database_path() -> String {
    "./data/rlaas.db".to_string()
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl RlaasConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix("RLAAS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RlaasError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RlaasError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RlaasConfig::default();
        assert_eq!(config.server.grpc_addr.port(), 50051);
        assert_eq!(config.server.request_timeout_ms, 2000);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.bucket_ttl_secs, 3600);
        assert_eq!(config.rules.cache_ttl_secs, 30);
        assert!(config.rules.serve_stale_on_error);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
store:
  backend: memory
  command_timeout_ms: 250
rules:
  backend: memory
  cache_ttl_secs: 5
"#;
        let config = RlaasConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.command_timeout_ms, 250);
        assert_eq!(config.store.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.rules.backend, RuleBackend::Memory);
        assert_eq!(config.rules.cache_ttl_secs, 5);
        assert!(config.rules.seed_defaults);
    }

    #[test]
    fn test_unknown_backend_is_config_error() {
        let yaml = r#"
store:
  backend: memcached
"#;
        let err = RlaasConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, RlaasError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = RlaasConfig::load(Some("/nonexistent/rlaas.yaml")).unwrap_err();
        assert!(matches!(err, RlaasError::Config(_)));
    }
}
