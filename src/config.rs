//! Server configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::sync::conflict::{ConflictPolicy, ConflictError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Strategy(#[from] ConflictError),

    #[error("{0}")]
    Missing(String),
}

/// Which recent-operations log backs the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpLogBackend {
    /// Bounded ring in this process
    Memory,
    /// Durable log in the sled database, shared by processes using the same path
    Sled,
}

impl FromStr for OpLogBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(OpLogBackend::Memory),
            "sled" => Ok(OpLogBackend::Sled),
            other => Err(format!("expected `memory` or `sled`, got `{}`", other)),
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage_path: String,
    /// Sled page cache size
    pub storage_cache_bytes: u64,
    /// HS256 secret for client credentials
    pub jwt_secret: Option<String>,
    /// Base URL of the permission service
    pub access_service_url: Option<String>,
    /// Development mode: every verified user may open every document
    pub allow_all_access: bool,
    pub oplog_backend: OpLogBackend,
    pub window_max_ops: usize,
    pub window_ttl: Duration,
    pub conflict_policy: ConflictPolicy,
    pub save_interval: Duration,
    pub cleanup_interval: Duration,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_document_chars: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            storage_path: "./data/codoc.sled".to_string(),
            storage_cache_bytes: 256 * 1024 * 1024,
            jwt_secret: None,
            access_service_url: None,
            allow_all_access: false,
            oplog_backend: OpLogBackend::Memory,
            window_max_ops: 500,
            window_ttl: Duration::from_secs(300),
            conflict_policy: ConflictPolicy::Transform,
            save_interval: Duration::from_millis(2000),
            cleanup_interval: Duration::from_secs(60),
            session_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            max_document_chars: 10 * 1024 * 1024,
        }
    }
}

fn parse_var<T>(
    name: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map(Some).map_err(|e| ConfigError::InvalidValue {
                name,
                reason: e.to_string(),
                value,
            })
        }
    }
}

impl ServerConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let conflict_policy = match non_empty("CONFLICT_POLICY") {
            Some(value) => value.parse::<ConflictPolicy>()?,
            None => defaults.conflict_policy,
        };

        let config = Self {
            port: parse_var("PORT", &lookup)?.unwrap_or(defaults.port),
            storage_path: non_empty("STORAGE_PATH").unwrap_or(defaults.storage_path),
            storage_cache_bytes: parse_var("STORAGE_CACHE_BYTES", &lookup)?
                .unwrap_or(defaults.storage_cache_bytes),
            jwt_secret: non_empty("JWT_SECRET"),
            access_service_url: non_empty("ACCESS_SERVICE_URL"),
            allow_all_access: parse_var("ALLOW_ALL_ACCESS", &lookup)?
                .unwrap_or(defaults.allow_all_access),
            oplog_backend: parse_var("OPLOG_BACKEND", &lookup)?.unwrap_or(defaults.oplog_backend),
            window_max_ops: parse_var("WINDOW_MAX_OPS", &lookup)?
                .unwrap_or(defaults.window_max_ops),
            window_ttl: parse_var("WINDOW_TTL_SECS", &lookup)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.window_ttl),
            conflict_policy,
            save_interval: parse_var("SAVE_INTERVAL_MS", &lookup)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.save_interval),
            cleanup_interval: parse_var("CLEANUP_INTERVAL_SECS", &lookup)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
            session_timeout: parse_var("SESSION_TIMEOUT_SECS", &lookup)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_timeout),
            heartbeat_interval: parse_var("HEARTBEAT_INTERVAL_SECS", &lookup)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            max_document_chars: parse_var("MAX_DOCUMENT_CHARS", &lookup)?
                .unwrap_or(defaults.max_document_chars),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_max_ops == 0 {
            return Err(ConfigError::InvalidValue {
                name: "WINDOW_MAX_OPS",
                value: "0".to_string(),
                reason: "the replay window must hold at least one change".to_string(),
            });
        }
        for (name, value) in [
            ("SAVE_INTERVAL_MS", self.save_interval),
            ("CLEANUP_INTERVAL_SECS", self.cleanup_interval),
            ("HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    name,
                    value: "0".to_string(),
                    reason: "interval must be positive".to_string(),
                });
            }
        }
        if self.jwt_secret.is_none() {
            return Err(ConfigError::Missing(
                "JWT_SECRET is required to verify client credentials".to_string(),
            ));
        }
        if self.access_service_url.is_none() && !self.allow_all_access {
            return Err(ConfigError::Missing(
                "set ACCESS_SERVICE_URL, or ALLOW_ALL_ACCESS=true for development".to_string(),
            ));
        }
        Ok(())
    }
}
