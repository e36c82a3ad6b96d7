//! Configuration
//!
//! JSON5 file with every field defaulted, plus a few environment overrides.
//! Path resolution: explicit path, then `POLLROOM_CONFIG_PATH`, then
//! `./pollroom.json5`. A missing file yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::history::{HistoryBackend, HistoryConfig};
use crate::logging::LoggingConfig;
use crate::polls::PollSettings;

pub const CONFIG_PATH_ENV: &str = "POLLROOM_CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "pollroom.json5";
pub const DEFAULT_PORT: u16 = 8080;

/// Browser origins allowed to call the HTTP API when none are configured.
pub const DEFAULT_CORS_ORIGINS: [&str; 2] = ["http://localhost:5173", "http://localhost:3000"];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),

    #[error("Invalid environment override {var}={value}: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server: ServerConfig,
    pub polls: PollSettings,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per WebSocket before it is closed as lagging
    pub connection_queue_size: usize,
    /// Origins allowed by CORS. `"*"` allows any origin; empty disables CORS.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connection_queue_size: crate::server::ws::hub::DEFAULT_QUEUE_SIZE,
            cors_origins: DEFAULT_CORS_ORIGINS.iter().map(|o| o.to_string()).collect(),
        }
    }
}

/// A problem found by [`validate_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Resolve the config file path.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

/// Load the file at `path` (defaults if it does not exist) and apply
/// environment overrides.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(raw) => load_config_from_str(&raw)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    Ok(config)
}

/// Parse JSON5 text. Empty input means all defaults.
pub fn load_config_from_str(raw: &str) -> Result<Config, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(json5::from_str(raw)?)
}

/// Apply `POLLROOM_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("POLLROOM_HOST").filter(|v| !v.is_empty()) {
        config.server.host = host;
    }
    if let Some(port) = lookup("POLLROOM_PORT").filter(|v| !v.is_empty()) {
        config.server.port = port.parse().map_err(|e: std::num::ParseIntError| ConfigError::Env {
            var: "POLLROOM_PORT",
            value: port.clone(),
            reason: e.to_string(),
        })?;
    }
    if let Some(origins) = lookup("POLLROOM_CORS_ORIGIN").filter(|v| !v.is_empty()) {
        config.server.cors_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(url) = lookup("POLLROOM_HISTORY_URL").filter(|v| !v.is_empty()) {
        // A database URL implies the SQLite backend.
        config.history.backend = HistoryBackend::Sqlite;
        config.history.url = url;
    }
    if let Some(level) = lookup("POLLROOM_LOG_LEVEL").filter(|v| !v.is_empty()) {
        config.logging.level = level;
    }
    Ok(())
}

/// Semantic checks that serde cannot express.
pub fn validate_config(config: &Config) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if config.server.host.trim().is_empty() {
        issues.push(ValidationIssue::new("server.host", "must not be empty"));
    }
    if config.server.port == 0 {
        issues.push(ValidationIssue::new("server.port", "must be between 1 and 65535"));
    }
    if config.server.connection_queue_size == 0 {
        issues.push(ValidationIssue::new(
            "server.connectionQueueSize",
            "must be at least 1",
        ));
    }
    for (i, origin) in config.server.cors_origins.iter().enumerate() {
        let valid = origin == "*"
            || ((origin.starts_with("http://") || origin.starts_with("https://"))
                && axum::http::HeaderValue::from_str(origin).is_ok());
        if !valid {
            issues.push(ValidationIssue::new(
                &format!("server.corsOrigins[{}]", i),
                format!("expected \"*\" or an http(s) origin, got '{}'", origin),
            ));
        }
    }
    if config.polls.max_timeout_secs == 0 {
        issues.push(ValidationIssue::new(
            "polls.maxTimeoutSecs",
            "must be at least 1",
        ));
    }
    if config.history.backend == HistoryBackend::Sqlite && !config.history.url.starts_with("sqlite:")
    {
        issues.push(ValidationIssue::new(
            "history.url",
            format!("expected a sqlite: URL, got '{}'", config.history.url),
        ));
    }
    if let Err(e) = tracing_subscriber::EnvFilter::try_new(&config.logging.level) {
        issues.push(ValidationIssue::new("logging.level", e.to_string()));
    }

    issues
}
