//! Configuration management for hydrotrack.
//!
//! Configuration can be set via environment variables:
//! - `HYDROTRACK_URL` - Required. WebSocket endpoint of the calculation backend (`ws://` or `wss://`).
//! - `HYDROTRACK_TOKEN` - Optional. Bearer credential passed through on the handshake.
//! - `HYDROTRACK_RECONNECT_INTERVAL_MS` - Optional. Delay between reconnect attempts. Defaults to `5000`.
//! - `HYDROTRACK_MAX_RECONNECT_ATTEMPTS` - Optional. Reconnect attempts before giving up. Defaults to `10`.
//! - `HYDROTRACK_HEARTBEAT_INTERVAL_MS` - Optional. Ping interval while connected. Defaults to `30000`.
//! - `HYDROTRACK_PONG_TIMEOUT_MS` - Optional. Liveness window after a ping, `0` disables. Defaults to `0`.
//! - `HYDROTRACK_RESUBSCRIBE_STAGGER_MS` - Optional. Gap between resubscribe frames. Defaults to `100`.
//! - `HYDROTRACK_CONNECT_TIMEOUT_MS` - Optional. Handshake timeout. Defaults to `10000`.
//! - `HYDROTRACK_EXPONENTIAL_BACKOFF` - Optional. Double the reconnect delay per attempt. Defaults to `false`.
//! - `HYDROTRACK_HISTORY_LIMIT` - Optional. Progress updates kept per task. Defaults to `100`.
//! - `HYDROTRACK_ESTIMATOR_INTERVAL_MS` - Optional. Tick of the duration estimator. Defaults to `1000`.
//! - `HYDROTRACK_ERROR_HISTORY_LIMIT` - Optional. Classified errors kept in history. Defaults to `100`.
//! - `HYDROTRACK_RECOVERY_MAX_ATTEMPTS` - Optional. Automatic recoveries per task before escalating. Defaults to `3`.
//! - `HYDROTRACK_RECOVERY_ACTION_TIMEOUT_MS` - Optional. Time bound for one recovery action. Defaults to `10000`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read config file {0}: {1}")]
    Io(String, std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(String, serde_json::Error),
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Backend endpoint
    pub url: String,

    /// Opaque bearer credential, sent as `Authorization: Bearer <token>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Fixed delay between reconnect attempts (base delay when backoff is exponential)
    pub reconnect_interval_ms: u64,

    /// Reconnect attempts before settling in `Disconnected`
    pub max_reconnect_attempts: u32,

    /// Ping interval while the connection is open
    pub heartbeat_interval_ms: u64,

    /// Liveness window after a ping; 0 disables the check
    pub pong_timeout_ms: u64,

    /// Gap between `subscribe_task` frames when resubscribing
    pub resubscribe_stagger_ms: u64,

    /// Handshake timeout
    pub connect_timeout_ms: u64,

    /// Double the reconnect delay per attempt instead of using a fixed interval
    pub exponential_backoff: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            reconnect_interval_ms: 5000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 0,
            resubscribe_stagger_ms: 100,
            connect_timeout_ms: 10_000,
            exponential_backoff: false,
        }
    }
}

impl ConnectionConfig {
    /// Create a connection config for `url` with default intervals.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Parse and validate the endpoint URL.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        validate_ws_url(&self.url)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Liveness window, `None` when disabled.
    pub fn pong_timeout(&self) -> Option<Duration> {
        (self.pong_timeout_ms > 0).then(|| Duration::from_millis(self.pong_timeout_ms))
    }

    pub fn resubscribe_stagger(&self) -> Duration {
        Duration::from_millis(self.resubscribe_stagger_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Task registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Progress updates retained per task (oldest dropped first)
    pub history_limit: usize,

    /// Tick of the periodic duration estimator
    pub estimator_interval_ms: u64,

    /// Estimated duration used when tracking starts without a hint
    pub default_estimated_duration_secs: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            estimator_interval_ms: 1000,
            default_estimated_duration_secs: 60.0,
        }
    }
}

impl RegistryConfig {
    pub fn estimator_interval(&self) -> Duration {
        Duration::from_millis(self.estimator_interval_ms)
    }
}

/// Error classification and recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Classified errors retained in history
    pub error_history_limit: usize,

    /// Automatic recoveries per key before collapsing to manual intervention
    pub max_attempts: u32,

    /// Time bound for a single recovery action
    pub action_timeout_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            error_history_limit: 100,
            max_attempts: 3,
            action_timeout_ms: 10_000,
        }
    }
}

impl RecoveryConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// Tracker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Connection settings
    pub connection: ConnectionConfig,

    /// Task registry settings
    pub registry: RegistryConfig,

    /// Error classification and recovery settings
    pub recovery: RecoveryConfig,
}

impl TrackerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `HYDROTRACK_URL` is not set, and
    /// `ConfigError::InvalidValue` for unparseable numbers or a non-WebSocket URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("HYDROTRACK_URL")
            .map_err(|_| ConfigError::MissingEnvVar("HYDROTRACK_URL".to_string()))?;
        validate_ws_url(&url)?;

        let defaults = Self::default();

        let connection = ConnectionConfig {
            url,
            token: std::env::var("HYDROTRACK_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            reconnect_interval_ms: env_or(
                "HYDROTRACK_RECONNECT_INTERVAL_MS",
                defaults.connection.reconnect_interval_ms,
            )?,
            max_reconnect_attempts: env_or(
                "HYDROTRACK_MAX_RECONNECT_ATTEMPTS",
                defaults.connection.max_reconnect_attempts,
            )?,
            heartbeat_interval_ms: env_or(
                "HYDROTRACK_HEARTBEAT_INTERVAL_MS",
                defaults.connection.heartbeat_interval_ms,
            )?,
            pong_timeout_ms: env_or(
                "HYDROTRACK_PONG_TIMEOUT_MS",
                defaults.connection.pong_timeout_ms,
            )?,
            resubscribe_stagger_ms: env_or(
                "HYDROTRACK_RESUBSCRIBE_STAGGER_MS",
                defaults.connection.resubscribe_stagger_ms,
            )?,
            connect_timeout_ms: env_or(
                "HYDROTRACK_CONNECT_TIMEOUT_MS",
                defaults.connection.connect_timeout_ms,
            )?,
            exponential_backoff: env_or(
                "HYDROTRACK_EXPONENTIAL_BACKOFF",
                defaults.connection.exponential_backoff,
            )?,
        };

        let registry = RegistryConfig {
            history_limit: env_or("HYDROTRACK_HISTORY_LIMIT", defaults.registry.history_limit)?,
            estimator_interval_ms: env_or(
                "HYDROTRACK_ESTIMATOR_INTERVAL_MS",
                defaults.registry.estimator_interval_ms,
            )?,
            default_estimated_duration_secs: defaults.registry.default_estimated_duration_secs,
        };

        let recovery = RecoveryConfig {
            error_history_limit: env_or(
                "HYDROTRACK_ERROR_HISTORY_LIMIT",
                defaults.recovery.error_history_limit,
            )?,
            max_attempts: env_or(
                "HYDROTRACK_RECOVERY_MAX_ATTEMPTS",
                defaults.recovery.max_attempts,
            )?,
            action_timeout_ms: env_or(
                "HYDROTRACK_RECOVERY_ACTION_TIMEOUT_MS",
                defaults.recovery.action_timeout_ms,
            )?,
        };

        Ok(Self {
            connection,
            registry,
            recovery,
        })
    }

    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(display.clone(), e))?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(display, e))?;
        validate_ws_url(&config.connection.url)?;
        Ok(config)
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Self::default()
        }
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        _ => Ok(default),
    }
}

fn validate_ws_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidValue("url".to_string(), format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidValue(
            "url".to_string(),
            format!("unsupported scheme '{}', expected ws or wss", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = TrackerConfig::new("ws://localhost:8000/ws");
        assert_eq!(config.connection.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.connection.max_reconnect_attempts, 10);
        assert_eq!(config.connection.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.connection.pong_timeout(), None);
        assert_eq!(config.registry.history_limit, 100);
        assert_eq!(config.recovery.max_attempts, 3);
    }

    #[test]
    fn test_endpoint_rejects_http_scheme() {
        let config = ConnectionConfig::new("http://localhost:8000/ws");
        assert!(matches!(
            config.endpoint(),
            Err(ConfigError::InvalidValue(field, _)) if field == "url"
        ));
        assert!(ConnectionConfig::new("wss://calc.example.com/ws")
            .endpoint()
            .is_ok());
    }

    #[test]
    fn test_from_file_fills_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"connection": {{"url": "ws://127.0.0.1:9000/ws", "max_reconnect_attempts": 2}}}}"#
        )
        .unwrap();

        let config = TrackerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.connection.url, "ws://127.0.0.1:9000/ws");
        assert_eq!(config.connection.max_reconnect_attempts, 2);
        assert_eq!(config.connection.reconnect_interval_ms, 5000);
        assert_eq!(config.registry.estimator_interval_ms, 1000);
    }

    #[test]
    fn test_from_file_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            TrackerConfig::from_file(file.path()),
            Err(ConfigError::Parse(_, _))
        ));
    }
}
