//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/beacon/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/beacon/` (~/.config/beacon/)
//! - Data: `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
//! - State/Logs: `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)

use crate::error::{Error, Result};
use crate::types::TestMode;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest value accepted for `send_timeout_ms` and `check_server_interval_ms`.
pub const MIN_INTERVAL_MS: u64 = 100;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Collection endpoint configuration
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Delivery timing and test mode
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Tracking switches
    #[serde(default)]
    pub analytics: AnalyticsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collection endpoint configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CollectorConfig {
    /// Base URL of the collection endpoint (e.g., `https://collect.example.com`)
    pub server_url: Option<String>,

    /// API key identifying the application
    pub api_key: Option<String>,

    /// Secret used to sign request bodies
    pub secret_key: Option<String>,
}

impl CollectorConfig {
    /// Check if every credential needed to reach the endpoint is present
    pub fn is_ready(&self) -> bool {
        self.server_url.is_some() && self.api_key.is_some() && self.secret_key.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let url = self.server_url.as_deref().ok_or_else(|| {
            Error::Config("collector.server_url is required".to_string())
        })?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "collector.server_url must be an http(s) URL, got {:?}",
                url
            )));
        }
        if self.api_key.is_none() {
            return Err(Error::Config("collector.api_key is required".to_string()));
        }
        if self.secret_key.is_none() {
            return Err(Error::Config("collector.secret_key is required".to_string()));
        }
        Ok(())
    }
}

/// Delivery timing configuration
///
/// All values are milliseconds. `send_timeout_ms` and `check_server_interval_ms`
/// are clamped to [`MIN_INTERVAL_MS`] when read.
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Wait between delivery ticks; the upper bound on delay before a new event is sent
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u64,

    /// Maximum duration of a single send attempt
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Wait between availability probes while the endpoint is unreachable
    #[serde(default = "default_check_server_interval")]
    pub check_server_interval_ms: u64,

    /// Development switch to suppress or fail all network IO
    #[serde(default)]
    pub test_mode: TestMode,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval(),
            send_timeout_ms: default_send_timeout(),
            check_server_interval_ms: default_check_server_interval(),
            test_mode: TestMode::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(MIN_INTERVAL_MS))
    }

    pub fn check_server_interval(&self) -> Duration {
        Duration::from_millis(self.check_server_interval_ms.max(MIN_INTERVAL_MS))
    }
}

fn default_update_interval() -> u64 {
    200
}

fn default_send_timeout() -> u64 {
    20_000
}

fn default_check_server_interval() -> u64 {
    2_000
}

/// Tracking switches
#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    /// When false every tracking call is ignored
    #[serde(default = "default_analytics_enabled")]
    pub enabled: bool,

    /// Whether payable (in-app purchase) events are active
    #[serde(default = "default_payable")]
    pub payable: bool,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: default_analytics_enabled(),
            payable: default_payable(),
        }
    }
}

fn default_analytics_enabled() -> bool {
    true
}

fn default_payable() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/beacon/config.toml` (~/.config/beacon/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("beacon").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite store)
    ///
    /// `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("beacon")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("beacon")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/beacon/beacon.db` (~/.local/share/beacon/beacon.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("beacon.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/beacon/beacon.log` (~/.local/state/beacon/beacon.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("beacon.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.analytics.enabled);
        assert!(config.analytics.payable);
        assert_eq!(config.delivery.update_interval_ms, 200);
        assert_eq!(config.delivery.send_timeout_ms, 20_000);
        assert_eq!(config.delivery.check_server_interval_ms, 2_000);
        assert_eq!(config.delivery.test_mode, TestMode::None);
        assert!(!config.collector.is_ready());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[collector]
server_url = "https://collect.example.com"
api_key = "app-123"
secret_key = "s3cret"

[delivery]
update_interval_ms = 50
test_mode = "simulate_offline"

[analytics]
enabled = false
payable = false

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert!(config.collector.is_ready());
        assert!(config.collector.validate().is_ok());
        assert_eq!(config.delivery.update_interval_ms, 50);
        assert_eq!(config.delivery.send_timeout_ms, 20_000);
        assert_eq!(config.delivery.test_mode, TestMode::SimulateOffline);
        assert!(!config.analytics.enabled);
        assert!(!config.analytics.payable);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_minimum_intervals_enforced() {
        let config = DeliveryConfig {
            update_interval_ms: 10,
            send_timeout_ms: 5,
            check_server_interval_ms: 0,
            test_mode: TestMode::None,
        };
        assert_eq!(config.update_interval(), Duration::from_millis(10));
        assert_eq!(config.send_timeout(), Duration::from_millis(MIN_INTERVAL_MS));
        assert_eq!(
            config.check_server_interval(),
            Duration::from_millis(MIN_INTERVAL_MS)
        );
    }

    #[test]
    fn test_collector_config_validation() {
        let config = CollectorConfig::default();
        assert!(config.validate().is_err());

        let config = CollectorConfig {
            server_url: Some("ftp://collect.example.com".to_string()),
            api_key: Some("app".to_string()),
            secret_key: Some("secret".to_string()),
        };
        assert!(config.is_ready());
        assert!(config.validate().is_err());

        let config = CollectorConfig {
            server_url: Some("https://collect.example.com".to_string()),
            api_key: Some("app".to_string()),
            secret_key: None,
        };
        assert!(!config.is_ready());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_use_beacon_dirs() {
        assert!(Config::config_path().ends_with("beacon/config.toml"));
        assert!(Config::database_path().ends_with("beacon/beacon.db"));
        assert!(Config::log_path().ends_with("beacon/beacon.log"));
    }
}
