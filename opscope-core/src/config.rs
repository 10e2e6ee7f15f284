//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/opscope/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/opscope/` (~/.config/opscope/)
//! - State/Logs: `$XDG_STATE_HOME/opscope/` (~/.local/state/opscope/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

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

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Telemetry feed configuration
    #[serde(default)]
    pub feed: FeedConfig,

    /// Analysis job service configuration (optional)
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Timeline store configuration
    #[serde(default)]
    pub timeline: TimelineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Telemetry feed connection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    /// WebSocket endpoint of the broker bridge
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// Seconds before an in-flight connection attempt is abandoned
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Seconds between automatic reconnection attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Consecutive failed attempts before entering quiet mode
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Seconds of quiet-mode cooldown before reconnection is re-enabled
    #[serde(default = "default_quiet_cooldown")]
    pub quiet_cooldown_secs: u64,

    /// Automatically leave quiet mode once the cooldown elapses
    #[serde(default = "default_true")]
    pub auto_reenable: bool,

    /// Clear the stage dedup key whenever the connection is (re)established
    #[serde(default = "default_true")]
    pub reset_stage_dedup_on_reconnect: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            quiet_cooldown_secs: default_quiet_cooldown(),
            auto_reenable: true,
            reset_stage_dedup_on_reconnect: true,
        }
    }
}

impl FeedConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.broker_url.is_empty() {
            return Err(Error::Config("feed.broker_url must not be empty".to_string()));
        }
        if !self.broker_url.starts_with("ws://") && !self.broker_url.starts_with("wss://") {
            return Err(Error::Config(
                "feed.broker_url must be a ws:// or wss:// endpoint".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::Config(
                "feed.connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_broker_url() -> String {
    "ws://localhost:9001".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_quiet_cooldown() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Analysis job service configuration
///
/// When `base_url` is set, analysis sessions can be started against the
/// remote service. Without it, the monitor still consumes feed telemetry
/// but refuses session starts.
#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Base URL of the job service (e.g., `http://localhost:13000`)
    pub base_url: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_analysis_timeout(),
        }
    }
}

impl AnalysisConfig {
    /// Check if the analysis service is configured
    pub fn is_ready(&self) -> bool {
        self.base_url.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.base_url {
            if url.is_empty() {
                return Err(Error::Config(
                    "analysis.base_url must not be empty when set".to_string(),
                ));
            }
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "analysis.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_analysis_timeout() -> u64 {
    30
}

/// Timeline store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TimelineConfig {
    /// Maximum retained events; the oldest are evicted beyond this
    #[serde(default = "default_timeline_capacity")]
    pub capacity: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            capacity: default_timeline_capacity(),
        }
    }
}

fn default_timeline_capacity() -> usize {
    2048
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

        config.validate()?;

        Ok(config)
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.feed.validate()?;
        self.analysis.validate()?;
        if self.timeline.capacity == 0 {
            return Err(Error::Config(
                "timeline.capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/opscope/config.toml` (~/.config/opscope/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("opscope").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/opscope/` (~/.local/state/opscope/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("opscope")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/opscope/opscope.log` (~/.local/state/opscope/opscope.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("opscope.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.feed.broker_url, "ws://localhost:9001");
        assert_eq!(config.feed.connect_timeout_secs, 15);
        assert_eq!(config.feed.max_reconnect_attempts, 3);
        assert_eq!(config.feed.quiet_cooldown_secs, 30);
        assert!(config.feed.auto_reenable);
        assert!(config.feed.reset_stage_dedup_on_reconnect);
        assert!(config.analysis.base_url.is_none());
        assert!(!config.analysis.is_ready());
        assert_eq!(config.timeline.capacity, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[feed]
broker_url = "wss://broker.example.com:9001"
max_reconnect_attempts = 5
auto_reenable = false

[analysis]
base_url = "http://localhost:13000"
timeout_secs = 10

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.feed.broker_url, "wss://broker.example.com:9001");
        assert_eq!(config.feed.max_reconnect_attempts, 5);
        assert!(!config.feed.auto_reenable);
        assert_eq!(config.analysis.base_url.as_deref(), Some("http://localhost:13000"));
        assert_eq!(config.analysis.timeout_secs, 10);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_feed_config_validation() {
        let mut config = FeedConfig::default();
        assert!(config.validate().is_ok());

        config.broker_url = "http://not-a-websocket".to_string();
        assert!(config.validate().is_err());

        config.broker_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_analysis_config_validation() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());

        let config = AnalysisConfig {
            base_url: Some(String::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AnalysisConfig {
            base_url: Some("http://localhost:13000".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.is_ready());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[feed]\nbroker_url = \"ws://10.0.0.5:9001\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.feed.broker_url, "ws://10.0.0.5:9001");
    }

    #[test]
    fn test_load_from_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[timeline]\ncapacity = 0\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
