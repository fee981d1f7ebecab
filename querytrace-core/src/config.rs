//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/querytrace/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/querytrace/` (~/.config/querytrace/)
//! - State/Logs: `$XDG_STATE_HOME/querytrace/` (~/.local/state/querytrace/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

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
    /// Monitoring endpoint configuration
    #[serde(default)]
    pub poster: PosterConfig,

    /// Aggregation engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Monitoring endpoint configuration
///
/// When enabled, aggregated query reports are posted to `server_url`
/// every `post_interval_secs`.
#[derive(Debug, Deserialize, Clone)]
pub struct PosterConfig {
    /// Enable/disable posting
    #[serde(default)]
    pub enabled: bool,

    /// Monitoring endpoint URL (e.g., `https://monitor.example.com:18443`)
    pub server_url: Option<String>,

    /// Agent user on the monitoring endpoint
    pub user: Option<String>,

    /// Agent password on the monitoring endpoint
    pub password: Option<String>,

    /// Seconds between posting ticks
    #[serde(default = "default_post_interval")]
    pub post_interval_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_poster_timeout")]
    pub timeout_secs: u64,

    /// Minimum seconds between exports of one server's aggregations.
    /// Defaults to the posting interval.
    #[serde(default)]
    pub cache_age_secs: Option<u64>,
}

impl Default for PosterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: None,
            user: None,
            password: None,
            post_interval_secs: default_post_interval(),
            timeout_secs: default_poster_timeout(),
            cache_age_secs: None,
        }
    }
}

impl PosterConfig {
    /// Check if posting is properly configured and enabled
    pub fn is_ready(&self) -> bool {
        self.enabled && self.server_url.is_some() && self.user.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.server_url.is_none() {
            return Err(Error::Config(
                "poster.server_url is required when poster is enabled".to_string(),
            ));
        }
        if self.user.is_none() {
            return Err(Error::Config(
                "poster.user is required when poster is enabled".to_string(),
            ));
        }
        self.validate_timing()
    }

    /// Interval checks that apply to any posting sink, enabled or not.
    pub fn validate_timing(&self) -> Result<()> {
        if self.post_interval_secs == 0 {
            return Err(Error::Config(
                "poster.post_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.cache_age_secs == Some(0) {
            return Err(Error::Config(
                "poster.cache_age_secs must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval between posting ticks
    pub fn post_interval(&self) -> Duration {
        Duration::from_secs(self.post_interval_secs)
    }

    /// Effective per-server cache age in seconds
    pub fn cache_age(&self) -> u64 {
        self.cache_age_secs.unwrap_or(self.post_interval_secs)
    }
}

fn default_post_interval() -> u64 {
    60
}

fn default_poster_timeout() -> u64 {
    30
}

/// Aggregation engine tuning
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Runtime worker threads used for aggregation and background lookups
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Fetch an EXPLAIN plan for each new query shape
    #[serde(default = "default_explain")]
    pub explain: bool,

    /// Host name reported as the origin of queries
    #[serde(default)]
    pub calling_host: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            explain: default_explain(),
            calling_host: None,
        }
    }
}

impl EngineConfig {
    /// Configured calling host, else `$HOSTNAME`, else `localhost`
    pub fn calling_host(&self) -> String {
        self.calling_host
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn default_worker_threads() -> usize {
    2
}

fn default_explain() -> bool {
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
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.poster.validate()?;
        if config.engine.worker_threads == 0 {
            return Err(Error::Config(
                "engine.worker_threads must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/querytrace/config.toml` (~/.config/querytrace/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("querytrace").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/querytrace/` (~/.local/state/querytrace/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("querytrace")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/querytrace/querytrace.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("querytrace.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.poster.enabled);
        assert_eq!(config.poster.post_interval_secs, 60);
        assert_eq!(config.engine.worker_threads, 2);
        assert!(config.engine.explain);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[poster]
enabled = true
server_url = "https://monitor.example.com:18443"
user = "agent"
password = "secret"
post_interval_secs = 30
cache_age_secs = 120

[engine]
worker_threads = 4
explain = false
calling_host = "app-01"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert!(config.poster.is_ready());
        assert_eq!(config.poster.post_interval(), Duration::from_secs(30));
        assert_eq!(config.poster.cache_age(), 120);
        assert_eq!(config.engine.worker_threads, 4);
        assert!(!config.engine.explain);
        assert_eq!(config.engine.calling_host(), "app-01");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cache_age_defaults_to_post_interval() {
        let config = PosterConfig {
            post_interval_secs: 15,
            ..Default::default()
        };
        assert_eq!(config.cache_age(), 15);
    }

    #[test]
    fn test_poster_config_validation() {
        // Disabled config is always valid
        let config = PosterConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_ready());

        // Enabled without endpoint should fail
        let config = PosterConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PosterConfig {
            enabled: true,
            server_url: Some("https://monitor.example.com".to_string()),
            user: Some("agent".to_string()),
            post_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PosterConfig {
            enabled: true,
            server_url: Some("https://monitor.example.com".to_string()),
            user: Some("agent".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.is_ready());
    }

    #[test]
    fn test_load_from_file_rejects_invalid_poster() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[poster]\nenabled = true").unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("server_url"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nworker_threads = 1").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.engine.worker_threads, 1);
        assert!(!config.poster.enabled);
    }

    #[test]
    fn test_log_path() {
        assert!(Config::log_path().ends_with("querytrace/querytrace.log"));
    }
}
