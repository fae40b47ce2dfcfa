//! Configuration management for the cmuxd daemon.
//!
//! This module provides TOML-based configuration file loading.
//! The default configuration path is `~/.config/cmuxd/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("session geometry must be non-zero, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("outbound_queue must be greater than 0")]
    InvalidOutboundQueue,

    #[error("poll_interval_ms must be between 1 and 10000, got {0}")]
    InvalidPollInterval(u64),

    #[error("default_term must not be empty")]
    EmptyTerm,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the cmuxd daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Defaults applied to newly created sessions.
    pub session: SessionConfig,

    /// Transport tuning.
    pub transport: TransportConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Session defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to spawn for new sessions.
    pub default_shell: String,

    /// TERM value exported to new sessions.
    pub default_term: String,

    /// Working directory for new sessions when a request gives none.
    pub default_cwd: Option<PathBuf>,

    /// Default terminal width.
    pub cols: u16,

    /// Default terminal height.
    pub rows: u16,

    /// Emulator scrollback lines kept per session.
    pub scrollback: usize,
}

/// Transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of each connection's outbound event queue.
    pub outbound_queue: usize,

    /// How long a session reader waits in `poll()` before re-checking exit.
    pub poll_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_term: "xterm-256color".to_string(),
            default_cwd: None,
            cols: 80,
            rows: 24,
            scrollback: 10_000,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 1024,
            poll_interval_ms: 100,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cmuxd")
        .join("config.toml")
}

/// Returns the user's shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - CMUXD_DEFAULT_CWD: working directory for new sessions
    /// - CMUXD_DEFAULT_TERM: TERM exported to new sessions
    /// - CMUXD_DEFAULT_SHELL: shell spawned for new sessions
    /// - CMUXD_LOG_LEVEL: log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(cwd) = non_empty_env("CMUXD_DEFAULT_CWD") {
            tracing::info!("Overriding default_cwd from environment: {}", cwd);
            self.session.default_cwd = Some(PathBuf::from(cwd));
        }

        if let Some(term) = non_empty_env("CMUXD_DEFAULT_TERM") {
            tracing::info!("Overriding default_term from environment: {}", term);
            self.session.default_term = term;
        }

        if let Some(shell) = non_empty_env("CMUXD_DEFAULT_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = shell;
        }

        if let Some(level) = non_empty_env("CMUXD_LOG_LEVEL") {
            self.daemon.log_level = level;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidGeometry {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        if self.session.default_term.trim().is_empty() {
            return Err(ConfigError::EmptyTerm);
        }

        if self.transport.outbound_queue == 0 {
            return Err(ConfigError::InvalidOutboundQueue);
        }

        let poll = self.transport.poll_interval_ms;
        if poll == 0 || poll > 10_000 {
            return Err(ConfigError::InvalidPollInterval(poll));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.session.cols, 80);
        assert_eq!(config.session.rows, 24);
        assert_eq!(config.session.default_term, "xterm-256color");
        assert!(config.session.default_cwd.is_none());
        assert_eq!(config.transport.outbound_queue, 1024);
        assert_eq!(config.transport.poll_interval_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = Config::from_toml(
            r#"
            [session]
            cols = 132
            default_cwd = "/tmp"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.cols, 132);
        assert_eq!(config.session.rows, 24);
        assert_eq!(config.session.default_cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let err = Config::from_toml("[session]\ncols = \"wide\"").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let config = Config::from_toml("[daemon]\nlog_level = \"debug\"\nfuture_knob = 3").unwrap();
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session\ncols = 1").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("cmuxd/config.toml"));
    }

    #[test]
    fn test_validate_zero_geometry() {
        let mut config = Config::default();
        config.session.rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidGeometry { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_poll_interval_bounds() {
        let mut config = Config::default();
        config.transport.poll_interval_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(0)));

        config.transport.poll_interval_ms = 10_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_outbound_queue() {
        let mut config = Config::default();
        config.transport.outbound_queue = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidOutboundQueue));
    }

    #[test]
    fn test_validate_log_level_case_insensitive() {
        let mut config = Config::default();
        config.daemon.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("CMUXD_DEFAULT_CWD", "/var/tmp");
        std::env::set_var("CMUXD_DEFAULT_TERM", "vt100");
        std::env::set_var("CMUXD_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.default_cwd, Some(PathBuf::from("/var/tmp")));
        assert_eq!(config.session.default_term, "vt100");
        assert_eq!(config.daemon.log_level, "info");

        std::env::remove_var("CMUXD_DEFAULT_CWD");
        std::env::remove_var("CMUXD_DEFAULT_TERM");
        std::env::remove_var("CMUXD_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_overrides_unset() {
        std::env::remove_var("CMUXD_DEFAULT_CWD");
        std::env::remove_var("CMUXD_DEFAULT_TERM");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert!(config.session.default_cwd.is_none());
        assert_eq!(config.session.default_term, "xterm-256color");
    }
}
