//! Configuration management
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::DispatcherConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Dispatcher configuration
    pub dispatcher: DispatcherSettings,

    /// Database configuration
    pub database: DatabaseConfig,

    /// HTTP server configuration
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Dispatcher-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Seconds between dispatch ticks
    pub tick_interval_secs: u64,

    /// Upper bound on due jobs examined per tick
    pub claim_batch_size: usize,

    /// Transport call timeout in seconds
    pub transport_timeout_secs: u64,

    /// Total delivery attempts before a job is failed
    pub max_attempts: u32,

    /// First retry delay in seconds
    pub retry_backoff_base_secs: u64,

    /// Retry delay ceiling in seconds
    pub retry_backoff_cap_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the API binds to
    pub bind_addr: SocketAddr,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let tick_interval_secs = std::env::var("CADENCE_TICK_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let claim_batch_size = std::env::var("CADENCE_CLAIM_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(100);

        let transport_timeout_secs = std::env::var("CADENCE_TRANSPORT_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let max_attempts = std::env::var("CADENCE_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(3);

        let retry_backoff_base_secs = std::env::var("CADENCE_RETRY_BACKOFF_BASE")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        let retry_backoff_cap_secs = std::env::var("CADENCE_RETRY_BACKOFF_CAP")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3600);

        let sqlite_path = std::env::var("CADENCE_SQLITE_PATH")
            .unwrap_or_else(|_| String::from("data/cadence.db"))
            .into();

        let bind_addr = std::env::var("CADENCE_BIND_ADDR")
            .ok()
            .and_then(|v| v.parse::<SocketAddr>().ok())
            .unwrap_or_else(|| "127.0.0.1:8080".parse().expect("valid default addr"));

        let log_level = std::env::var("CADENCE_LOG_LEVEL").unwrap_or_else(|_| String::from("info"));

        let log_format =
            std::env::var("CADENCE_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        Ok(Self {
            dispatcher: DispatcherSettings {
                tick_interval_secs,
                claim_batch_size,
                transport_timeout_secs,
                max_attempts,
                retry_backoff_base_secs,
                retry_backoff_cap_secs,
            },
            database: DatabaseConfig { sqlite_path },
            server: ServerConfig { bind_addr },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.tick_interval_secs == 0 {
            anyhow::bail!("tick_interval_secs must be greater than 0");
        }

        if self.dispatcher.claim_batch_size == 0 {
            anyhow::bail!("claim_batch_size must be greater than 0");
        }

        if self.dispatcher.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.dispatcher.retry_backoff_cap_secs < self.dispatcher.retry_backoff_base_secs {
            anyhow::bail!("retry_backoff_cap_secs must not be below the base delay");
        }

        Ok(())
    }

    /// Dispatcher runtime settings as a [`DispatcherConfig`]
    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            tick_interval: Duration::from_secs(self.dispatcher.tick_interval_secs),
            claim_batch_size: self.dispatcher.claim_batch_size,
            transport_timeout: Duration::from_secs(self.dispatcher.transport_timeout_secs),
            max_attempts: self.dispatcher.max_attempts,
            retry_backoff_base: Duration::from_secs(self.dispatcher.retry_backoff_base_secs),
            retry_backoff_cap: Duration::from_secs(self.dispatcher.retry_backoff_cap_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherSettings {
                tick_interval_secs: 30,
                claim_batch_size: 100,
                transport_timeout_secs: 30,
                max_attempts: 3,
                retry_backoff_base_secs: 60,
                retry_backoff_cap_secs: 3600,
            },
            database: DatabaseConfig {
                sqlite_path: PathBuf::from("data/cadence.db"),
            },
            server: ServerConfig {
                bind_addr: "127.0.0.1:8080".parse().expect("valid default addr"),
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_tick_interval() {
        let mut config = Config::default();
        config.dispatcher.tick_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_cap_below_base_rejected() {
        let mut config = Config::default();
        config.dispatcher.retry_backoff_cap_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dispatcher_config_conversion() {
        let config = Config::default();
        let dc = config.dispatcher_config();
        assert_eq!(dc.tick_interval, Duration::from_secs(30));
        assert_eq!(dc.max_attempts, 3);
    }
}
