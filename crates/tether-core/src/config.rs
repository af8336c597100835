//! Configuration system for tether
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/tether/config.toml
//! - Linux: ~/.config/tether/config.toml
//! - Windows: %APPDATA%/tether/config.toml

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Per-origin rate limiting for relay events
    pub rate_limit: RateLimitConfig,
    /// Directory (id -> invite) settings
    pub directory: DirectoryConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP/WebSocket port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Rate-limit by the first `X-Forwarded-For` hop instead of the peer
    /// address. Enable only behind a proxy that sets the header.
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            trust_forwarded_for: false,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Operations allowed per origin per window
    pub max_requests: u32,
    /// Fixed window length in seconds
    pub window_secs: u64,
    /// Upper bound on tracked origins (least recently seen are evicted)
    pub max_tracked_origins: usize,
    /// How often expired windows are swept, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: crate::DEFAULT_RATE_LIMIT,
            window_secs: crate::DEFAULT_RATE_WINDOW_SECS,
            max_tracked_origins: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Directory holding the SQLite database
    pub data_dir: PathBuf,
    /// Lifetime of temporary entries in seconds
    pub temporary_ttl_secs: u64,
    /// Prefix applied to ids before they reach the store
    pub namespace: String,
    /// How often expired entries are purged, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(crate::DEFAULT_DATA_DIR),
            temporary_ttl_secs: crate::DEFAULT_TEMPORARY_TTL_SECS,
            namespace: String::new(),
            sweep_interval_secs: 300,
        }
    }
}

impl DirectoryConfig {
    pub fn temporary_ttl(&self) -> Duration {
        Duration::from_secs(self.temporary_ttl_secs)
    }

    /// Path of the SQLite database inside `data_dir`
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("directory.db")
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "tether", "tether")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert!(!config.server.trust_forwarded_for);
        assert_eq!(config.rate_limit.max_requests, 20);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(config.directory.temporary_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.directory.data_dir, PathBuf::from("directory-data"));
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [rate_limit]
            max_requests = 5

            [directory]
            namespace = "id:"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.directory.namespace, "id:");
        // Other values should be defaults
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[server]"));
        assert!(sample.contains("[rate_limit]"));
        assert!(sample.contains("[directory]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.server.port = 4000;
        config.directory.temporary_ttl_secs = 10;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.server.port, 4000);
        assert_eq!(loaded.directory.temporary_ttl_secs, 10);
    }

    #[test]
    fn test_invalid_config_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = \"not a number\"\n").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
