//! Proxy configuration.

use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

/// Main proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Client-facing listener configuration.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Remote file server location.
    pub remote: RemoteConfig,

    /// Local cache configuration.
    pub cache: CacheConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }
}

/// Client-facing listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on for client connections.
    #[serde(default = "ProxyConfig::default_listen")]
    pub listen: SocketAddr,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
        }
    }
}

impl ProxyConfig {
    fn default_listen() -> SocketAddr {
        "0.0.0.0:8090".parse().unwrap()
    }
}

/// Remote file server location.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Server host name or IP.
    pub host: String,

    /// Server port.
    pub port: u16,
}

impl RemoteConfig {
    /// Resolve the server address.
    pub fn addr(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("cannot resolve address: {}:{}", self.host, self.port),
                )
            })
    }
}

/// Local cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory the cache lives in.
    pub dir: PathBuf,

    /// Cache capacity in bytes. Soft: pinned entries may push the store
    /// over budget until their descriptors close.
    pub max_size_bytes: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log format: "pretty", "json", or "compact".
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "pretty".to_string()
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
