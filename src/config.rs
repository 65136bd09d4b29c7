//! # Configuration Management
//!
//! Centralized configuration for the relay.
//!
//! This module provides structured configuration for the proxy session,
//! the on-disk caches and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`PACKET_RELAY_*`)
//!
//! A server address ending in `.pcap2` (or `.pcap`) switches the session to
//! replay mode instead of dialing.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Size of every resource pack chunk the relay uploads to a client (128 KiB)
pub const PACK_CHUNK_SIZE: u32 = 128 * 1024;

/// Max allowed frame payload on a live connection (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Timeout for dialing the remote server
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProxyConfig {
    /// Session settings
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Pack cache and blob store locations
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PACKET_RELAY_LISTEN_ADDRESS") {
            config.proxy.listen_address = addr;
        }

        if let Ok(addr) = std::env::var("PACKET_RELAY_SERVER_ADDRESS") {
            config.proxy.server_address = addr;
        }

        if let Ok(flag) = std::env::var("PACKET_RELAY_WITH_CLIENT") {
            config.proxy.with_client = parse_bool(&flag).ok_or_else(|| {
                ProxyError::ConfigError(format!("PACKET_RELAY_WITH_CLIENT is not a bool: {flag}"))
            })?;
        }

        if let Ok(timeout) = std::env::var("PACKET_RELAY_DIAL_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.proxy.dial_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(flag) = std::env::var("PACKET_RELAY_CAPTURE") {
            if let Some(val) = parse_bool(&flag) {
                config.proxy.capture = val;
            }
        }

        if let Ok(dir) = std::env::var("PACKET_RELAY_CAPTURE_DIR") {
            config.proxy.capture_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("PACKET_RELAY_PACK_DIR") {
            config.cache.pack_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("PACKET_RELAY_BLOB_DIR") {
            config.cache.blob_dir = PathBuf::from(dir);
        }

        if let Ok(level) = std::env::var("PACKET_RELAY_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProxyError::ConfigError(format!("Invalid log level: {level}"))
            })?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.proxy.validate());
        errors.extend(self.cache.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Settings for one proxy session
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySettings {
    /// Address the proxy listens on for the game client (e.g. "0.0.0.0:19132")
    pub listen_address: String,

    /// Remote server `host:port`, or a path to a pcap2 capture to replay
    pub server_address: String,

    /// Whether a game client is expected to connect through the proxy
    pub with_client: bool,

    /// Timeout for dialing the remote server
    #[serde(with = "duration_serde")]
    pub dial_timeout: Duration,

    /// Record the session into a pcap2 capture
    pub capture: bool,

    /// Directory captures are written to
    pub capture_dir: PathBuf,

    /// Pack files (`.zip`/`.mcpack`) to inject into the client's pack list
    #[serde(default)]
    pub added_packs: Vec<PathBuf>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_address: String::from("0.0.0.0:19132"),
            server_address: String::new(),
            with_client: true,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            capture: false,
            capture_dir: PathBuf::from("captures"),
            added_packs: Vec::new(),
        }
    }
}

impl ProxySettings {
    /// True when `server_address` points at a capture file instead of a host.
    pub fn is_replay(&self) -> bool {
        is_capture_path(&self.server_address)
    }

    /// Validate proxy settings
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.with_client {
            if self.listen_address.is_empty() {
                errors.push("Listen address cannot be empty".to_string());
            } else if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!(
                    "Invalid listen address format: '{}' (expected format: '0.0.0.0:19132')",
                    self.listen_address
                ));
            }
        }

        if self.server_address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.is_replay() {
            if self.with_client {
                errors.push("Replaying a capture cannot attach a client".to_string());
            }
            if self.capture {
                errors.push("Capturing a replayed session is not supported".to_string());
            }
        } else if !self.server_address.contains(':') {
            errors.push(format!(
                "Invalid server address format: '{}' (expected 'host:port')",
                self.server_address
            ));
        }

        if self.dial_timeout.as_millis() < 100 {
            errors.push("Dial timeout too short (minimum: 100ms)".to_string());
        } else if self.dial_timeout.as_secs() > 300 {
            errors.push("Dial timeout too long (maximum: 300s)".to_string());
        }

        if self.capture && self.capture_dir.as_os_str().is_empty() {
            errors.push("capture_dir must be set when capture is enabled".to_string());
        }

        for pack in &self.added_packs {
            if !pack.exists() {
                errors.push(format!("Added pack does not exist: {}", pack.display()));
            }
        }

        errors
    }
}

/// Returns true for paths the session should replay rather than dial.
pub fn is_capture_path(addr: &str) -> bool {
    addr.ends_with(".pcap2") || addr.ends_with(".pcap")
}

/// Cache locations shared across sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Directory holding complete resource packs
    pub pack_dir: PathBuf,

    /// Directory holding content blobs
    pub blob_dir: PathBuf,

    /// Whether the relay answers client blob queries itself
    pub blob_cache_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pack_dir: PathBuf::from("packcache"),
            blob_dir: PathBuf::from("blobcache"),
            blob_cache_enabled: true,
        }
    }
}

impl CacheConfig {
    /// Validate cache configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.pack_dir.as_os_str().is_empty() {
            errors.push("Pack cache directory cannot be empty".to_string());
        }

        if self.blob_cache_enabled && self.blob_dir.as_os_str().is_empty() {
            errors.push("Blob cache directory cannot be empty".to_string());
        }

        if !self.pack_dir.as_os_str().is_empty() && self.pack_dir == self.blob_dir {
            errors.push("Pack and blob caches must use different directories".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("packet-relay"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
