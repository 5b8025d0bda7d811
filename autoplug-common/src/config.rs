//! Configuration loading and config file resolution
//!
//! All settings have built-in defaults; a TOML file only needs to name the
//! values it overrides.
//!
//! # Config file resolution priority
//!
//! 1. Explicit path (command-line argument)
//! 2. `AUTOPLUG_CONFIG` environment variable
//! 3. Platform config dir (`~/.config/autoplug/config.toml` on Linux)
//! 4. Built-in defaults (no file)
//!
//! A missing file from sources 2-3 is not an error. A file that exists but
//! does not parse is.

use crate::caps::Caps;
use crate::error::{Error, Result};
use crate::time::ClockTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "AUTOPLUG_CONFIG";

/// Terminal (raw) media types used when none are configured
pub const DEFAULT_RAW_CAPS: &str =
    "audio/x-raw; video/x-raw; text/x-raw; subpicture/x-raw; text/plain; text/x-pango-markup";

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capabilities treated as final output; autoplugging stops here
    pub raw_caps: Caps,

    /// PrerollBuffer sizing and watermarks
    pub buffering: BufferingConfig,

    /// URI schemes whose sources are network-style streamed inputs
    pub stream_uri_schemes: Vec<String>,

    /// Broadcast channel capacity of the event bus
    pub event_capacity: usize,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Buffering configuration (times in milliseconds)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferingConfig {
    /// Maximum queued time per PrerollBuffer
    pub queue_size_ms: u64,

    /// High watermark; defaults to 95% of the queue size
    pub queue_threshold_ms: Option<u64>,

    /// Low watermark; defaults to 30% of the queue size
    pub queue_min_threshold_ms: Option<u64>,

    /// Byte limit for raw video streams
    pub video_max_bytes: u64,

    /// Byte limit for every other stream type
    pub other_max_bytes: u64,

    /// Byte limit for any stream of a streamed input
    pub streamed_max_bytes: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            raw_caps: default_raw_caps(),
            buffering: BufferingConfig::default(),
            stream_uri_schemes: [
                "http", "https", "mms", "mmsh", "mmsu", "mmst", "fd", "myth", "ssh", "ftp", "sftp",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            event_capacity: 256,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            queue_size_ms: 3000,
            queue_threshold_ms: None,
            queue_min_threshold_ms: None,
            video_max_bytes: 25 * 1024 * 1024,
            other_max_bytes: 2 * 1024 * 1024,
            streamed_max_bytes: 2 * 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

fn default_raw_caps() -> Caps {
    DEFAULT_RAW_CAPS.parse().unwrap_or_else(|_| Caps::new_empty())
}

impl BufferingConfig {
    pub fn queue_size(&self) -> ClockTime {
        ClockTime::from_mseconds(self.queue_size_ms)
    }

    /// High watermark
    pub fn queue_threshold(&self) -> ClockTime {
        self.queue_threshold_ms
            .map(ClockTime::from_mseconds)
            .unwrap_or_else(|| self.queue_size().mul_div(95, 100))
    }

    /// Low watermark
    pub fn queue_min_threshold(&self) -> ClockTime {
        self.queue_min_threshold_ms
            .map(ClockTime::from_mseconds)
            .unwrap_or_else(|| self.queue_size().mul_div(30, 100))
    }
}

impl EngineConfig {
    /// Parse a TOML document, filling unspecified values with defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Resolve and load the config following the priority order
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_path, CONFIG_ENV_VAR) {
            Some(path) if path.exists() => {
                debug!("Loading config from {}", path.display());
                Self::from_file(&path)
            }
            Some(path) => {
                if cli_path.is_some() {
                    return Err(Error::Config(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                warn!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Check threshold ordering: min threshold <= threshold <= queue size
    pub fn validate(&self) -> Result<()> {
        let b = &self.buffering;
        if b.queue_size_ms == 0 {
            return Err(Error::Config("buffering.queue_size_ms must be > 0".to_string()));
        }
        if b.queue_min_threshold() > b.queue_threshold() {
            return Err(Error::Config(format!(
                "buffering low watermark ({}) above high watermark ({})",
                b.queue_min_threshold(),
                b.queue_threshold()
            )));
        }
        if b.queue_threshold() > b.queue_size() {
            return Err(Error::Config(format!(
                "buffering high watermark ({}) above queue size ({})",
                b.queue_threshold(),
                b.queue_size()
            )));
        }
        if self.raw_caps.is_any() {
            return Err(Error::Config("raw_caps must not be ANY".to_string()));
        }
        Ok(())
    }

    /// True if the URI's scheme marks a streamed (network-style) source
    pub fn is_stream_uri(&self, uri: &str) -> bool {
        match uri.split_once("://") {
            Some((scheme, _)) => self
                .stream_uri_schemes
                .iter()
                .any(|s| s.eq_ignore_ascii_case(scheme)),
            None => false,
        }
    }
}

/// Config file resolution:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. Platform config directory
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir().map(|d| d.join("autoplug").join("config.toml"))
}
