//! Fleet configuration loaded from TOML.
//!
//! The file holds an optional `[tuning]` table with engine constants and a
//! list of `[[site]]` tables, each with its `[[site.channel]]` and
//! `[[site.schedule]]` entries.
//!
//! Path resolution order: explicit path, then `LEDFLEET_CONFIG`, then
//! `<config_dir>/ledfleet/sites.toml`.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ledfleet_core::{DomainError, SiteDescriptor};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "LEDFLEET_CONFIG";

/// Errors raised while locating, reading, or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid site '{site}': {source}")]
    InvalidSite {
        site: String,
        #[source]
        source: DomainError,
    },

    #[error("Duplicate site name: {0}")]
    DuplicateSite(String),

    #[error("Invalid tuning value {field}: {reason}")]
    InvalidTuning { field: &'static str, reason: String },

    #[error("No configuration directory available; pass --config or set LEDFLEET_CONFIG")]
    NoConfigDir,
}

// ============================================================================
// Engine Tuning
// ============================================================================

/// Empirically tuned engine constants.
///
/// Every field has a default, so `[tuning]` may be omitted or partial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTuning {
    /// Frames a channel may hold before it is considered jammed
    pub max_queue_depth: usize,
    /// Flush a non-empty queue once this long has passed since the last flush
    pub batch_timeout_ms: u64,
    /// Idle sleep between channel worker iterations
    pub worker_interval_ms: u64,
    /// Minimum gap between enqueue attempts while no connection exists
    pub enqueue_retry_ms: u64,
    /// Minimum gap between connect attempts to the same host
    pub connect_throttle_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// How long a connection stays dead after a resolution failure
    pub resolve_retry_ms: u64,
    /// Window after which the byte-rate counter restarts
    pub rate_window_ms: u64,
    /// How long each eligible producer runs before rotating
    pub rotation_secs: u64,
    /// Frames the device firmware can buffer
    pub device_buffer_frames: u32,
    /// Share of that buffer the timestamp offset aims to fill
    pub buffer_use_fraction: f64,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            max_queue_depth: 50,
            batch_timeout_ms: 1000,
            worker_interval_ms: 10,
            enqueue_retry_ms: 2000,
            connect_throttle_ms: 1000,
            connect_timeout_ms: 2000,
            write_timeout_ms: 5000,
            resolve_retry_ms: 30_000,
            rate_window_ms: 10_000,
            rotation_secs: 300,
            device_buffer_frames: 29,
            buffer_use_fraction: 0.6,
        }
    }
}

impl EngineTuning {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms)
    }

    pub fn enqueue_retry(&self) -> Duration {
        Duration::from_millis(self.enqueue_retry_ms)
    }

    pub fn connect_throttle(&self) -> Duration {
        Duration::from_millis(self.connect_throttle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn resolve_retry(&self) -> Duration {
        Duration::from_millis(self.resolve_retry_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn rotation(&self) -> Duration {
        Duration::from_secs(self.rotation_secs)
    }

    /// Checks values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_depth == 0 {
            return Err(ConfigError::InvalidTuning {
                field: "max_queue_depth",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.rotation_secs == 0 {
            return Err(ConfigError::InvalidTuning {
                field: "rotation_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.connect_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidTuning {
                field: "connect_timeout_ms/write_timeout_ms",
                reason: "socket timeouts must be non-zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.buffer_use_fraction) {
            return Err(ConfigError::InvalidTuning {
                field: "buffer_use_fraction",
                reason: format!("{} is outside 0.0..=1.0", self.buffer_use_fraction),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Fleet Config
// ============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub tuning: EngineTuning,

    #[serde(default, rename = "site")]
    pub sites: Vec<SiteDescriptor>,
}

impl FleetConfig {
    /// Reads, parses, and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: FleetConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects duplicate or invalid sites and unusable tuning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tuning.validate()?;

        let mut seen = HashSet::new();
        for site in &self.sites {
            site.validate().map_err(|source| ConfigError::InvalidSite {
                site: site.name.clone(),
                source,
            })?;
            if !seen.insert(site.name.as_str()) {
                return Err(ConfigError::DuplicateSite(site.name.clone()));
            }
        }
        Ok(())
    }

    /// Total number of channels across all sites.
    pub fn channel_count(&self) -> usize {
        self.sites.iter().map(|s| s.channels.len()).sum()
    }
}

/// Default config location under the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ledfleet").join("sites.toml"))
}

/// Picks the configuration path: `explicit`, then the environment, then the
/// platform default.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(path) = env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    default_config_path().ok_or(ConfigError::NoConfigDir)
}
