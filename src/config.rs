//! Configuration loading
//!
//! Settings come from a TOML file, by default in the platform config directory:
//! - Linux: ~/.config/micloop/config.toml
//! - Windows: %APPDATA%\micloop\config.toml
//! - macOS: ~/Library/Application Support/micloop/config.toml
//!
//! Missing keys fall back to defaults; command line flags override the file.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::SyncConfig;

/// Application name used for configuration directory
const APP_NAME: &str = "micloop";

/// Default tick interval (about one tick per 60 Hz frame)
const DEFAULT_TICK_MS: u64 = 16;

/// Errors from loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Synchronizer settings (device, latency, drift tolerance, rate step, smoothing)
    #[serde(flatten)]
    pub sync: SyncConfig,

    /// Interval between synchronizer ticks in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Capture sample rate (None = device native rate)
    #[serde(default)]
    pub sample_rate: Option<u32>,

    /// Capture channel count (None = device native channels)
    #[serde(default)]
    pub channels: Option<u16>,
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            tick_ms: DEFAULT_TICK_MS,
            sample_rate: None,
            channels: None,
        }
    }
}

impl AppConfig {
    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if !(1..=1000).contains(&self.tick_ms) {
            return Err(ConfigError::Invalid(format!(
                "tick interval {} ms must be between 1 and 1000",
                self.tick_ms
            )));
        }
        if self.sample_rate == Some(0) {
            return Err(ConfigError::Invalid("sample rate must be positive".into()));
        }
        if self.channels == Some(0) {
            return Err(ConfigError::Invalid("channel count must be positive".into()));
        }

        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

/// Get the default configuration file path
///
/// Returns None if the configuration directory cannot be determined.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration
///
/// An explicit path must exist. Without one, the default path is used if
/// present, otherwise defaults are returned.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(AppConfig::default()),
        },
    };

    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;

    tracing::debug!("Loaded config from {:?}", path);
    AppConfig::from_toml(&content)
}
