//! Clock configuration.
//!
//! Stored as TOML. Every field is optional:
//!
//! ```toml
//! bpm = 96.0
//! interpolation = { power = 2.0 }
//! ```

use crate::error::{ensure_positive, Error, Result};
use crate::queue::Interpolation;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default tempo for a new clock.
pub const DEFAULT_BPM: f64 = 120.0;

/// Settings a [`Clock`](crate::clock::Clock) is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Initial tempo in beats per minute
    pub bpm: f64,
    /// Default curve for velocity interpolation
    pub interpolation: Interpolation,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            interpolation: Interpolation::default(),
        }
    }
}

impl ClockConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClockConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!("Config file not found at {:?}", path)));
        }
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        log::debug!("loaded clock config from {:?}: {} BPM", path, config.bpm);
        Ok(config)
    }

    /// Load configuration or return default if missing or invalid
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Save configuration to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure_positive("bpm", self.bpm).map_err(|e| Error::Config(e.to_string()))?;
        self.interpolation
            .validate()
            .map_err(|e| Error::Config(e.to_string()))
    }
}
