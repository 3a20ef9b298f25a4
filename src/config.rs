//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (base configuration, optional)
//! 2. Environment variables prefixed with `MP285_`
//!
//! Nested keys use a double underscore, so a single underscore inside a key
//! name survives:
//!
//! ```text
//! MP285_STAGE__PORT=/dev/ttyUSB1
//! MP285_STAGE__TIMEOUT_SECS=10
//! MP285_LOG__PATH=positions.csv
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mp285::config::Settings;
//!
//! let settings = Settings::load_from("mp285.toml")?;
//! println!("Stage on {}", settings.stage.port);
//! # Ok::<(), mp285::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{Position, DEFAULT_STEPMULT};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are not usable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial link and unit conversion
    pub stage: StageConfig,
    /// CSV event log
    pub log: LogConfig,
    /// Timed well cycling
    pub cycle: CycleConfig,
}

/// Per-device serial and conversion settings.
///
/// Each `Session` gets its own copy; nothing here is shared between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM5")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout in seconds; also bounds how long a move may take
    pub timeout_secs: f64,
    /// Microsteps per micron
    pub stepmult: u32,
}

/// Event log settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// CSV file to create; logging is disabled when unset
    pub path: Option<PathBuf>,
}

/// Well cycling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Seconds between moves
    pub interval_secs: u64,
    /// Seconds to wait after connecting before the first move
    pub settle_secs: u64,
    /// Well coordinates in µm, visited in order and repeated
    pub wells: Vec<[f64; 3]>,
    /// Stop after this many moves
    pub count: Option<usize>,
}

// ============================================================================
// Default values
// ============================================================================

/// MP-285 serial speed.
pub const DEFAULT_BAUD_RATE: u32 = 128_000;

/// Default read timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 5.0;

const DEFAULT_WELLS: [[f64; 3]; 6] = [
    [3625.0, 4108.0, 9000.0],
    [3676.0, 13204.0, 9000.0],
    [3443.0, 21940.0, 9000.0],
    [12739.0, 4108.0, 9000.0],
    [12738.0, 13204.0, 9000.0],
    [12622.0, 22285.0, 9000.0],
];

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            stepmult: DEFAULT_STEPMULT,
        }
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10 * 60,
            settle_secs: 10,
            wells: DEFAULT_WELLS.to_vec(),
            count: None,
        }
    }
}

impl StageConfig {
    /// Default settings for the stage on `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Read timeout as a `Duration`.
    ///
    /// Call after [`StageConfig::validate`]; an invalid value falls back to
    /// the default.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS))
    }

    /// Check port, speed, timeout and stepmult.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "stage.port cannot be empty".to_string(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "stage.baud_rate must be positive".to_string(),
            ));
        }
        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid stage.timeout_secs {}. Must be a positive number of seconds",
                self.timeout_secs
            )));
        }
        if self.stepmult == 0 {
            return Err(ConfigError::ValidationError(
                "stage.stepmult must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl CycleConfig {
    /// Configured wells as positions.
    pub fn positions(&self) -> Vec<Position> {
        self.wells.iter().copied().map(Position::from).collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cycle.interval_secs must be positive".to_string(),
            ));
        }
        if self.wells.is_empty() {
            return Err(ConfigError::ValidationError(
                "cycle.wells must list at least one position".to_string(),
            ));
        }
        if let Some(i) = self
            .wells
            .iter()
            .position(|w| w.iter().any(|v| !v.is_finite()))
        {
            return Err(ConfigError::ValidationError(format!(
                "cycle.wells[{}] is not a finite position",
                i
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Environment variable prefix.
    pub const ENV_PREFIX: &'static str = "MP285_";

    /// Figment for `path` merged with the environment.
    ///
    /// A missing file is not an error; the environment and defaults still
    /// apply.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
    }

    /// Parse without validating, so callers can apply overrides first.
    pub fn extract<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(Self::figment(path).extract()?)
    }

    /// Load configuration from a file and the environment, then validate.
    ///
    /// Environment variables take precedence over the file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings = Self::extract(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stage.validate()?;
        self.cycle.validate()?;
        Ok(())
    }
}
