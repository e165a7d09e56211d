//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/volt_daq.toml` (optional; every key has a default)
//! 2. Environment variables prefixed with `VOLT_DAQ_`, using `__` between
//!    nested keys (e.g. `VOLT_DAQ_SERIAL__PORT=/dev/ttyUSB1`)
//!
//! # Example
//! ```no_run
//! use volt_daq::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Port: {}", config.serial.port);
//! # Ok(())
//! # }
//! ```

use crate::clock::SamplingMode;
use crate::command::{Codebook, CodebookConfig};
use crate::connection::{AcquisitionSettings, ConnectOptions};
use crate::error::{AppResult, DaqError};
use crate::framing::FramingConfig;
use crate::serial::SerialOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/volt_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Stream settings
    pub serial: SerialConfig,
    /// Line framing
    pub framing: FramingConfig,
    /// Command codebook for the attached firmware
    pub codebook: CodebookConfig,
    /// Device id → display name
    pub devices: BTreeMap<String, String>,
    /// Export settings
    pub export: ExportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Serial stream configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    /// Port path
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read buffer size in bytes
    pub buffer_size: usize,
    /// Record labelling
    pub sampling_mode: SamplingMode,
    /// Bound on the identity query
    #[serde(with = "humantime_serde")]
    pub identify_timeout: Duration,
}

/// Export configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory for exported CSV files
    pub output_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "volt-daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        let options = SerialOptions::default();
        Self {
            port: options.port,
            baud_rate: options.baud_rate,
            buffer_size: options.buffer_size,
            sampling_mode: SamplingMode::Periodic,
            identify_timeout: Duration::from_secs(1),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut devices = BTreeMap::new();
        devices.insert("VOLT0".to_string(), "USB Voltmeter".to_string());
        Self {
            application: ApplicationConfig::default(),
            serial: SerialConfig::default(),
            framing: FramingConfig::default(),
            codebook: CodebookConfig::default(),
            devices,
            export: ExportConfig::default(),
        }
    }
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load from the default file and environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VOLT_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(DaqError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 {
            return Err(DaqError::Validation("baud_rate must be positive".to_string()));
        }

        if self.serial.buffer_size == 0 {
            return Err(DaqError::Validation(
                "buffer_size must be positive".to_string(),
            ));
        }

        if self.framing.separator == self.framing.terminator
            || Some(self.framing.separator) == self.framing.strip
        {
            return Err(DaqError::Validation(format!(
                "field separator {:?} collides with the line terminator",
                self.framing.separator
            )));
        }

        self.codebook()?;
        Ok(())
    }

    /// Build the validated codebook.
    pub fn codebook(&self) -> AppResult<Codebook> {
        Codebook::try_from(self.codebook.clone())
    }

    /// Settings for a [`ConnectionManager`](crate::connection::ConnectionManager).
    pub fn acquisition_settings(&self) -> AppResult<AcquisitionSettings> {
        Ok(AcquisitionSettings {
            framing: self.framing.clone(),
            codebook: self.codebook()?,
            devices: self.devices.clone().into(),
        })
    }

    /// Options for [`ConnectionManager::open`](crate::connection::ConnectionManager::open).
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            serial: SerialOptions {
                port: self.serial.port.clone(),
                baud_rate: self.serial.baud_rate,
                buffer_size: self.serial.buffer_size,
            },
            sampling_mode: self.serial.sampling_mode,
        }
    }
}
