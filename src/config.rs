//! Configuration System using Figment
//!
//! Configuration is loaded from (in order of precedence, highest first):
//! 1. Environment variables prefixed with `MERLIN_` (nested keys separated by `__`)
//! 2. TOML configuration file (default: `config/merlin.toml`)
//! 3. Built-in defaults ([`MerlinConfig::default`])
//!
//! ```text
//! MERLIN_DETECTOR__HOST=172.16.126.78
//! MERLIN_APPLICATION__LOG_LEVEL=debug
//! MERLIN_ACQUISITION__ARM_TIMEOUT_MS=5000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use merlin_daq::config::MerlinConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MerlinConfig::load_from("config/merlin.toml")?;
//!     println!("Detector: {}", config.detector.control_addr());
//!     Ok(())
//! }
//! ```

use crate::error::{AppResult, MerlinError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/merlin.toml";

/// Top-level configuration, constructed once and handed to every component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MerlinConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Network location of the detector
    #[serde(default)]
    pub detector: DetectorConfig,
    /// MPX codec settings
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Arm/acquisition timing
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Image storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Detector connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Hostname or IP address of the Merlin PC
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port of the control channel
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// TCP port of the data channel
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// MPX codec settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Consecutive bytes the decoder may discard while hunting for an `MPX`
    /// header before giving up with a framing error.
    #[serde(default = "default_max_resync_bytes")]
    pub max_resync_bytes: usize,
}

/// Arm and acquisition timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Delay between `STARTACQUISITION` and the first status poll
    #[serde(default = "default_arm_initial_delay")]
    pub arm_initial_delay_ms: u64,
    /// Interval between `DETECTORSTATUS` polls while arming
    #[serde(default = "default_arm_poll_interval")]
    pub arm_poll_interval_us: u64,
    /// Upper bound on the whole arm sequence
    #[serde(default = "default_arm_timeout")]
    pub arm_timeout_ms: u64,
    /// Multiple of the acquisition time the worker waits for data after a stop hint
    #[serde(default = "default_inactivity_factor")]
    pub inactivity_factor: f64,
    /// Drain bytes already waiting on the data socket before each job
    #[serde(default)]
    pub flush_stale_data: bool,
    /// Buffered messages per direction of the job channel
    #[serde(default = "default_job_channel_capacity")]
    pub job_channel_capacity: usize,
}

/// Image storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Dataset path inside the HDF5 file
    #[serde(default = "default_dataset_path")]
    pub dataset_path: String,
    /// Deflate compression level (0-9, 0 disables compression)
    #[serde(default = "default_compression")]
    pub compression_level: u8,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "Merlin DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    6341
}

fn default_data_port() -> u16 {
    6342
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_max_resync_bytes() -> usize {
    // Two full U32 frames.
    2 * 4 * 515 * 515 + 1024
}

fn default_arm_initial_delay() -> u64 {
    100
}

fn default_arm_poll_interval() -> u64 {
    100
}

fn default_arm_timeout() -> u64 {
    10_000
}

fn default_inactivity_factor() -> f64 {
    2.0
}

fn default_job_channel_capacity() -> usize {
    16
}

fn default_dataset_path() -> String {
    "/entry/measurement/Merlin/data".to_string()
}

fn default_compression() -> u8 {
    4
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            control_port: default_control_port(),
            data_port: default_data_port(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_resync_bytes: default_max_resync_bytes(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            arm_initial_delay_ms: default_arm_initial_delay(),
            arm_poll_interval_us: default_arm_poll_interval(),
            arm_timeout_ms: default_arm_timeout(),
            inactivity_factor: default_inactivity_factor(),
            flush_stale_data: false,
            job_channel_capacity: default_job_channel_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dataset_path: default_dataset_path(),
            compression_level: default_compression(),
        }
    }
}

impl DetectorConfig {
    /// `host:port` of the control channel
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    /// `host:port` of the data channel
    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl AcquisitionConfig {
    /// Delay before the first status poll
    pub fn arm_initial_delay(&self) -> Duration {
        Duration::from_millis(self.arm_initial_delay_ms)
    }

    /// Interval between status polls
    pub fn arm_poll_interval(&self) -> Duration {
        Duration::from_micros(self.arm_poll_interval_us)
    }

    /// Upper bound on the arm sequence
    pub fn arm_timeout(&self) -> Duration {
        Duration::from_millis(self.arm_timeout_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl MerlinConfig {
    /// Load configuration from `config/merlin.toml` and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error: defaults and environment overrides
    /// still apply. The result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MERLIN_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Log format is valid (pretty, compact, json)
    /// - Detector host is not empty and the two ports differ
    /// - Compression level is 0-9
    /// - Arm poll interval and timeout are non-zero
    /// - Inactivity factor is a positive finite number
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(MerlinError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(MerlinError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.detector.host.trim().is_empty() {
            return Err(MerlinError::Configuration(
                "detector.host cannot be empty".to_string(),
            ));
        }

        if self.detector.control_port == self.detector.data_port {
            return Err(MerlinError::Configuration(format!(
                "control_port and data_port must differ (both {})",
                self.detector.control_port
            )));
        }

        if self.protocol.max_resync_bytes == 0 {
            return Err(MerlinError::Configuration(
                "protocol.max_resync_bytes must be > 0".to_string(),
            ));
        }

        if self.acquisition.job_channel_capacity == 0 {
            return Err(MerlinError::Configuration(
                "acquisition.job_channel_capacity must be > 0".to_string(),
            ));
        }

        if self.acquisition.arm_poll_interval_us == 0 || self.acquisition.arm_timeout_ms == 0 {
            return Err(MerlinError::Configuration(
                "arm_poll_interval_us and arm_timeout_ms must be > 0".to_string(),
            ));
        }

        let factor = self.acquisition.inactivity_factor;
        if !factor.is_finite() || factor <= 0.0 {
            return Err(MerlinError::Configuration(format!(
                "Invalid inactivity_factor {}. Must be a positive number",
                factor
            )));
        }

        if self.storage.compression_level > 9 {
            return Err(MerlinError::Configuration(format!(
                "Invalid compression_level {}. Must be 0-9",
                self.storage.compression_level
            )));
        }

        if self.storage.dataset_path.trim().is_empty() {
            return Err(MerlinError::Configuration(
                "storage.dataset_path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
