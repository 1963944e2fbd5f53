//! Configuration loading for the supervisor.
//!
//! TOML-based, with every key defaulted so an absent file or empty table
//! yields a runnable configuration. Semantic validation runs after parse
//! and rejects inconsistent hall bounds, empty winch lists and
//! non-positive timing values.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::WinchId;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Trait for loading configuration from TOML files.
///
/// Provides a default implementation for any `DeserializeOwned` type.
/// Callers are expected to run the type's own `validate()` after loading.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound);
        }
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Which Modbus stop command the supervisor issues on its normal stop path.
///
/// The drive documents both; field units differ on which one the
/// controller should prefer, so the choice is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopCommand {
    /// Coast to a stop (register value 0x0802).
    Natural,
    /// Brake to a stop (register value 0x0D02).
    Brake,
}

/// Sensor device link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Sensor device address.
    pub host: String,
    /// Sensor device TCP port.
    pub port: u16,
    /// Socket operation timeout [s].
    pub timeout_s: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            host: "192.168.2.123".to_string(),
            port: 5000,
            timeout_s: 2.0,
        }
    }
}

impl SensorConfig {
    /// Socket timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }
}

/// Motion, safety and motor bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Ordered winch identifiers; position selects the directional sign.
    pub winch_ids: Vec<WinchId>,
    /// Hall magnitude below which the cable is considered disengaged.
    pub hall_threshold: u16,
    /// Hall magnitude mapped to `hall_rpm_max`.
    pub hall_max: u16,
    /// RPM commanded at `hall_max` and above.
    pub hall_rpm_max: u16,
    /// RPM commanded at `hall_threshold`.
    pub hall_rpm_min: u16,
    /// Extra hall margin required to re-engage a motor a hall-gated run
    /// has stopped (0 = re-engage exactly at threshold).
    pub hall_hysteresis: u16,
    /// Minimum mapped-RPM change that triggers a new RPM write.
    pub rpm_deadband: u16,
    /// Sensor poll period [s].
    pub poll_interval_s: f64,
    /// Maximum snapshot age before motion is unsafe [s].
    pub stale_timeout_s: f64,
    /// Initial reconnect backoff [s].
    pub evb_backoff_initial_s: f64,
    /// Backoff ceiling [s].
    pub evb_backoff_max_s: f64,
    /// Backoff growth factor per failed attempt.
    pub evb_backoff_factor: f64,
    /// Poll with BUNDLE requests (one aggregate per winch). When false,
    /// the poller falls back to SNAPSHOT(+POWER) pairs.
    pub use_bundle: bool,
    /// Collect power telemetry.
    pub use_power: bool,
    /// Poll the IMU once per cycle.
    pub use_imu: bool,
    /// RS-485 serial device.
    pub serial_port: String,
    /// RS-485 baud rate.
    pub baud_rate: u32,
    /// Serial read timeout [s].
    pub serial_timeout_s: f64,
    /// Settling interval after each Modbus write before draining the echo [ms].
    pub settle_ms: u64,
    /// Default Modbus slave address when a winch has no explicit mapping.
    pub device_address: u8,
    /// Optional per-winch Modbus slave addresses. Keys are winch ids as
    /// strings (TOML tables cannot carry integer keys).
    pub modbus_addresses: BTreeMap<String, u8>,
    /// Stop command variant issued on the normal stop path.
    pub stop_command: StopCommand,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            winch_ids: vec![1, 2, 3, 4],
            hall_threshold: 1500,
            hall_max: 2800,
            hall_rpm_max: 1500,
            hall_rpm_min: 200,
            hall_hysteresis: 0,
            rpm_deadband: 10,
            poll_interval_s: 0.05,
            stale_timeout_s: 1.5,
            evb_backoff_initial_s: 0.2,
            evb_backoff_max_s: 2.0,
            evb_backoff_factor: 1.5,
            use_bundle: true,
            use_power: true,
            use_imu: true,
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            serial_timeout_s: 1.0,
            settle_ms: 50,
            device_address: 1,
            modbus_addresses: BTreeMap::new(),
            stop_command: StopCommand::Natural,
        }
    }
}

impl MotionConfig {
    /// Poll period as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_s)
    }

    /// Staleness limit as a `Duration`.
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stale_timeout_s)
    }

    /// Modbus slave address for a winch.
    pub fn slave_for(&self, winch: WinchId) -> u8 {
        self.modbus_addresses
            .get(winch.to_string().as_str())
            .copied()
            .unwrap_or(self.device_address)
    }

    /// The address map with parsed winch-id keys.
    pub fn slave_map(&self) -> BTreeMap<WinchId, u8> {
        self.modbus_addresses
            .iter()
            .filter_map(|(key, &slave)| key.parse::<WinchId>().ok().map(|w| (w, slave)))
            .collect()
    }
}

/// HTTP adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// SSE snapshot period [s].
    pub events_interval_s: f64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            events_interval_s: 0.2,
        }
    }
}

/// Root configuration for the supervisor process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NestorConfig {
    pub sensor: SensorConfig,
    pub motion: MotionConfig,
    pub api: ApiConfig,
}

impl ConfigLoader for NestorConfig {}

impl NestorConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when the winch list is empty
    /// or duplicated, the hall map bounds are inverted, or a timing value
    /// is non-positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.motion;
        if m.winch_ids.is_empty() {
            return Err(ConfigError::ValidationError(
                "motion.winch_ids cannot be empty".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for w in &m.winch_ids {
            if !seen.insert(*w) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate winch id {w}"
                )));
            }
        }
        if m.hall_max <= m.hall_threshold {
            return Err(ConfigError::ValidationError(format!(
                "motion.hall_max ({}) must exceed motion.hall_threshold ({})",
                m.hall_max, m.hall_threshold
            )));
        }
        if m.hall_rpm_max < m.hall_rpm_min {
            return Err(ConfigError::ValidationError(
                "motion.hall_rpm_max must be >= motion.hall_rpm_min".to_string(),
            ));
        }
        if m.poll_interval_s <= 0.0 {
            return Err(ConfigError::ValidationError(
                "motion.poll_interval_s must be positive".to_string(),
            ));
        }
        if m.stale_timeout_s <= 0.0 {
            return Err(ConfigError::ValidationError(
                "motion.stale_timeout_s must be positive".to_string(),
            ));
        }
        if m.evb_backoff_factor < 1.0 {
            return Err(ConfigError::ValidationError(
                "motion.evb_backoff_factor must be >= 1.0".to_string(),
            ));
        }
        if self.sensor.timeout_s <= 0.0 {
            return Err(ConfigError::ValidationError(
                "sensor.timeout_s must be positive".to_string(),
            ));
        }
        for key in m.modbus_addresses.keys() {
            if key.parse::<WinchId>().is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "motion.modbus_addresses key '{key}' is not a winch id"
                )));
            }
        }
        Ok(())
    }
}
