//! Configuration Module
//!
//! This module provides constants, default configurations and the TOML configuration
//! file model for the mechd daemon.

use crate::error::{MechError, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Constants for default settings
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mechd/mechd.toml";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:10435";
pub const DEFAULT_BUS_ENDPOINT: &str = "tcp://127.0.0.1:10436";
pub const DEFAULT_LOG_PATH: &str = "/var/log/mechd.log";
pub const DEFAULT_JOURNAL_PATH: &str = "/var/log/mechd-commands.log";
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_DEVICE_TIMEOUT_SECONDS: u64 = 2;
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 500;

/// Top level configuration file
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
    #[serde(default, rename = "relay")]
    pub relays: Vec<RelayConfig>,
    #[serde(default, rename = "sensor")]
    pub sensors: Vec<SensorConfig>,
    /// Named coefficient sets, lowest order first
    #[serde(default)]
    pub calibration: HashMap<String, CalibrationConfig>,
}

/// Network and process settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
    /// ZeroMQ endpoint for the message bus; empty disables the bus
    pub bus_endpoint: String,
    /// Name used as the source field of outgoing envelopes
    pub bus_name: Option<String>,
    pub workers: usize,
    pub queue_depth: usize,
    pub client_timeout_ms: u64,
    pub log_path: String,
    pub journal_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            bus_endpoint: DEFAULT_BUS_ENDPOINT.to_string(),
            bus_name: None,
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            client_timeout_ms: DEFAULT_CLIENT_TIMEOUT_MS,
            log_path: DEFAULT_LOG_PATH.to_string(),
            journal_path: DEFAULT_JOURNAL_PATH.to_string(),
        }
    }
}

/// Protocol spoken by a device
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// CR-terminated ASCII motion controller
    Line,
    /// Fieldbus register module
    Register,
}

/// One `[[device]]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: u32,
    pub name: String,
    pub kind: DeviceKind,
    /// `host:port`, `serial:/dev/ttyS0@9600` or `sim`
    pub endpoint: String,
    #[serde(default = "default_conversion_factor")]
    pub conversion_factor: f64,
    #[serde(default = "default_min_pos")]
    pub min_pos: f64,
    #[serde(default = "default_max_pos")]
    pub max_pos: f64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    /// Bit index of the lower limit input in the `PR IN` bank
    #[serde(default = "default_lower_limit_bit")]
    pub lower_limit_bit: u8,
    /// Bit index of the upper limit input in the `PR IN` bank
    #[serde(default = "default_upper_limit_bit")]
    pub upper_limit_bit: u8,
    /// Fieldbus unit id
    #[serde(default = "default_unit")]
    pub unit: u8,
}

fn default_conversion_factor() -> f64 {
    1.0
}

fn default_min_pos() -> f64 {
    f64::MIN
}

fn default_max_pos() -> f64 {
    f64::MAX
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_DEVICE_TIMEOUT_SECONDS
}

fn default_liveness_timeout_ms() -> u64 {
    DEFAULT_LIVENESS_TIMEOUT_MS
}

fn default_lower_limit_bit() -> u8 {
    0
}

fn default_upper_limit_bit() -> u8 {
    1
}

fn default_unit() -> u8 {
    1
}

/// Relay wiring convention, which differs per subsystem
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelayConvention {
    /// Bit set means the circuit is closed (energized)
    NormallyOpen,
    /// Bit set means the circuit is open (de-energized)
    NormallyClosed,
}

/// One `[[relay]]` table: a single bit in a module register
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub name: String,
    /// Register device id
    pub module: u32,
    pub register: u16,
    pub mask: u16,
    pub convention: RelayConvention,
}

/// How a sensor register is turned into physical units
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Horner evaluation of a named coefficient set
    Polynomial,
    /// Resistance thermometer with 0.1 degree resolution
    Rtd,
}

/// One `[[sensor]]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    pub name: String,
    pub module: u32,
    pub register: u16,
    pub kind: SensorKind,
    /// Key into `[calibration]`; required for polynomial sensors
    pub calibration: Option<String>,
    #[serde(default)]
    pub units: String,
}

/// `[calibration.<name>]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationConfig {
    pub coefficients: Vec<f64>,
}

impl Config {
    /// Parse a configuration from TOML text and validate cross references
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    ///
    /// # Arguments
    /// * `path` - Path of the TOML file
    ///
    /// # Returns
    /// * `Result<Config>` - The parsed configuration or a `ConfigError`
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MechError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(device.id) {
                return Err(MechError::ConfigError(format!(
                    "duplicate device id {}",
                    device.id
                )));
            }
            if device.conversion_factor == 0.0 {
                return Err(MechError::ConfigError(format!(
                    "device {} has a zero conversion factor",
                    device.name
                )));
            }
        }

        let is_module = |id: u32| {
            self.devices
                .iter()
                .any(|d| d.id == id && d.kind == DeviceKind::Register)
        };

        for relay in &self.relays {
            if !is_module(relay.module) {
                return Err(MechError::ConfigError(format!(
                    "relay {} references unknown register module {}",
                    relay.name, relay.module
                )));
            }
        }

        for sensor in &self.sensors {
            if !is_module(sensor.module) {
                return Err(MechError::ConfigError(format!(
                    "sensor {} references unknown register module {}",
                    sensor.name, sensor.module
                )));
            }
            if sensor.kind == SensorKind::Polynomial {
                match &sensor.calibration {
                    Some(name) if self.calibration.contains_key(name) => {}
                    _ => {
                        return Err(MechError::ConfigError(format!(
                            "sensor {} needs a known calibration set",
                            sensor.name
                        )));
                    }
                }
            }
        }

        if self.server.workers == 0 {
            return Err(MechError::ConfigError("workers must be at least 1".to_string()));
        }
        Ok(())
    }
}
