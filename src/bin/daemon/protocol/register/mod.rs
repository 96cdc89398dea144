//! Register Protocol Client
//!
//! Reads and writes blocks of 16-bit registers on fieldbus I/O modules. A transfer either
//! completes or fails as a whole with `UnreachableFieldbusDevice`; callers treat that as
//! the module being powered off and never see partial data.
//!
//! On top of raw transfers the client knows the configured relay channels (one bit each,
//! with a per-channel wiring convention) and sensors (calibrated through a polynomial or
//! the RTD rule).

pub mod calibration;
pub mod modbus;
pub mod transport;

use crate::config::{Config, DeviceKind, RelayConfig, RelayConvention, SensorConfig, SensorKind};
use crate::device::{Device, DeviceRegistry};
use crate::error::{MechError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use transport::RegisterTransport;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Logical state of a relay channel, after applying its convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::On => write!(f, "on"),
            RelayState::Off => write!(f, "off"),
        }
    }
}

impl RelayConvention {
    /// Register bit level that puts the channel in `state`
    fn bit_for(self, state: RelayState) -> bool {
        match (self, state) {
            (RelayConvention::NormallyOpen, RelayState::On) => true,
            (RelayConvention::NormallyOpen, RelayState::Off) => false,
            (RelayConvention::NormallyClosed, RelayState::On) => false,
            (RelayConvention::NormallyClosed, RelayState::Off) => true,
        }
    }

    /// Channel state for a register bit level
    fn state_for(self, bit: bool) -> RelayState {
        if bit == self.bit_for(RelayState::On) {
            RelayState::On
        } else {
            RelayState::Off
        }
    }
}

/// One calibrated sensor sample
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SensorReading {
    pub name: String,
    pub raw: u16,
    pub value: f64,
    pub units: String,
}

/// Relay channels, sensors and coefficient sets from the configuration
#[derive(Debug, Clone, Default)]
pub struct IoLayout {
    relays: Vec<RelayConfig>,
    sensors: Vec<SensorConfig>,
    calibration: HashMap<String, Vec<f64>>,
}

impl IoLayout {
    pub fn from_config(config: &Config) -> Self {
        Self {
            relays: config.relays.clone(),
            sensors: config.sensors.clone(),
            calibration: config
                .calibration
                .iter()
                .map(|(name, set)| (name.clone(), set.coefficients.clone()))
                .collect(),
        }
    }

    pub fn relay(&self, name: &str) -> Result<&RelayConfig> {
        self.relays
            .iter()
            .find(|relay| relay.name.eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| MechError::NotFound(format!("relay {}", name)))
    }

    pub fn sensor(&self, name: &str) -> Result<&SensorConfig> {
        self.sensors
            .iter()
            .find(|sensor| sensor.name.eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| MechError::NotFound(format!("sensor {}", name)))
    }

    /// Relays wired to one module, in configuration order
    pub fn relays_on(&self, module: u32) -> impl Iterator<Item = &RelayConfig> {
        self.relays.iter().filter(move |relay| relay.module == module)
    }

    pub fn coefficients(&self, name: &str) -> Result<&[f64]> {
        self.calibration
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| MechError::NotFound(format!("calibration set {}", name)))
    }

    /// Convert a raw sensor register into physical units
    pub fn calibrate(&self, sensor: &SensorConfig, raw: u16) -> Result<f64> {
        match sensor.kind {
            SensorKind::Rtd => Ok(calibration::rtd_temperature(raw)),
            SensorKind::Polynomial => {
                let set = sensor.calibration.as_deref().ok_or_else(|| {
                    MechError::ConfigError(format!("sensor {} has no calibration set", sensor.name))
                })?;
                Ok(calibration::horner(self.coefficients(set)?, raw as f64))
            }
        }
    }
}

/// Request/response driver for fieldbus modules
#[derive(Clone)]
pub struct RegisterClient {
    registry: Arc<DeviceRegistry>,
    layout: Arc<IoLayout>,
}

impl RegisterClient {
    pub fn new(registry: Arc<DeviceRegistry>, layout: Arc<IoLayout>) -> Self {
        Self { registry, layout }
    }

    pub fn layout(&self) -> &IoLayout {
        &self.layout
    }

    fn device(&self, id: u32) -> Result<Arc<Device>> {
        let device = self.registry.get(id)?;
        device.expect_kind(DeviceKind::Register)?;
        Ok(device)
    }

    /// Move `count` registers between a module and `buffer`
    ///
    /// On failure `buffer` is left untouched.
    ///
    /// # Arguments
    /// * `direction` - Read fills `buffer`, write sends it
    /// * `device_id` - Register module id
    /// * `unit` - Fieldbus unit id
    /// * `base` - First register address
    /// * `buffer` - Register values
    /// * `count` - Number of registers, at most `buffer.len()`
    pub async fn register_transfer(
        &self,
        direction: Direction,
        device_id: u32,
        unit: u8,
        base: u16,
        buffer: &mut [u16],
        count: usize,
    ) -> Result<()> {
        let device = self.device(device_id)?;
        let limit = match direction {
            Direction::Read => modbus::MAX_READ_COUNT,
            Direction::Write => modbus::MAX_WRITE_COUNT,
        } as usize;
        if count > buffer.len() || count > limit {
            return Err(MechError::InvalidArguments(format!(
                "{} registers requested, buffer holds {}, limit {}",
                count,
                buffer.len(),
                limit
            )));
        }
        if count == 0 {
            return Ok(());
        }

        let _busy = device.try_begin()?;
        let mut slot = device.fieldbus.lock().await;
        let result = transfer(
            &device,
            &mut slot,
            direction,
            unit,
            base,
            &mut buffer[..count],
        )
        .await;
        note(&device, &result);
        result
    }

    /// Set or clear `mask` bits of one register with a single read-modify-write
    ///
    /// # Returns
    /// * `Result<u16>` - The value written
    pub async fn update_bits(
        &self,
        device_id: u32,
        register: u16,
        mask: u16,
        set: bool,
    ) -> Result<u16> {
        let device = self.device(device_id)?;
        let _busy = device.try_begin()?;
        let mut slot = device.fieldbus.lock().await;
        let unit = device.unit();

        let result: Result<u16> = async {
            let mut value = [0u16; 1];
            transfer(&device, &mut slot, Direction::Read, unit, register, &mut value).await?;
            value[0] = if set { value[0] | mask } else { value[0] & !mask };
            transfer(&device, &mut slot, Direction::Write, unit, register, &mut value).await?;
            Ok(value[0])
        }
        .await;
        note(&device, &result);
        result
    }

    async fn read_one(&self, device_id: u32, register: u16) -> Result<u16> {
        let unit = self.device(device_id)?.unit();
        let mut value = [0u16; 1];
        self.register_transfer(Direction::Read, device_id, unit, register, &mut value, 1)
            .await?;
        Ok(value[0])
    }

    /// Switch a relay channel on or off according to its convention
    pub async fn set_relay(&self, name: &str, state: RelayState) -> Result<()> {
        let relay = self.layout.relay(name)?;
        let level = relay.convention.bit_for(state);
        let value = self
            .update_bits(relay.module, relay.register, relay.mask, level)
            .await?;
        info!(
            "Relay {} {} (register {} = 0x{:04X})",
            relay.name, state, relay.register, value
        );
        Ok(())
    }

    /// Current state of a relay channel
    pub async fn relay_state(&self, name: &str) -> Result<RelayState> {
        let relay = self.layout.relay(name)?;
        let value = self.read_one(relay.module, relay.register).await?;
        Ok(relay.convention.state_for(value & relay.mask != 0))
    }

    /// Read and calibrate one sensor
    pub async fn read_sensor(&self, name: &str) -> Result<SensorReading> {
        let sensor = self.layout.sensor(name)?;
        let raw = self.read_one(sensor.module, sensor.register).await?;
        let value = self.layout.calibrate(sensor, raw)?;
        debug!("Sensor {} raw {} -> {}", sensor.name, raw, value);
        Ok(SensorReading {
            name: sensor.name.clone(),
            raw,
            value,
            units: sensor.units.clone(),
        })
    }
}

fn note<T>(device: &Device, result: &Result<T>) {
    match result {
        Ok(_) => device.clear_error(),
        Err(e) => {
            warn!(device = %device.name(), "{}", e);
            device.record_error(e);
        }
    }
}

/// One transfer on an already guarded module; drops the transport on failure
async fn transfer(
    device: &Device,
    slot: &mut Option<Box<dyn RegisterTransport>>,
    direction: Direction,
    unit: u8,
    base: u16,
    buffer: &mut [u16],
) -> Result<()> {
    let unreachable = |reason: String| MechError::UnreachableFieldbusDevice {
        device: device.name().to_string(),
        reason,
    };

    if slot.is_none() {
        let opened = transport::open(device.endpoint(), device.timeout())
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        debug!(device = %device.name(), "Opened {}", opened.describe());
        *slot = Some(opened);
    }
    let Some(link) = slot.as_mut() else {
        return Err(unreachable("transport not open".to_string()));
    };

    let outcome = match direction {
        Direction::Read => link
            .read_registers(unit, base, buffer.len() as u16)
            .await
            .and_then(|values| {
                if values.len() == buffer.len() {
                    buffer.copy_from_slice(&values);
                    Ok(())
                } else {
                    Err(std::io::Error::other(format!(
                        "{} registers returned for {}",
                        values.len(),
                        buffer.len()
                    )))
                }
            }),
        Direction::Write => link.write_registers(unit, base, buffer).await,
    };

    let reconnect = link.reconnect_on_error();
    outcome.map_err(|e| {
        if reconnect {
            *slot = None;
        }
        unreachable(e.to_string())
    })
}

#[cfg(test)]
mod register_tests;
