//! Device Module
//!
//! Every controllable unit (motor stage, shutter, filter wheel, fieldbus module) is a
//! [`Device`]. A device owns its transport behind an async mutex and carries an atomic
//! busy flag that admits a single in-flight operation at a time.

use crate::config::{DeviceConfig, DeviceKind};
use crate::error::{MechError, Result};
use crate::protocol::line::transport::LineTransport;
use crate::protocol::register::transport::RegisterTransport;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

pub mod registry;

pub use registry::DeviceRegistry;

/// Point-in-time view of a device, used for status replies and diagnostics
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceRecord {
    pub id: u32,
    pub name: String,
    pub endpoint: String,
    pub busy: bool,
    pub locked: bool,
    /// Last known position in raw controller units
    pub position: f64,
    pub conversion_factor: f64,
    pub min_pos: f64,
    pub max_pos: f64,
    pub timeout_seconds: u64,
    pub last_error: String,
    pub power_failed: bool,
    pub fault: bool,
}

/// Mutable device state; the lock is never held across an `.await`
#[derive(Debug, Default)]
struct DeviceState {
    locked: bool,
    position: f64,
    last_error: String,
    power_failed: bool,
    fault: bool,
}

/// A configured device and its transport
pub struct Device {
    id: u32,
    name: String,
    kind: DeviceKind,
    endpoint: String,
    conversion_factor: f64,
    min_pos: f64,
    max_pos: f64,
    timeout: Duration,
    liveness_timeout: Duration,
    lower_limit_bit: u8,
    upper_limit_bit: u8,
    unit: u8,
    busy: AtomicBool,
    state: Mutex<DeviceState>,
    pub(crate) line: async_std::sync::Mutex<Option<Box<dyn LineTransport>>>,
    pub(crate) fieldbus: async_std::sync::Mutex<Option<Box<dyn RegisterTransport>>>,
}

/// Scoped single-flight permit; dropping it clears the busy flag on every exit path
pub struct BusyGuard<'a> {
    device: &'a Device,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.device.busy.store(false, Ordering::Release);
        debug!(device = %self.device.name, "released");
    }
}

impl Device {
    /// Create a device from its configuration table
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            kind: config.kind,
            endpoint: config.endpoint.clone(),
            conversion_factor: config.conversion_factor,
            min_pos: config.min_pos,
            max_pos: config.max_pos,
            timeout: Duration::from_secs(config.timeout_seconds),
            liveness_timeout: Duration::from_millis(config.liveness_timeout_ms),
            lower_limit_bit: config.lower_limit_bit,
            upper_limit_bit: config.upper_limit_bit,
            unit: config.unit,
            busy: AtomicBool::new(false),
            state: Mutex::new(DeviceState::default()),
            line: async_std::sync::Mutex::new(None),
            fieldbus: async_std::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn limit_bits(&self) -> (u8, u8) {
        (self.lower_limit_bit, self.upper_limit_bit)
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min_pos, self.max_pos)
    }

    /// Fail with `NotFound` unless the device speaks the expected protocol
    pub fn expect_kind(&self, kind: DeviceKind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(MechError::NotFound(format!(
                "{} is not a {} device",
                self.name,
                match kind {
                    DeviceKind::Line => "motion controller",
                    DeviceKind::Register => "fieldbus",
                }
            )))
        }
    }

    /// Claim the device for one operation, failing fast if another one is in flight
    ///
    /// # Returns
    /// * `Result<BusyGuard>` - The permit, or `BusyConflict`
    pub fn try_begin(&self) -> Result<BusyGuard<'_>> {
        match self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(device = %self.name, "acquired");
                Ok(BusyGuard { device: self })
            }
            Err(_) => Err(MechError::BusyConflict {
                device: self.name.clone(),
            }),
        }
    }

    /// Non-blocking flag check; never touches the hardware
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    pub fn set_locked(&self, locked: bool) {
        self.state().locked = locked;
    }

    pub fn position(&self) -> f64 {
        self.state().position
    }

    pub fn set_position(&self, raw: f64) {
        self.state().position = raw;
    }

    pub fn power_failed(&self) -> bool {
        self.state().power_failed
    }

    pub fn set_power_failed(&self, failed: bool) {
        self.state().power_failed = failed;
    }

    /// Latched by a limit switch fault until the next clean limit reading
    pub fn has_fault(&self) -> bool {
        self.state().fault
    }

    pub fn set_fault(&self, fault: bool) {
        self.state().fault = fault;
    }

    pub fn record_error(&self, error: &MechError) {
        self.state().last_error = error.to_string();
    }

    pub fn clear_error(&self) {
        self.state().last_error.clear();
    }

    /// Convert a raw controller position into physical units
    pub fn to_physical(&self, raw: f64) -> f64 {
        raw * self.conversion_factor
    }

    /// Convert a physical position into raw controller units
    pub fn to_raw(&self, physical: f64) -> f64 {
        physical / self.conversion_factor
    }

    /// Copy out the current record
    pub fn snapshot(&self) -> DeviceRecord {
        let state = self.state();
        DeviceRecord {
            id: self.id,
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            busy: self.is_busy(),
            locked: state.locked,
            position: state.position,
            conversion_factor: self.conversion_factor,
            min_pos: self.min_pos,
            max_pos: self.max_pos,
            timeout_seconds: self.timeout.as_secs(),
            last_error: state.last_error.clone(),
            power_failed: state.power_failed,
            fault: state.fault,
        }
    }

    /// Install a line transport, replacing any existing one
    #[cfg(test)]
    pub async fn attach_line(&self, transport: Box<dyn LineTransport>) {
        *self.line.lock().await = Some(transport);
    }

    /// Install a register transport, replacing any existing one
    #[cfg(test)]
    pub async fn attach_fieldbus(&self, transport: Box<dyn RegisterTransport>) {
        *self.fieldbus.lock().await = Some(transport);
    }

    /// Drop any open transport; the next operation reconnects
    pub async fn close(&self) {
        let line = self.line.lock().await.take();
        let fieldbus = self.fieldbus.lock().await.take();
        if line.is_some() || fieldbus.is_some() {
            debug!(device = %self.name, "transport closed");
        }
    }
}
