//! Register Transports
//!
//! A fieldbus module is a bank of 16-bit registers addressed by unit id. Modules are
//! reached over Modbus TCP, or emulated in memory with the `sim` endpoint.

use super::modbus::ModbusTcpLink;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Register-level access to one fieldbus module
#[async_trait]
pub trait RegisterTransport: Send {
    /// Read `count` consecutive registers starting at `base`
    async fn read_registers(&mut self, unit: u8, base: u16, count: u16) -> io::Result<Vec<u16>>;

    /// Write `values` to consecutive registers starting at `base`
    async fn write_registers(&mut self, unit: u8, base: u16, values: &[u16]) -> io::Result<()>;

    /// Human readable description for logs
    fn describe(&self) -> String;

    /// Whether a failed transfer drops the link so the next transfer reconnects
    ///
    /// In-process transports keep their state instead.
    fn reconnect_on_error(&self) -> bool {
        true
    }
}

/// Open the transport named by a register device endpoint
///
/// # Arguments
/// * `endpoint` - `sim`, `modbus://host:port` or `host:port`
/// * `timeout` - Connect and per-request timeout
pub async fn open(endpoint: &str, timeout: Duration) -> Result<Box<dyn RegisterTransport>> {
    if endpoint.eq_ignore_ascii_case("sim") {
        return Ok(Box::new(MemoryRegisterBank::new()));
    }
    let address = endpoint
        .strip_prefix("modbus://")
        .or_else(|| endpoint.strip_prefix("tcp://"))
        .unwrap_or(endpoint);
    Ok(Box::new(ModbusTcpLink::connect(address, timeout).await?))
}

#[derive(Debug, Default)]
struct BankState {
    registers: HashMap<(u8, u16), u16>,
    offline: bool,
    transfers: usize,
    latency: Duration,
}

/// Shared view of a memory bank, kept by tests after the bank is boxed
#[derive(Clone, Default)]
pub struct BankHandle {
    state: Arc<Mutex<BankState>>,
}

impl BankHandle {
    fn state(&self) -> MutexGuard<'_, BankState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, unit: u8, register: u16) -> u16 {
        self.state()
            .registers
            .get(&(unit, register))
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&self, unit: u8, register: u16, value: u16) {
        self.state().registers.insert((unit, register), value);
    }

    /// Make every transfer fail as if the module were unplugged
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Delay applied to every transfer
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Number of transfers served
    pub fn transfers(&self) -> usize {
        self.state().transfers
    }
}

/// In-memory register bank; unwritten registers read as zero
#[derive(Default)]
pub struct MemoryRegisterBank {
    handle: BankHandle,
}

impl MemoryRegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handle(handle: BankHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> BankHandle {
        self.handle.clone()
    }

    async fn respond(&self) {
        let latency = self.handle.state().latency;
        if !latency.is_zero() {
            async_std::task::sleep(latency).await;
        }
    }

    fn online(&self) -> io::Result<MutexGuard<'_, BankState>> {
        let mut state = self.handle.state();
        if state.offline {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "module offline",
            ));
        }
        state.transfers += 1;
        Ok(state)
    }
}

#[async_trait]
impl RegisterTransport for MemoryRegisterBank {
    async fn read_registers(&mut self, unit: u8, base: u16, count: u16) -> io::Result<Vec<u16>> {
        self.respond().await;
        let state = self.online()?;
        Ok((0..count)
            .map(|offset| {
                let register = base.wrapping_add(offset);
                state
                    .registers
                    .get(&(unit, register))
                    .copied()
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn write_registers(&mut self, unit: u8, base: u16, values: &[u16]) -> io::Result<()> {
        self.respond().await;
        let mut state = self.online()?;
        for (offset, value) in values.iter().enumerate() {
            let register = base.wrapping_add(offset as u16);
            state.registers.insert((unit, register), *value);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "sim".to_string()
    }

    fn reconnect_on_error(&self) -> bool {
        false
    }
}
