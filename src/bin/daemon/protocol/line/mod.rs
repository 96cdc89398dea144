//! Line Protocol Client
//!
//! Drives motion controllers that speak a CR-terminated ASCII dialect. Every operation
//! claims the device's busy flag first, so a device never sees two requests at once,
//! and every reply goes through [`reply::LineReply`] before reaching the caller.
//!
//! Replies carry an echo of the command followed by the payload and a `>` prompt. A `?`
//! sentinel means the command was rejected; the client then asks for the numeric error
//! code with `PR ER` while still holding the device.

pub mod codes;
pub mod reply;
pub mod sim;
pub mod transport;

use crate::config::DeviceKind;
use crate::device::{Device, DeviceRegistry};
use crate::error::{MechError, Result};
use async_std::sync::MutexGuard;
use reply::LineReply;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use transport::LineTransport;

/// Commands starting with this character skip the power and fault checks
pub const RAW_PREFIX: char = '!';

const ESCAPE: u8 = 0x1B;
const TERMINATOR: &str = "\r";
const READ_CHUNK: usize = 256;
const MAX_REPLY_BYTES: usize = 4096;
const STOP_DRAIN: Duration = Duration::from_millis(50);

const POSITION_QUERY: &str = "PR P";
const ERROR_QUERY: &str = "PR ER";
const INPUTS_QUERY: &str = "PR IN";
const POWER_QUERY: &str = "PR PU";
const VERSION_QUERY: &str = "PR VR";
const CLEAR_POWER_FLAG: &str = "PU=0";

/// Commands that start motion and therefore need the lock, power and fault checks
const MOTION_COMMANDS: &[&str] = &["MA", "MR", "SL", "HM"];

/// Limit switch reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitState {
    Clear,
    Lower,
    Upper,
}

/// Exclusive access to one device's transport
///
/// Holding a `Link` means holding the transport mutex; the transport is opened lazily and
/// discarded after an I/O failure so the next operation reconnects.
struct Link<'a> {
    device: &'a Device,
    slot: MutexGuard<'a, Option<Box<dyn LineTransport>>>,
}

impl<'a> Link<'a> {
    async fn acquire(device: &'a Device) -> Link<'a> {
        Link {
            device,
            slot: device.line.lock().await,
        }
    }

    async fn transport(&mut self) -> Result<&mut (dyn LineTransport + 'static)> {
        if self.slot.is_none() {
            match transport::open(self.device.endpoint(), self.device.timeout()).await {
                Ok(opened) => {
                    debug!(device = %self.device.name(), "Opened {}", opened.describe());
                    *self.slot = Some(opened);
                }
                Err(e) => {
                    warn!(device = %self.device.name(), "Cannot open transport: {}", e);
                    return Err(self.timeout("cannot write"));
                }
            }
        }
        self.slot
            .as_deref_mut()
            .ok_or_else(|| MechError::NotFound(format!("{} transport", self.device.name())))
    }

    fn discard(&mut self) {
        if let Some(link) = self.slot.as_deref() {
            if !link.reconnect_on_error() {
                return;
            }
            debug!(device = %self.device.name(), "Dropping {}", link.describe());
        }
        *self.slot = None;
    }

    fn timeout(&self, stage: &'static str) -> MechError {
        MechError::TransportTimeout {
            device: self.device.name().to_string(),
            stage,
        }
    }

    async fn write(&mut self, bytes: &[u8], wait: Duration) -> Result<()> {
        let transport = self.transport().await?;
        if let Err(e) = async_std::io::timeout(wait, transport.write_all(bytes)).await {
            warn!(device = %self.device.name(), "Write failed: {}", e);
            self.discard();
            return Err(self.timeout("cannot write"));
        }
        Ok(())
    }

    /// Collect reply bytes until the prompt or sentinel arrives or `wait` elapses
    async fn read_reply(&mut self, wait: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + wait;
        let mut raw = Vec::with_capacity(64);
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let transport = self.transport().await?;
            match transport.read_some(&mut buf, remaining).await {
                Ok(0) => continue,
                Ok(n) => {
                    raw.extend_from_slice(&buf[..n]);
                    if reply::is_complete(&raw) || raw.len() >= MAX_REPLY_BYTES {
                        break;
                    }
                }
                Err(e) => {
                    warn!(device = %self.device.name(), "Read failed: {}", e);
                    self.discard();
                    return Err(self.timeout("cannot read"));
                }
            }
        }

        if raw.is_empty() {
            warn!(device = %self.device.name(), "No reply within {:?}", wait);
            return Err(self.timeout("cannot read"));
        }
        if !reply::is_complete(&raw) {
            debug!(
                device = %self.device.name(),
                reply = %String::from_utf8_lossy(&raw),
                "Incomplete reply at deadline"
            );
        }
        Ok(raw)
    }

    async fn exchange_raw(&mut self, command: &str, wait: Duration) -> Result<Vec<u8>> {
        self.write(format!("{}{}", command, TERMINATOR).as_bytes(), wait)
            .await?;
        self.read_reply(wait).await
    }

    async fn exchange(&mut self, command: &str, wait: Duration) -> Result<LineReply> {
        let raw = self.exchange_raw(command, wait).await?;
        let reply = LineReply::parse(command, &raw);
        debug!(device = %self.device.name(), command, ?reply, "exchange");
        Ok(reply)
    }

    /// One command, resolving a rejection into its error code
    async fn transact(&mut self, command: &str, wait: Duration) -> Result<String> {
        match self.exchange(command, wait).await? {
            LineReply::Payload(payload) => Ok(payload),
            LineReply::Rejected(fragment) => {
                let fragment = if fragment.is_empty() {
                    command.to_string()
                } else {
                    fragment
                };
                let code = match self.exchange(ERROR_QUERY, wait).await? {
                    LineReply::Payload(code) => code.trim().parse::<u32>().map_err(|_| {
                        MechError::ParseError(format!("error code '{}'", code))
                    })?,
                    LineReply::Rejected(_) => 0,
                };
                let device = self.device.name().to_string();
                if code == 0 {
                    Err(MechError::CommandRejected { device, fragment })
                } else {
                    Err(MechError::DeviceReported {
                        device,
                        code,
                        message: codes::describe_error(code),
                    })
                }
            }
        }
    }

    /// Discard whatever the controller prints within `wait`
    async fn drain(&mut self, wait: Duration) {
        let mut buf = [0u8; READ_CHUNK];
        if let Ok(transport) = self.transport().await {
            match transport.read_some(&mut buf, wait).await {
                Ok(n) if n > 0 => debug!(device = %self.device.name(), "Drained {} bytes", n),
                _ => {}
            }
        }
    }
}

/// Split the raw-mode prefix off a command
fn split_raw_prefix(command: &str) -> (bool, &str) {
    let trimmed = command.trim();
    match trimmed.strip_prefix(RAW_PREFIX) {
        Some(rest) => (true, rest.trim()),
        None => (false, trimmed),
    }
}

fn is_motion(command: &str) -> bool {
    let verb = command
        .split([' ', '='])
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    MOTION_COMMANDS.contains(&verb.as_str())
}

/// Operator lock-out applies to motion whatever the prefix
fn check_lock(device: &Device, command: &str) -> Result<()> {
    if is_motion(command) && device.is_locked() {
        return Err(MechError::LockedOut {
            device: device.name().to_string(),
        });
    }
    Ok(())
}

/// Parameters of a multi-parameter `PR a,b,c` request, or `None` for anything else
fn print_parameters(command: &str) -> Option<Vec<String>> {
    let (verb, rest) = command.trim().split_once(' ')?;
    if !verb.eq_ignore_ascii_case("PR") || !rest.contains(',') {
        return None;
    }
    Some(
        rest.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
    )
}

/// Flatten raw reply bytes into one line without terminators
fn flatten(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Interpret a status payload as a bit pattern, least significant bit first
///
/// # Arguments
/// * `payload` - Decimal value printed by the controller
/// * `width` - Number of bits to return (at most 32)
pub fn decode_bits_base2(payload: &str, width: usize) -> Result<Vec<bool>> {
    let value: u32 = payload
        .trim()
        .parse()
        .map_err(|_| MechError::ParseError(format!("status bits '{}'", payload.trim())))?;
    Ok((0..width.min(32)).map(|bit| value & (1 << bit) != 0).collect())
}

/// Request/response driver for line protocol devices
#[derive(Clone)]
pub struct LineClient {
    registry: Arc<DeviceRegistry>,
}

impl LineClient {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    fn device(&self, id: u32) -> Result<Arc<Device>> {
        let device = self.registry.get(id)?;
        device.expect_kind(DeviceKind::Line)?;
        Ok(device)
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

    /// Send one command and return the payload of its reply
    ///
    /// Motion commands are always refused on a locked device. Without the raw-mode prefix
    /// they are also refused while a limit fault is latched or the power failure flag is
    /// set.
    ///
    /// # Arguments
    /// * `id` - Device id
    /// * `command` - Command text without terminator
    ///
    /// # Returns
    /// * `Result<String>` - The payload with echo and terminators removed
    pub async fn send(&self, id: u32, command: &str) -> Result<String> {
        let device = self.device(id)?;
        let (raw_mode, command) = split_raw_prefix(command);
        let _busy = device.try_begin()?;
        let mut link = Link::acquire(&device).await;

        let result: Result<String> = async {
            check_lock(&device, command)?;
            if !raw_mode {
                Self::precheck(&device, &mut link, command).await?;
            }
            link.transact(command, device.timeout()).await
        }
        .await;

        Self::note(&device, &result);
        result
    }

    async fn precheck(device: &Device, link: &mut Link<'_>, command: &str) -> Result<()> {
        if !is_motion(command) {
            return Ok(());
        }
        if device.has_fault() {
            return Err(MechError::FaultBitCombination {
                device: device.name().to_string(),
            });
        }
        let flag = link.transact(POWER_QUERY, device.timeout()).await?;
        let failed = flag.trim() == "1";
        device.set_power_failed(failed);
        if failed {
            return Err(MechError::PowerFailureFlag {
                device: device.name().to_string(),
            });
        }
        Ok(())
    }

    /// Liveness check with the short liveness timeout
    pub async fn query(&self, id: u32) -> Result<String> {
        let device = self.device(id)?;
        let _busy = device.try_begin()?;
        let mut link = Link::acquire(&device).await;
        let result = link.transact(VERSION_QUERY, device.liveness_timeout()).await;
        Self::note(&device, &result);
        result
    }

    /// Whether an operation is in flight; never talks to the hardware
    pub fn is_busy(&self, id: u32) -> Result<bool> {
        Ok(self.registry.get(id)?.is_busy())
    }

    /// Interrupt motion with the escape byte
    ///
    /// Waits for any in-flight exchange to finish instead of failing with `BusyConflict`,
    /// and does not wait for a structured reply.
    pub async fn stop_mechanism(&self, id: u32) -> Result<()> {
        let device = self.device(id)?;
        let mut link = Link::acquire(&device).await;
        let result = link.write(&[ESCAPE], device.timeout()).await;
        if result.is_ok() {
            link.drain(STOP_DRAIN).await;
            info!(device = %device.name(), "Stop sent");
        }
        Self::note(&device, &result);
        result
    }

    /// Query the position and store it in the device record
    ///
    /// # Returns
    /// * `Result<f64>` - The raw position
    pub async fn read_position_into_registry(&self, id: u32) -> Result<f64> {
        let device = self.device(id)?;
        let _busy = device.try_begin()?;
        let mut link = Link::acquire(&device).await;
        let result: Result<f64> = async {
            let payload = link.transact(POSITION_QUERY, device.timeout()).await?;
            let raw = payload
                .trim()
                .parse::<f64>()
                .map_err(|_| MechError::ParseError(format!("position '{}'", payload)))?;
            device.set_position(raw);
            Ok(raw)
        }
        .await;
        Self::note(&device, &result);
        result
    }

    /// Read the input bank and interpret the configured limit bits
    pub async fn check_limit_bits(&self, id: u32) -> Result<LimitState> {
        let device = self.device(id)?;
        let _busy = device.try_begin()?;
        let mut link = Link::acquire(&device).await;
        let result: Result<LimitState> = async {
            let payload = link.transact(INPUTS_QUERY, device.timeout()).await?;
            let bits = decode_bits_base2(&payload, 32)?;
            let (lower, upper) = device.limit_bits();
            let asserted = |bit: u8| bits.get(bit as usize).copied().unwrap_or(false);
            let state = match (asserted(lower), asserted(upper)) {
                (true, true) => {
                    device.set_fault(true);
                    return Err(MechError::FaultBitCombination {
                        device: device.name().to_string(),
                    });
                }
                (true, false) => LimitState::Lower,
                (false, true) => LimitState::Upper,
                (false, false) => LimitState::Clear,
            };
            device.set_fault(false);
            Ok(state)
        }
        .await;
        Self::note(&device, &result);
        result
    }

    /// Diagnostic passthrough that skips reply parsing and the power and fault checks
    ///
    /// Motion on a locked device is still refused.
    ///
    /// `PR a,b,c` is sent as one `PR` per parameter and answered as `a=.., b=.., c=..`.
    pub async fn tech_passthrough(&self, id: u32, raw_command: &str) -> Result<String> {
        let device = self.device(id)?;
        let (_, command) = split_raw_prefix(raw_command);
        if command.is_empty() {
            return Err(MechError::InvalidArguments("empty raw command".to_string()));
        }
        check_lock(&device, command)?;
        let _busy = device.try_begin()?;
        let mut link = Link::acquire(&device).await;

        let result: Result<String> = async {
            if let Some(parameters) = print_parameters(command) {
                let mut answers = Vec::with_capacity(parameters.len());
                for parameter in parameters {
                    let value = match link
                        .exchange(&format!("PR {}", parameter), device.timeout())
                        .await?
                    {
                        LineReply::Payload(value) => value,
                        LineReply::Rejected(_) => "?".to_string(),
                    };
                    answers.push(format!("{}={}", parameter, value));
                }
                Ok(answers.join(", "))
            } else {
                let raw = link.exchange_raw(command, device.timeout()).await?;
                Ok(flatten(&raw))
            }
        }
        .await;
        Self::note(&device, &result);
        result
    }

    /// Clear the power failure flag and restore the last known position
    ///
    /// The controller is told where it is rather than homed again.
    pub async fn clear_power_failure(&self, id: u32) -> Result<()> {
        let device = self.device(id)?;
        let _busy = device.try_begin()?;
        let mut link = Link::acquire(&device).await;
        let result: Result<()> = async {
            link.transact(CLEAR_POWER_FLAG, device.timeout()).await?;
            let restore = format!("P={}", device.position().round() as i64);
            link.transact(&restore, device.timeout()).await?;
            device.set_power_failed(false);
            info!(device = %device.name(), "Power failure cleared, {}", restore);
            Ok(())
        }
        .await;
        Self::note(&device, &result);
        result
    }

    /// Move to a position given in physical units
    ///
    /// # Returns
    /// * `Result<f64>` - The commanded raw position
    pub async fn move_absolute(&self, id: u32, physical: f64) -> Result<f64> {
        let device = self.device(id)?;
        let (min, max) = device.range();
        if !physical.is_finite() || physical < min || physical > max {
            return Err(MechError::InvalidArguments(format!(
                "{} outside {} .. {} for {}",
                physical,
                min,
                max,
                device.name()
            )));
        }
        let raw = device.to_raw(physical).round();
        self.send(id, &format!("MA {}", raw as i64)).await?;
        device.set_position(raw);
        Ok(raw)
    }
}
