//! Simulated Controller
//!
//! In-process stand-in for a motion controller, selected with `endpoint = "sim"`. It
//! speaks the same dialect as the hardware: CR-terminated commands, an echo of each
//! command, the payload, then a `>` prompt, or `?` when the command is rejected.

use super::transport::LineTransport;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const FIRMWARE_VERSION: &str = "3.009";
const ESCAPE: u8 = 0x1B;

const ERR_UNKNOWN_VARIABLE: u32 = 20;
const ERR_ILLEGAL_DATA: u32 = 24;
const ERR_UNKNOWN_COMMAND: u32 = 60;

#[derive(Debug, Default)]
struct SimState {
    position: i64,
    power_up: bool,
    inputs: u32,
    error_code: u32,
    latency: Duration,
    moving: bool,
    commands: Vec<String>,
    stops: usize,
}

/// Shared view of a simulator, kept by tests and diagnostics after the link is boxed
#[derive(Clone, Default)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn position(&self) -> i64 {
        self.state().position
    }

    pub fn set_position(&self, position: i64) {
        self.state().position = position;
    }

    pub fn set_power_up(&self, flag: bool) {
        self.state().power_up = flag;
    }

    pub fn power_up(&self) -> bool {
        self.state().power_up
    }

    pub fn set_inputs(&self, inputs: u32) {
        self.state().inputs = inputs;
    }

    /// Delay applied before the first byte of every reply
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Every command line received, in order
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn stops(&self) -> usize {
        self.state().stops
    }
}

/// The simulator link
pub struct SimulatedController {
    handle: SimHandle,
    line: Vec<u8>,
    pending: VecDeque<u8>,
    reply_due: bool,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::with_handle(SimHandle::default())
    }

    pub fn with_handle(handle: SimHandle) -> Self {
        Self {
            handle,
            line: Vec::new(),
            pending: VecDeque::new(),
            reply_due: false,
        }
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    fn execute(&mut self, command: &str) {
        let mut state = self.handle.state();
        state.commands.push(command.to_string());

        let mut reply = format!("{}\r\n", command);
        let upper = command.trim().to_ascii_uppercase();
        let outcome: Result<Option<String>, u32> = match upper.split_once(' ') {
            Some(("PR", variable)) => match variable.trim() {
                "P" => Ok(Some(state.position.to_string())),
                "VR" => Ok(Some(FIRMWARE_VERSION.to_string())),
                "ER" => Ok(Some(state.error_code.to_string())),
                "IN" => Ok(Some(state.inputs.to_string())),
                "PU" => Ok(Some(u8::from(state.power_up).to_string())),
                "MV" => Ok(Some(u8::from(state.moving).to_string())),
                _ => Err(ERR_UNKNOWN_VARIABLE),
            },
            Some(("MA", value)) => parse_steps(value).map(|steps| {
                state.position = steps;
                None
            }),
            Some(("MR", value)) => parse_steps(value).map(|steps| {
                state.position += steps;
                None
            }),
            Some(("SL", value)) => parse_steps(value).map(|speed| {
                state.moving = speed != 0;
                None
            }),
            _ => match upper.split_once('=') {
                Some(("P", value)) => parse_steps(value).map(|steps| {
                    state.position = steps;
                    None
                }),
                Some(("PU", value)) => parse_steps(value).map(|flag| {
                    state.power_up = flag != 0;
                    None
                }),
                Some(("ER", _)) => {
                    state.error_code = 0;
                    Ok(None)
                }
                _ => Err(ERR_UNKNOWN_COMMAND),
            },
        };

        match outcome {
            Ok(payload) => {
                if let Some(payload) = payload {
                    reply.push_str(&payload);
                    reply.push_str("\r\n");
                }
                reply.push('>');
            }
            Err(code) => {
                state.error_code = code;
                reply.push('?');
            }
        }

        self.pending.extend(reply.bytes());
        self.reply_due = true;
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_steps(value: &str) -> Result<i64, u32> {
    value.trim().parse::<i64>().map_err(|_| ERR_ILLEGAL_DATA)
}

#[async_trait]
impl LineTransport for SimulatedController {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        for &byte in bytes {
            match byte {
                ESCAPE => {
                    let mut state = self.handle.state();
                    state.moving = false;
                    state.stops += 1;
                }
                b'\r' | b'\n' => {
                    if !self.line.is_empty() {
                        let command = String::from_utf8_lossy(&self.line).to_string();
                        self.line.clear();
                        self.execute(&command);
                    }
                }
                other => self.line.push(other),
            }
        }
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
        if self.pending.is_empty() {
            async_std::task::sleep(wait).await;
            return Ok(0);
        }

        if self.reply_due {
            self.reply_due = false;
            let latency = self.handle.state().latency;
            if !latency.is_zero() {
                async_std::task::sleep(latency).await;
            }
        }

        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn describe(&self) -> String {
        "sim".to_string()
    }

    fn reconnect_on_error(&self) -> bool {
        false
    }
}
