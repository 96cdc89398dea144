//! Line Transports
//!
//! Byte links to motion controllers: a TCP terminal-server bridge, a local serial port,
//! or the built-in simulator selected with the `sim` endpoint.

use super::sim::SimulatedController;
use crate::error::{MechError, Result};
use async_std::io::prelude::*;
use async_std::net::TcpStream;
use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Default baud rate for `serial:` endpoints without an explicit rate
const DEFAULT_BAUD_RATE: u32 = 9600;

/// A byte link to one controller
#[async_trait]
pub trait LineTransport: Send {
    /// Write every byte or fail
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read what is available, waiting at most `wait`
    ///
    /// Returns `Ok(0)` when nothing arrived within `wait`. A closed link is an error.
    async fn read_some(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize>;

    /// Human readable description for logs
    fn describe(&self) -> String;

    /// Whether a failed exchange drops the link so the next operation reconnects
    ///
    /// In-process transports keep their state instead.
    fn reconnect_on_error(&self) -> bool {
        true
    }
}

/// Open the transport named by a device endpoint
///
/// # Arguments
/// * `endpoint` - `sim`, `serial:/dev/ttyS0[@baud]`, `tcp://host:port` or `host:port`
/// * `timeout` - Connect timeout
pub async fn open(endpoint: &str, timeout: Duration) -> Result<Box<dyn LineTransport>> {
    if endpoint.eq_ignore_ascii_case("sim") {
        return Ok(Box::new(SimulatedController::new()));
    }

    if let Some(port) = endpoint.strip_prefix("serial:") {
        let (path, baud) = match port.split_once('@') {
            Some((path, baud)) => (path, baud.parse::<u32>()?),
            None => (port, DEFAULT_BAUD_RATE),
        };
        return Ok(Box::new(SerialLink::open(path, baud)?));
    }

    let address = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
    Ok(Box::new(TcpLink::connect(address, timeout).await?))
}

/// Controller reached through a TCP-to-serial bridge
pub struct TcpLink {
    address: String,
    stream: TcpStream,
}

impl TcpLink {
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let stream = async_std::io::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|e| {
                MechError::IoError(io::Error::new(e.kind(), format!("{}: {}", address, e)))
            })?;
        stream.set_nodelay(true)?;
        info!("Connected line transport to {}", address);
        Ok(Self {
            address: address.to_string(),
            stream,
        })
    }
}

#[async_trait]
impl LineTransport for TcpLink {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    async fn read_some(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
        match async_std::io::timeout(wait, self.stream.read(buf)).await {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Controller on a local serial port
///
/// `serialport` is blocking, so every call runs on the blocking thread pool.
pub struct SerialLink {
    path: String,
    port: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
}

impl SerialLink {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| MechError::IoError(io::Error::other(format!("{}: {}", path, e))))?;
        info!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Self {
            path: path.to_string(),
            port: Arc::new(Mutex::new(port)),
        })
    }
}

#[async_trait]
impl LineTransport for SerialLink {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port.clone();
        let bytes = bytes.to_vec();
        async_std::task::spawn_blocking(move || {
            let mut port = port
                .lock()
                .map_err(|_| io::Error::other("serial port lock poisoned"))?;
            io::Write::write_all(&mut *port, &bytes)?;
            io::Write::flush(&mut *port)
        })
        .await
    }

    async fn read_some(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
        let port = self.port.clone();
        let capacity = buf.len();
        let chunk = async_std::task::spawn_blocking(move || {
            let mut port = port
                .lock()
                .map_err(|_| io::Error::other("serial port lock poisoned"))?;
            port.set_timeout(wait).map_err(io::Error::other)?;
            let mut chunk = vec![0u8; capacity];
            match io::Read::read(&mut *port, &mut chunk) {
                Ok(n) => {
                    chunk.truncate(n);
                    Ok(chunk)
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })
        .await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.path)
    }
}
