//! Modbus TCP Framing
//!
//! Just the two function codes the register client needs: read holding registers and
//! write multiple registers, each wrapped in an MBAP header.

use super::transport::RegisterTransport;
use async_std::io::prelude::*;
use async_std::net::TcpStream;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tracing::{debug, info};

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Largest register count a single read may request
pub const MAX_READ_COUNT: u16 = 125;
/// Largest register count a single write may carry
pub const MAX_WRITE_COUNT: u16 = 123;

const MBAP_HEADER_LEN: usize = 7;
const PROTOCOL_ID: u16 = 0;
const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of the unit id plus the PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    fn decode(mut raw: &[u8]) -> io::Result<Self> {
        if raw.len() < MBAP_HEADER_LEN {
            return Err(invalid("short MBAP header"));
        }
        Ok(Self {
            transaction_id: raw.get_u16(),
            protocol_id: raw.get_u16(),
            length: raw.get_u16(),
            unit_id: raw.get_u8(),
        })
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    buf.put_u16(transaction_id);
    buf.put_u16(PROTOCOL_ID);
    buf.put_u16(pdu.len() as u16 + 1);
    buf.put_u8(unit_id);
    buf.put_slice(pdu);
    buf.freeze()
}

/// Encode a read holding registers request
pub fn encode_read_request(transaction_id: u16, unit_id: u8, base: u16, count: u16) -> Bytes {
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(READ_HOLDING_REGISTERS);
    pdu.put_u16(base);
    pdu.put_u16(count);
    frame(transaction_id, unit_id, &pdu)
}

/// Encode a write multiple registers request
pub fn encode_write_request(transaction_id: u16, unit_id: u8, base: u16, values: &[u16]) -> Bytes {
    let mut pdu = BytesMut::with_capacity(6 + values.len() * 2);
    pdu.put_u8(WRITE_MULTIPLE_REGISTERS);
    pdu.put_u16(base);
    pdu.put_u16(values.len() as u16);
    pdu.put_u8((values.len() * 2) as u8);
    for value in values {
        pdu.put_u16(*value);
    }
    frame(transaction_id, unit_id, &pdu)
}

/// Validate a response frame and return the PDU bytes following the function code
///
/// # Arguments
/// * `transaction_id` - Id of the request being answered
/// * `unit_id` - Unit the request was addressed to
/// * `function` - Function code of the request
/// * `raw` - Complete response frame, header included
pub fn decode_response(
    transaction_id: u16,
    unit_id: u8,
    function: u8,
    raw: &[u8],
) -> io::Result<Bytes> {
    let header = MbapHeader::decode(raw)?;
    if header.transaction_id != transaction_id {
        return Err(invalid(format!(
            "transaction {} answered as {}",
            transaction_id, header.transaction_id
        )));
    }
    if header.protocol_id != PROTOCOL_ID || header.unit_id != unit_id {
        return Err(invalid("unexpected protocol or unit id"));
    }

    let mut pdu = &raw[MBAP_HEADER_LEN..];
    if pdu.len() + 1 != header.length as usize || pdu.is_empty() {
        return Err(invalid("frame length mismatch"));
    }

    let code = pdu.get_u8();
    if code == function | EXCEPTION_FLAG {
        let exception = pdu.first().copied().unwrap_or_default();
        return Err(io::Error::other(format!(
            "exception 0x{:02X} for function 0x{:02X}",
            exception, function
        )));
    }
    if code != function {
        return Err(invalid(format!("unexpected function 0x{:02X}", code)));
    }
    Ok(Bytes::copy_from_slice(pdu))
}

/// Register values from a read holding registers response body
pub fn decode_registers(mut body: Bytes, count: u16) -> io::Result<Vec<u16>> {
    if body.is_empty() {
        return Err(invalid("empty read response"));
    }
    let byte_count = body.get_u8() as usize;
    if byte_count != count as usize * 2 || body.remaining() != byte_count {
        return Err(invalid(format!(
            "expected {} registers, got {} bytes",
            count, byte_count
        )));
    }
    Ok((0..count).map(|_| body.get_u16()).collect())
}

/// Register module reached over Modbus TCP
pub struct ModbusTcpLink {
    address: String,
    stream: TcpStream,
    timeout: Duration,
    next_transaction_id: u16,
}

impl ModbusTcpLink {
    pub async fn connect(address: &str, timeout: Duration) -> io::Result<Self> {
        let stream = async_std::io::timeout(timeout, TcpStream::connect(address)).await?;
        stream.set_nodelay(true)?;
        info!("Connected fieldbus transport to {}", address);
        Ok(Self {
            address: address.to_string(),
            stream,
            timeout,
            next_transaction_id: 1,
        })
    }

    fn transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    async fn round_trip(
        &mut self,
        request: Bytes,
        transaction_id: u16,
        unit_id: u8,
        function: u8,
    ) -> io::Result<Bytes> {
        let stream = &mut self.stream;
        let raw = async_std::io::timeout(self.timeout, async {
            stream.write_all(&request).await?;
            let mut header = [0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let length = MbapHeader::decode(&header)?.length as usize;
            if length == 0 {
                return Err(invalid("zero MBAP length"));
            }
            let mut raw = header.to_vec();
            raw.resize(MBAP_HEADER_LEN + length - 1, 0);
            stream.read_exact(&mut raw[MBAP_HEADER_LEN..]).await?;
            Ok(raw)
        })
        .await?;
        debug!(
            address = %self.address,
            transaction_id,
            "fieldbus round trip, {} bytes",
            raw.len()
        );
        decode_response(transaction_id, unit_id, function, &raw)
    }
}

#[async_trait]
impl RegisterTransport for ModbusTcpLink {
    async fn read_registers(&mut self, unit: u8, base: u16, count: u16) -> io::Result<Vec<u16>> {
        let transaction_id = self.transaction_id();
        let request = encode_read_request(transaction_id, unit, base, count);
        let body = self
            .round_trip(request, transaction_id, unit, READ_HOLDING_REGISTERS)
            .await?;
        decode_registers(body, count)
    }

    async fn write_registers(&mut self, unit: u8, base: u16, values: &[u16]) -> io::Result<()> {
        let transaction_id = self.transaction_id();
        let request = encode_write_request(transaction_id, unit, base, values);
        let mut body = self
            .round_trip(request, transaction_id, unit, WRITE_MULTIPLE_REGISTERS)
            .await?;
        if body.remaining() < 4 {
            return Err(invalid("short write response"));
        }
        let (echo_base, echo_count) = (body.get_u16(), body.get_u16());
        if echo_base != base || echo_count as usize != values.len() {
            return Err(invalid("write response does not match request"));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("modbus://{}", self.address)
    }
}
