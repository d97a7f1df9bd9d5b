//! Framed little-endian codec for the primary quote protocol.
//!
//! ```text
//! request  = 0x0C | seq:u32 | cmd:u16 | body_len:u16 | body
//! response = 0xB1 | seq:u32 | cmd:u16 | status:u16 | body_len:u32 | body
//! ```
//!
//! Prices travel as thousandths of a yuan, dates as `YYYYMMDD` integers.
//! Both directions are implemented so tests can stand up a fake server.

use super::provider::{DataError, RawBar};
use crate::domain::Exchange;
use chrono::{Datelike, NaiveDate};
use std::io::{Read, Write};

pub const REQUEST_MAGIC: u8 = 0x0C;
pub const RESPONSE_MAGIC: u8 = 0xB1;
pub const REQUEST_HEADER_LEN: usize = 9;
pub const RESPONSE_HEADER_LEN: usize = 13;

/// Largest response body accepted; anything bigger is a corrupt length field.
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

const BAR_RECORD_LEN: usize = 4 + 4 * 4 + 8 + 8;
const PRICE_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Heartbeat = 0x0004,
    SecurityList = 0x0450,
    DailyBars = 0x052D,
}

impl Command {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0004 => Some(Command::Heartbeat),
            0x0450 => Some(Command::SecurityList),
            0x052D => Some(Command::DailyBars),
            _ => None,
        }
    }
}

/// One row of a security list reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityEntry {
    pub exchange: Exchange,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub seq: u32,
    pub command: u16,
    pub status: u16,
    pub body_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub seq: u32,
    pub command: u16,
    pub body_len: u16,
}

pub fn date_to_wire(date: NaiveDate) -> u32 {
    date.year() as u32 * 10_000 + date.month() * 100 + date.day()
}

pub fn date_from_wire(v: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt((v / 10_000) as i32, (v / 100) % 100, v % 100)
}

fn price_to_wire(p: f64) -> u32 {
    (p * PRICE_SCALE).round().max(0.0) as u32
}

fn price_from_wire(v: u32) -> f64 {
    v as f64 / PRICE_SCALE
}

// ── Framing ──

pub fn encode_request(seq: u32, command: Command, body: &[u8]) -> Result<Vec<u8>, DataError> {
    let body_len = u16::try_from(body.len())
        .map_err(|_| DataError::Other(format!("request body too large: {} bytes", body.len())))?;
    let mut out = Vec::with_capacity(REQUEST_HEADER_LEN + body.len());
    out.push(REQUEST_MAGIC);
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&command.code().to_le_bytes());
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

pub fn encode_response(seq: u32, command: u16, status: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RESPONSE_HEADER_LEN + body.len());
    out.push(RESPONSE_MAGIC);
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&command.to_le_bytes());
    out.extend_from_slice(&status.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

pub fn decode_response_header(buf: &[u8; RESPONSE_HEADER_LEN]) -> Result<ResponseHeader, DataError> {
    if buf[0] != RESPONSE_MAGIC {
        return Err(DataError::Protocol(format!(
            "bad response magic 0x{:02X}",
            buf[0]
        )));
    }
    let header = ResponseHeader {
        seq: u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
        command: u16::from_le_bytes([buf[5], buf[6]]),
        status: u16::from_le_bytes([buf[7], buf[8]]),
        body_len: u32::from_le_bytes([buf[9], buf[10], buf[11], buf[12]]),
    };
    if header.body_len > MAX_BODY_LEN {
        return Err(DataError::Protocol(format!(
            "response body length {} exceeds limit",
            header.body_len
        )));
    }
    Ok(header)
}

pub fn decode_request_header(buf: &[u8; REQUEST_HEADER_LEN]) -> Result<RequestHeader, DataError> {
    if buf[0] != REQUEST_MAGIC {
        return Err(DataError::Protocol(format!(
            "bad request magic 0x{:02X}",
            buf[0]
        )));
    }
    Ok(RequestHeader {
        seq: u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
        command: u16::from_le_bytes([buf[5], buf[6]]),
        body_len: u16::from_le_bytes([buf[7], buf[8]]),
    })
}

/// Send one request frame.
pub fn write_request<W: Write>(
    w: &mut W,
    seq: u32,
    command: Command,
    body: &[u8],
) -> Result<(), DataError> {
    let frame = encode_request(seq, command, body)?;
    w.write_all(&frame).map_err(|e| DataError::from_io(&e))?;
    w.flush().map_err(|e| DataError::from_io(&e))
}

/// Read one response frame and check it answers `(seq, command)`.
///
/// A non-zero status becomes `DataError::Remote` with the body as message;
/// the stream stays in sync in that case.
pub fn read_response<R: Read>(r: &mut R, seq: u32, command: Command) -> Result<Vec<u8>, DataError> {
    let mut head = [0u8; RESPONSE_HEADER_LEN];
    r.read_exact(&mut head).map_err(|e| DataError::from_io(&e))?;
    let header = decode_response_header(&head)?;

    let mut body = vec![0u8; header.body_len as usize];
    r.read_exact(&mut body).map_err(|e| DataError::from_io(&e))?;

    if header.seq != seq {
        return Err(DataError::Protocol(format!(
            "sequence mismatch: expected {seq}, got {}",
            header.seq
        )));
    }
    if header.command != command.code() {
        return Err(DataError::Protocol(format!(
            "command mismatch: expected 0x{:04X}, got 0x{:04X}",
            command.code(),
            header.command
        )));
    }
    if header.status != 0 {
        return Err(DataError::Remote {
            status: header.status,
            message: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(body)
}

// ── Bodies ──

pub fn encode_daily_bars_body(
    exchange: Exchange,
    code: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<u8>, DataError> {
    let code = code_bytes(code)?;
    let mut out = Vec::with_capacity(1 + 6 + 8);
    out.push(exchange.market_id());
    out.extend_from_slice(&code);
    out.extend_from_slice(&date_to_wire(start).to_le_bytes());
    out.extend_from_slice(&date_to_wire(end).to_le_bytes());
    Ok(out)
}

pub fn encode_security_list_body(exchange: Exchange) -> Vec<u8> {
    vec![exchange.market_id()]
}

pub fn decode_daily_bars(body: &[u8]) -> Result<Vec<RawBar>, DataError> {
    let mut cur = Cursor::new(body);
    let count = cur.u16()? as usize;
    let mut bars = Vec::with_capacity(count);
    for _ in 0..count {
        let raw_date = cur.u32()?;
        let date = date_from_wire(raw_date)
            .ok_or_else(|| DataError::Protocol(format!("invalid bar date {raw_date}")))?;
        let open = price_from_wire(cur.u32()?);
        let high = price_from_wire(cur.u32()?);
        let low = price_from_wire(cur.u32()?);
        let close = price_from_wire(cur.u32()?);
        let volume = cur.u64()?;
        let amount = cur.f64()?;
        bars.push(RawBar {
            date,
            open,
            high,
            low,
            close,
            volume,
            amount,
        });
    }
    cur.finish()?;
    Ok(bars)
}

pub fn decode_security_list(body: &[u8]) -> Result<Vec<SecurityEntry>, DataError> {
    let mut cur = Cursor::new(body);
    let count = cur.u16()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let market = cur.u8()?;
        let exchange = Exchange::from_market_id(market)
            .ok_or_else(|| DataError::Protocol(format!("unknown market id {market}")))?;
        let code = String::from_utf8(cur.bytes(6)?.to_vec())
            .map_err(|_| DataError::Protocol("non-ASCII security code".into()))?;
        let name_len = cur.u8()? as usize;
        let name = String::from_utf8_lossy(cur.bytes(name_len)?).into_owned();
        out.push(SecurityEntry {
            exchange,
            code,
            name,
        });
    }
    cur.finish()?;
    Ok(out)
}

pub fn encode_daily_bars_reply(bars: &[RawBar]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + bars.len() * BAR_RECORD_LEN);
    out.extend_from_slice(&(bars.len() as u16).to_le_bytes());
    for b in bars {
        out.extend_from_slice(&date_to_wire(b.date).to_le_bytes());
        for p in [b.open, b.high, b.low, b.close] {
            out.extend_from_slice(&price_to_wire(p).to_le_bytes());
        }
        out.extend_from_slice(&b.volume.to_le_bytes());
        out.extend_from_slice(&b.amount.to_le_bytes());
    }
    out
}

pub fn encode_security_list_reply(entries: &[SecurityEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for e in entries {
        out.push(e.exchange.market_id());
        let mut code = [b'0'; 6];
        for (dst, src) in code.iter_mut().zip(e.code.bytes()) {
            *dst = src;
        }
        out.extend_from_slice(&code);
        let name = e.name.as_bytes();
        let len = name.len().min(u8::MAX as usize);
        out.push(len as u8);
        out.extend_from_slice(&name[..len]);
    }
    out
}

fn code_bytes(code: &str) -> Result<[u8; 6], DataError> {
    let bytes = code.as_bytes();
    if bytes.len() != 6 || !bytes.iter().all(u8::is_ascii_digit) {
        return Err(DataError::Other(format!("invalid security code '{code}'")));
    }
    let mut out = [0u8; 6];
    out.copy_from_slice(bytes);
    Ok(out)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DataError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DataError::Protocol(format!(
                "truncated body: need {end} bytes, have {}",
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DataError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DataError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DataError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DataError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DataError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, DataError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn finish(&self) -> Result<(), DataError> {
        if self.pos != self.buf.len() {
            return Err(DataError::Protocol(format!(
                "{} trailing bytes after records",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
