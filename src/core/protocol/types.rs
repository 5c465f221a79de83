// src/core/protocol/types.rs

//! Primitive read/write helpers for the native protocol wire format.
//!
//! All notations from the protocol specification are covered here:
//! `[int]`, `[long]`, `[short]`, `[byte]`, `[string]`, `[long string]`,
//! `[bytes]`, `[short bytes]`, `[string list]`, `[string map]`,
//! `[string multimap]`, `[uuid]`, `[inet]` and `[consistency]`. The helpers
//! are purely functional over byte buffers; truncated input is a protocol
//! error because they only run on fully received frame bodies.

use crate::core::DriverError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use uuid::Uuid;

fn ensure(buf: &Bytes, n: usize) -> Result<(), DriverError> {
    if buf.remaining() < n {
        return Err(DriverError::ProtocolError(format!(
            "truncated frame body: need {n} more byte(s), have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn read_byte(buf: &mut Bytes) -> Result<u8, DriverError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_short(buf: &mut Bytes) -> Result<u16, DriverError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn read_int(buf: &mut Bytes) -> Result<i32, DriverError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn read_long(buf: &mut Bytes) -> Result<i64, DriverError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub fn write_byte(buf: &mut BytesMut, v: u8) {
    buf.put_u8(v);
}

pub fn write_short(buf: &mut BytesMut, v: u16) {
    buf.put_u16(v);
}

pub fn write_int(buf: &mut BytesMut, v: i32) {
    buf.put_i32(v);
}

pub fn write_long(buf: &mut BytesMut, v: i64) {
    buf.put_i64(v);
}

/// `[string]`: a UTF-8 string prefixed by its length as a `[short]`.
pub fn read_string(buf: &mut Bytes) -> Result<String, DriverError> {
    let len = read_short(buf)? as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    Ok(std::str::from_utf8(&raw)?.to_string())
}

pub fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

/// `[long string]`: a UTF-8 string prefixed by its length as an `[int]`.
pub fn read_long_string(buf: &mut Bytes) -> Result<String, DriverError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Err(DriverError::ProtocolError(
            "negative long string length".into(),
        ));
    }
    let len = len as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    Ok(std::str::from_utf8(&raw)?.to_string())
}

pub fn write_long_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

/// `[bytes]`: a blob prefixed by its length as an `[int]`; a negative length
/// denotes a null value.
pub fn read_bytes(buf: &mut Bytes) -> Result<Option<Bytes>, DriverError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    ensure(buf, len)?;
    Ok(Some(buf.split_to(len)))
}

pub fn write_bytes(buf: &mut BytesMut, v: Option<&[u8]>) {
    match v {
        Some(b) => {
            buf.put_i32(b.len() as i32);
            buf.extend_from_slice(b);
        }
        None => buf.put_i32(-1),
    }
}

/// `[short bytes]`: a blob prefixed by its length as a `[short]`.
pub fn read_short_bytes(buf: &mut Bytes) -> Result<Bytes, DriverError> {
    let len = read_short(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

pub fn write_short_bytes(buf: &mut BytesMut, v: &[u8]) {
    buf.put_u16(v.len() as u16);
    buf.extend_from_slice(v);
}

/// `[string list]`: a `[short]` count followed by that many `[string]`s.
pub fn read_string_list(buf: &mut Bytes) -> Result<Vec<String>, DriverError> {
    let n = read_short(buf)? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_string(buf)?);
    }
    Ok(out)
}

pub fn write_string_list(buf: &mut BytesMut, items: &[String]) {
    buf.put_u16(items.len() as u16);
    for s in items {
        write_string(buf, s);
    }
}

/// `[string map]`: a `[short]` count of `[string]` key/value pairs.
pub fn read_string_map(buf: &mut Bytes) -> Result<HashMap<String, String>, DriverError> {
    let n = read_short(buf)? as usize;
    let mut out = HashMap::with_capacity(n);
    for _ in 0..n {
        let k = read_string(buf)?;
        let v = read_string(buf)?;
        out.insert(k, v);
    }
    Ok(out)
}

pub fn write_string_map(buf: &mut BytesMut, map: &[(String, String)]) {
    buf.put_u16(map.len() as u16);
    for (k, v) in map {
        write_string(buf, k);
        write_string(buf, v);
    }
}

/// `[string multimap]`: a `[short]` count of `[string]` → `[string list]` pairs.
pub fn read_string_multimap(buf: &mut Bytes) -> Result<HashMap<String, Vec<String>>, DriverError> {
    let n = read_short(buf)? as usize;
    let mut out = HashMap::with_capacity(n);
    for _ in 0..n {
        let k = read_string(buf)?;
        let v = read_string_list(buf)?;
        out.insert(k, v);
    }
    Ok(out)
}

/// `[uuid]`: 16 raw bytes.
pub fn read_uuid(buf: &mut Bytes) -> Result<Uuid, DriverError> {
    ensure(buf, 16)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

pub fn write_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.extend_from_slice(id.as_bytes());
}

/// `[inet]`: one address-size byte (4 or 16), the raw address, and a port `[int]`.
pub fn read_inet(buf: &mut Bytes) -> Result<SocketAddr, DriverError> {
    let size = read_byte(buf)? as usize;
    let ip = match size {
        4 => {
            ensure(buf, 4)?;
            let mut raw = [0u8; 4];
            buf.copy_to_slice(&mut raw);
            IpAddr::V4(Ipv4Addr::from(raw))
        }
        16 => {
            ensure(buf, 16)?;
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            IpAddr::V6(Ipv6Addr::from(raw))
        }
        other => {
            return Err(DriverError::ProtocolError(format!(
                "invalid inet address size {other}"
            )));
        }
    };
    let port = read_int(buf)?;
    Ok(SocketAddr::new(ip, port as u16))
}

/// `[inetaddr]`: address without a port, as used by EVENT bodies' peer columns.
pub fn read_inetaddr(buf: &mut Bytes) -> Result<IpAddr, DriverError> {
    let size = read_byte(buf)? as usize;
    match size {
        4 => {
            ensure(buf, 4)?;
            let mut raw = [0u8; 4];
            buf.copy_to_slice(&mut raw);
            Ok(IpAddr::V4(Ipv4Addr::from(raw)))
        }
        16 => {
            ensure(buf, 16)?;
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            Ok(IpAddr::V6(Ipv6Addr::from(raw)))
        }
        other => Err(DriverError::ProtocolError(format!(
            "invalid inet address size {other}"
        ))),
    }
}

pub fn write_inet(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(16);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.put_i32(addr.port() as i32);
}

/// The consistency levels of the native protocol, encoded as a `[short]`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    #[default]
    LocalOne = 0x000A,
}

impl Consistency {
    pub fn from_code(code: u16) -> Result<Self, DriverError> {
        Ok(match code {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000A => Consistency::LocalOne,
            other => {
                return Err(DriverError::ProtocolError(format!(
                    "unknown consistency code {other:#06x}"
                )));
            }
        })
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Serial consistencies are only valid in the serial slot of a request.
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::Serial => "SERIAL",
            Consistency::LocalSerial => "LOCAL_SERIAL",
            Consistency::LocalOne => "LOCAL_ONE",
        };
        write!(f, "{name}")
    }
}

pub fn read_consistency(buf: &mut Bytes) -> Result<Consistency, DriverError> {
    Consistency::from_code(read_short(buf)?)
}

pub fn write_consistency(buf: &mut BytesMut, c: Consistency) {
    buf.put_u16(c.code());
}
