// src/core/protocol/frame.rs

//! Implements the native protocol frame structure and the corresponding
//! `Encoder` and `Decoder` for network communication.
//!
//! A frame is a 9-byte header (`version`, `flags`, `stream id`, `opcode`,
//! `body length`) followed by the body. The version byte carries a direction
//! bit: requests clear it, responses set it. The codec is purely functional
//! over a byte buffer and never blocks; incomplete input yields `Ok(None)`
//! so the `Framed` stream can wait for more data.

use crate::core::DriverError;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed frame header for protocol v3 and later.
pub const HEADER_LEN: usize = 9;

/// Response frames set the high bit of the version byte.
const DIRECTION_RESPONSE: u8 = 0x80;

/// Default cap on a declared body length. Exceeding it is a fatal protocol
/// error rather than an allocation attempt.
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

bitflags! {
    /// Header flags of a single frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const COMPRESSION    = 0x01;
        const TRACING        = 0x02;
        const CUSTOM_PAYLOAD = 0x04;
        const WARNING        = 0x08;
        const USE_BETA       = 0x10;
    }
}

/// The protocol versions this driver speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V3,
    V4,
    V5,
}

impl ProtocolVersion {
    pub const LATEST: ProtocolVersion = ProtocolVersion::V5;

    pub fn from_byte(raw: u8) -> Result<Self, DriverError> {
        match raw & !DIRECTION_RESPONSE {
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            5 => Ok(ProtocolVersion::V5),
            other => Err(DriverError::ProtocolError(format!(
                "unsupported protocol version {other}"
            ))),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            ProtocolVersion::V3 => 3,
            ProtocolVersion::V4 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    /// Number of stream ids a single connection can multiplex.
    pub fn stream_id_capacity(&self) -> usize {
        match self {
            ProtocolVersion::V3 | ProtocolVersion::V4 => 128,
            ProtocolVersion::V5 => 32_768,
        }
    }

    /// The next lower version to fall back to when STARTUP negotiation fails.
    pub fn downgrade(&self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V5 => Some(ProtocolVersion::V4),
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => None,
        }
    }

    /// Uses the CRC-framed segment layer after STARTUP completes.
    pub fn uses_modern_framing(&self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}

/// The message opcodes of the native protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn from_byte(raw: u8) -> Result<Self, DriverError> {
        Ok(match raw {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => {
                return Err(DriverError::ProtocolError(format!(
                    "unknown opcode {other:#04x}"
                )));
            }
        })
    }
}

/// The body compression algorithms negotiated in STARTUP.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Snappy,
}

impl Compression {
    /// The name advertised in the STARTUP option map, if any.
    pub fn startup_name(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Lz4 => Some("lz4"),
            Compression::Snappy => Some("snappy"),
        }
    }

    fn compress(&self, body: &[u8]) -> Result<Vec<u8>, DriverError> {
        match self {
            Compression::None => Ok(body.to_vec()),
            Compression::Lz4 => {
                // The native protocol prefixes the LZ4 block with the
                // uncompressed length as a big-endian [int].
                let mut out = Vec::with_capacity(4 + body.len());
                out.extend_from_slice(&(body.len() as i32).to_be_bytes());
                out.extend_from_slice(&lz4_flex::block::compress(body));
                Ok(out)
            }
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(body)
                .map_err(|e| DriverError::ProtocolError(format!("snappy compression: {e}"))),
        }
    }

    fn decompress(&self, body: &[u8], max_len: usize) -> Result<Vec<u8>, DriverError> {
        match self {
            Compression::None => Ok(body.to_vec()),
            Compression::Lz4 => {
                if body.len() < 4 {
                    return Err(DriverError::ProtocolError(
                        "LZ4 body shorter than its length prefix".into(),
                    ));
                }
                let uncompressed_len =
                    i32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
                if uncompressed_len > max_len {
                    return Err(DriverError::ProtocolError(format!(
                        "LZ4 uncompressed length {uncompressed_len} exceeds cap {max_len}"
                    )));
                }
                lz4_flex::block::decompress(&body[4..], uncompressed_len)
                    .map_err(|e| DriverError::ProtocolError(format!("LZ4 decompression: {e}")))
            }
            Compression::Snappy => {
                let len = snap::raw::decompress_len(body)
                    .map_err(|e| DriverError::ProtocolError(format!("snappy decompression: {e}")))?;
                if len > max_len {
                    return Err(DriverError::ProtocolError(format!(
                        "snappy uncompressed length {len} exceeds cap {max_len}"
                    )));
                }
                snap::raw::Decoder::new()
                    .decompress_vec(body)
                    .map_err(|e| DriverError::ProtocolError(format!("snappy decompression: {e}")))
            }
        }
    }
}

/// A single decoded frame: header fields plus the (decompressed) body.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: ProtocolVersion,
    pub flags: FrameFlags,
    pub stream_id: i16,
    pub opcode: Opcode,
    pub body: Bytes,
}

impl Frame {
    pub fn request(version: ProtocolVersion, stream_id: i16, opcode: Opcode, body: Bytes) -> Self {
        Frame {
            version,
            flags: FrameFlags::empty(),
            stream_id,
            opcode,
            body,
        }
    }
}

/// A `tokio_util::codec` implementation for encoding request frames and
/// decoding response frames, with optional body compression.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    version: ProtocolVersion,
    compression: Compression,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(version: ProtocolVersion, compression: Compression, max_frame_len: usize) -> Self {
        Self {
            version,
            compression,
            max_frame_len,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Re-pins the codec after version negotiation settles.
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = DriverError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut flags = item.flags;
        // STARTUP and OPTIONS are never compressed: compression is only in
        // effect once the server has acknowledged it.
        let compressible = self.compression != Compression::None
            && !matches!(item.opcode, Opcode::Startup | Opcode::Options);

        let body: Vec<u8> = if compressible {
            flags |= FrameFlags::COMPRESSION;
            self.compression.compress(&item.body)?
        } else {
            item.body.to_vec()
        };

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u8(item.version.as_byte());
        dst.put_u8(flags.bits());
        dst.put_i16(item.stream_id);
        dst.put_u8(item.opcode as u8);
        dst.put_i32(body.len() as i32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DriverError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let raw_version = src[0];
        if raw_version & DIRECTION_RESPONSE == 0 {
            return Err(DriverError::ProtocolError(
                "received a request frame from the server".into(),
            ));
        }
        // During negotiation the server may answer with its own version byte,
        // so any version this driver knows is accepted here.
        let version = ProtocolVersion::from_byte(raw_version)?;
        let flags = FrameFlags::from_bits_truncate(src[1]);
        let stream_id = i16::from_be_bytes([src[2], src[3]]);
        let opcode = Opcode::from_byte(src[4])?;
        let body_len = i32::from_be_bytes([src[5], src[6], src[7], src[8]]);

        if body_len < 0 {
            return Err(DriverError::ProtocolError("negative body length".into()));
        }
        let body_len = body_len as usize;
        if body_len > self.max_frame_len {
            return Err(DriverError::ProtocolError(format!(
                "declared body length {body_len} exceeds cap {}",
                self.max_frame_len
            )));
        }

        if src.len() < HEADER_LEN + body_len {
            // Reserve once so the transport can read the rest in few syscalls.
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let raw_body = src.split_to(body_len).freeze();

        let body = if flags.contains(FrameFlags::COMPRESSION) {
            Bytes::from(self.compression.decompress(&raw_body, self.max_frame_len)?)
        } else {
            raw_body
        };

        Ok(Some(Frame {
            version,
            flags,
            stream_id,
            opcode,
            body,
        }))
    }
}
