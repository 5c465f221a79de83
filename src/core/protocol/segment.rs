// src/core/protocol/segment.rs

//! The checksummed segment layer of protocol v5.
//!
//! After STARTUP completes on a v5 connection, every exchange is wrapped in
//! segments: a little-endian packed header protected by a CRC-24, followed by
//! the payload and its CRC-32C. A segment carries up to 128 KiB - 1 of
//! payload; a frame larger than that is split across several
//! non-self-contained segments and reassembled by the reader.

use crate::core::DriverError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Algorithm, Crc, CRC_32_ISCSI};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload bytes in one segment (17-bit length field).
pub const MAX_PAYLOAD_LEN: usize = 0x1FFFF;

const UNCOMPRESSED_HEADER_LEN: usize = 3 + 3;
const COMPRESSED_HEADER_LEN: usize = 5 + 3;
const TRAILER_LEN: usize = 4;

/// The CRC-24 the protocol mandates for segment headers.
const CRC24: Algorithm<u32> = Algorithm {
    width: 24,
    poly: 0x1974F0B,
    init: 0x875060,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0x8F65A5,
    residue: 0,
};

/// Initial bytes mixed into the payload CRC-32C ahead of the payload itself.
const CRC32_SEED: [u8; 4] = [0xFA, 0x2D, 0x55, 0xCA];

fn crc24(data: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC24).checksum(data)
}

fn crc32c(data: &[u8]) -> u32 {
    let crc = Crc::<u32>::new(&CRC_32_ISCSI);
    let mut digest = crc.digest();
    digest.update(&CRC32_SEED);
    digest.update(data);
    digest.finalize()
}

/// One segment: a payload slice and whether it holds complete frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub payload: Bytes,
    pub self_contained: bool,
}

/// Splits a buffer of encoded frames into segments: one self-contained
/// segment when it fits, otherwise a run of non-self-contained parts.
pub fn segment_payloads(frames: Bytes) -> Vec<Segment> {
    if frames.len() <= MAX_PAYLOAD_LEN {
        return vec![Segment {
            payload: frames,
            self_contained: true,
        }];
    }
    let mut rest = frames;
    let mut out = Vec::with_capacity(rest.len() / MAX_PAYLOAD_LEN + 1);
    while !rest.is_empty() {
        let take = rest.len().min(MAX_PAYLOAD_LEN);
        out.push(Segment {
            payload: rest.split_to(take),
            self_contained: false,
        });
    }
    out
}

/// A `tokio_util::codec` implementation for the segment layer. Compression,
/// when enabled, is LZ4 raw blocks (the only algorithm v5 defines).
#[derive(Debug, Clone)]
pub struct SegmentCodec {
    compress: bool,
}

impl SegmentCodec {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }
}

impl Encoder<Segment> for SegmentCodec {
    type Error = DriverError;

    fn encode(&mut self, item: Segment, dst: &mut BytesMut) -> Result<(), Self::Error> {
        debug_assert!(item.payload.len() <= MAX_PAYLOAD_LEN);

        if self.compress {
            let compressed = lz4_flex::block::compress(&item.payload);
            // The protocol keeps a payload uncompressed (uncompressed length
            // field 0) when compression does not shrink it.
            let (payload, uncompressed_len) = if compressed.len() >= item.payload.len() {
                (item.payload.clone(), 0usize)
            } else {
                (Bytes::from(compressed), item.payload.len())
            };

            let mut header: u64 = payload.len() as u64;
            header |= (uncompressed_len as u64) << 17;
            if item.self_contained {
                header |= 1 << 34;
            }
            let mut header_bytes = [0u8; 5];
            for (i, b) in header_bytes.iter_mut().enumerate() {
                *b = (header >> (8 * i)) as u8;
            }
            dst.reserve(COMPRESSED_HEADER_LEN + payload.len() + TRAILER_LEN);
            dst.extend_from_slice(&header_bytes);
            dst.extend_from_slice(&crc24(&header_bytes).to_le_bytes()[..3]);
            dst.extend_from_slice(&payload);
            dst.put_u32_le(crc32c(&payload));
        } else {
            let mut header: u32 = item.payload.len() as u32;
            if item.self_contained {
                header |= 1 << 17;
            }
            let header_bytes = [header as u8, (header >> 8) as u8, (header >> 16) as u8];
            dst.reserve(UNCOMPRESSED_HEADER_LEN + item.payload.len() + TRAILER_LEN);
            dst.extend_from_slice(&header_bytes);
            dst.extend_from_slice(&crc24(&header_bytes).to_le_bytes()[..3]);
            dst.extend_from_slice(&item.payload);
            dst.put_u32_le(crc32c(&item.payload));
        }
        Ok(())
    }
}

impl Decoder for SegmentCodec {
    type Item = Segment;
    type Error = DriverError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header_len = if self.compress {
            COMPRESSED_HEADER_LEN
        } else {
            UNCOMPRESSED_HEADER_LEN
        };
        if src.len() < header_len {
            return Ok(None);
        }

        let field_len = header_len - 3;
        let expected = crc24(&src[..field_len]);
        let actual = u32::from_le_bytes([
            src[field_len],
            src[field_len + 1],
            src[field_len + 2],
            0,
        ]);
        if expected != actual {
            return Err(DriverError::ProtocolError(format!(
                "segment header CRC mismatch: computed {expected:#08x}, received {actual:#08x}"
            )));
        }

        let mut header: u64 = 0;
        for (i, b) in src[..field_len].iter().enumerate() {
            header |= (*b as u64) << (8 * i);
        }
        let (payload_len, uncompressed_len, self_contained) = if self.compress {
            (
                (header & 0x1FFFF) as usize,
                ((header >> 17) & 0x1FFFF) as usize,
                header & (1 << 34) != 0,
            )
        } else {
            ((header & 0x1FFFF) as usize, 0, header & (1 << 17) != 0)
        };

        if src.len() < header_len + payload_len + TRAILER_LEN {
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(payload_len).freeze();
        let received_crc = src.get_u32_le();
        let computed_crc = crc32c(&payload);
        if received_crc != computed_crc {
            return Err(DriverError::ProtocolError(format!(
                "segment payload CRC-32C mismatch: computed {computed_crc:#010x}, received {received_crc:#010x}"
            )));
        }

        let payload = if self.compress && uncompressed_len > 0 {
            Bytes::from(
                lz4_flex::block::decompress(&payload, uncompressed_len)
                    .map_err(|e| DriverError::ProtocolError(format!("LZ4 decompression: {e}")))?,
            )
        } else {
            payload
        };

        Ok(Some(Segment {
            payload,
            self_contained,
        }))
    }
}
