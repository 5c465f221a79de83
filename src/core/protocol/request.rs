// src/core/protocol/request.rs

//! Encoding of request message bodies.

use crate::core::DriverError;
use crate::core::protocol::frame::{Frame, Opcode, ProtocolVersion};
use crate::core::protocol::types::{self, Consistency};
use bytes::{BufMut, Bytes, BytesMut};

// Query parameter flags. Protocol v5 widens the flag field from a byte to an
// int but keeps the bit assignments.
const FLAG_VALUES: u32 = 0x01;
const FLAG_SKIP_METADATA: u32 = 0x02;
const FLAG_PAGE_SIZE: u32 = 0x04;
const FLAG_WITH_PAGING_STATE: u32 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u32 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u32 = 0x20;
const FLAG_WITH_KEYSPACE: u32 = 0x80;

/// The per-request options encoded after a QUERY, EXECUTE or BATCH body.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    pub values: Vec<Option<Bytes>>,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub timestamp: Option<i64>,
    /// Only encoded on v5 connections.
    pub keyspace: Option<String>,
}

impl QueryParams {
    fn flags(&self, version: ProtocolVersion) -> u32 {
        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }
        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }
        if version >= ProtocolVersion::V5 && self.keyspace.is_some() {
            flags |= FLAG_WITH_KEYSPACE;
        }
        flags
    }

    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<(), DriverError> {
        types::write_consistency(buf, self.consistency);
        let flags = self.flags(version);
        if version >= ProtocolVersion::V5 {
            buf.put_u32(flags);
        } else {
            buf.put_u8(flags as u8);
        }
        if flags & FLAG_VALUES != 0 {
            buf.put_u16(self.values.len() as u16);
            for v in &self.values {
                types::write_bytes(buf, v.as_deref());
            }
        }
        if let Some(size) = self.page_size {
            buf.put_i32(size);
        }
        if let Some(state) = &self.paging_state {
            types::write_bytes(buf, Some(state));
        }
        if let Some(sc) = self.serial_consistency {
            if !sc.is_serial() {
                return Err(DriverError::InvalidRequest(format!(
                    "{sc} is not a serial consistency level"
                )));
            }
            types::write_consistency(buf, sc);
        }
        if let Some(ts) = self.timestamp {
            buf.put_i64(ts);
        }
        if flags & FLAG_WITH_KEYSPACE != 0 {
            types::write_string(buf, self.keyspace.as_deref().unwrap_or_default());
        }
        Ok(())
    }
}

/// A batch groups query strings and prepared statement ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchKind {
    #[default]
    Logged,
    Unlogged,
    Counter,
}

/// One child of a BATCH request.
#[derive(Debug, Clone)]
pub enum BatchQuery {
    Simple {
        query: String,
        values: Vec<Option<Bytes>>,
    },
    Prepared {
        id: Bytes,
        values: Vec<Option<Bytes>>,
    },
}

/// The request messages the driver sends.
#[derive(Debug, Clone)]
pub enum Request {
    Options,
    Startup {
        options: Vec<(String, String)>,
    },
    AuthResponse {
        token: Option<Bytes>,
    },
    Register {
        events: Vec<String>,
    },
    Query {
        query: String,
        params: QueryParams,
    },
    Prepare {
        query: String,
    },
    Execute {
        id: Bytes,
        result_metadata_id: Option<Bytes>,
        params: QueryParams,
    },
    Batch {
        kind: BatchKind,
        queries: Vec<BatchQuery>,
        consistency: Consistency,
        serial_consistency: Option<Consistency>,
        timestamp: Option<i64>,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Options => Opcode::Options,
            Request::Startup { .. } => Opcode::Startup,
            Request::AuthResponse { .. } => Opcode::AuthResponse,
            Request::Register { .. } => Opcode::Register,
            Request::Query { .. } => Opcode::Query,
            Request::Prepare { .. } => Opcode::Prepare,
            Request::Execute { .. } => Opcode::Execute,
            Request::Batch { .. } => Opcode::Batch,
        }
    }

    /// Encodes the body and wraps it into a frame for the given stream.
    pub fn to_frame(
        &self,
        version: ProtocolVersion,
        stream_id: i16,
    ) -> Result<Frame, DriverError> {
        let mut body = BytesMut::new();
        self.encode_body(version, &mut body)?;
        Ok(Frame::request(
            version,
            stream_id,
            self.opcode(),
            body.freeze(),
        ))
    }

    fn encode_body(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<(), DriverError> {
        match self {
            Request::Options => {}
            Request::Startup { options } => {
                types::write_string_map(buf, options);
            }
            Request::AuthResponse { token } => {
                types::write_bytes(buf, token.as_deref());
            }
            Request::Register { events } => {
                types::write_string_list(buf, events);
            }
            Request::Query { query, params } => {
                types::write_long_string(buf, query);
                params.encode(version, buf)?;
            }
            Request::Prepare { query } => {
                types::write_long_string(buf, query);
                if version >= ProtocolVersion::V5 {
                    // v5 PREPARE carries a flag field; the keyspace flag is
                    // unused because the driver qualifies statements itself.
                    buf.put_u32(0);
                }
            }
            Request::Execute {
                id,
                result_metadata_id,
                params,
            } => {
                types::write_short_bytes(buf, id);
                if version >= ProtocolVersion::V5 {
                    let metadata_id = result_metadata_id.as_ref().ok_or_else(|| {
                        DriverError::InvalidRequest(
                            "EXECUTE on v5 requires the prepared result metadata id".into(),
                        )
                    })?;
                    types::write_short_bytes(buf, metadata_id);
                }
                params.encode(version, buf)?;
            }
            Request::Batch {
                kind,
                queries,
                consistency,
                serial_consistency,
                timestamp,
            } => {
                buf.put_u8(match kind {
                    BatchKind::Logged => 0,
                    BatchKind::Unlogged => 1,
                    BatchKind::Counter => 2,
                });
                buf.put_u16(queries.len() as u16);
                for q in queries {
                    match q {
                        BatchQuery::Simple { query, values } => {
                            buf.put_u8(0);
                            types::write_long_string(buf, query);
                            buf.put_u16(values.len() as u16);
                            for v in values {
                                types::write_bytes(buf, v.as_deref());
                            }
                        }
                        BatchQuery::Prepared { id, values } => {
                            buf.put_u8(1);
                            types::write_short_bytes(buf, id);
                            buf.put_u16(values.len() as u16);
                            for v in values {
                                types::write_bytes(buf, v.as_deref());
                            }
                        }
                    }
                }
                types::write_consistency(buf, *consistency);
                let mut flags = 0u32;
                if serial_consistency.is_some() {
                    flags |= FLAG_WITH_SERIAL_CONSISTENCY;
                }
                if timestamp.is_some() {
                    flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
                }
                if version >= ProtocolVersion::V5 {
                    buf.put_u32(flags);
                } else {
                    buf.put_u8(flags as u8);
                }
                if let Some(sc) = serial_consistency {
                    types::write_consistency(buf, *sc);
                }
                if let Some(ts) = timestamp {
                    buf.put_i64(*ts);
                }
            }
        }
        Ok(())
    }
}
