// src/core/protocol/response.rs

//! Decoding of response message bodies: RESULT in all its kinds, ERROR
//! mapped onto [`DriverError`], EVENT, and the handshake responses.

use crate::core::DriverError;
use crate::core::protocol::frame::{Frame, FrameFlags, Opcode, ProtocolVersion};
use crate::core::protocol::types;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use uuid::Uuid;

// RESULT kinds.
const RESULT_VOID: i32 = 0x0001;
const RESULT_ROWS: i32 = 0x0002;
const RESULT_SET_KEYSPACE: i32 = 0x0003;
const RESULT_PREPARED: i32 = 0x0004;
const RESULT_SCHEMA_CHANGE: i32 = 0x0005;

// Rows metadata flags.
const ROWS_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const ROWS_HAS_MORE_PAGES: i32 = 0x0002;
const ROWS_NO_METADATA: i32 = 0x0004;
const ROWS_METADATA_CHANGED: i32 = 0x0008;

// Error codes.
const ERR_SERVER: i32 = 0x0000;
const ERR_PROTOCOL: i32 = 0x000A;
const ERR_AUTH: i32 = 0x0100;
const ERR_UNAVAILABLE: i32 = 0x1000;
const ERR_OVERLOADED: i32 = 0x1001;
const ERR_IS_BOOTSTRAPPING: i32 = 0x1002;
const ERR_TRUNCATE: i32 = 0x1003;
const ERR_WRITE_TIMEOUT: i32 = 0x1100;
const ERR_READ_TIMEOUT: i32 = 0x1200;
const ERR_READ_FAILURE: i32 = 0x1300;
const ERR_FUNCTION_FAILURE: i32 = 0x1400;
const ERR_WRITE_FAILURE: i32 = 0x1500;
const ERR_SYNTAX: i32 = 0x2000;
const ERR_UNAUTHORIZED: i32 = 0x2100;
const ERR_INVALID: i32 = 0x2200;
const ERR_CONFIG: i32 = 0x2300;
const ERR_ALREADY_EXISTS: i32 = 0x2400;
const ERR_UNPREPARED: i32 = 0x2500;

/// A column data type as declared in result metadata. Only the structure is
/// retained; value parsing beyond raw cells is an external concern.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    Smallint,
    Tinyint,
    Duration,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

impl ColumnType {
    fn decode(buf: &mut Bytes) -> Result<Self, DriverError> {
        let id = types::read_short(buf)?;
        Ok(match id {
            0x0000 => ColumnType::Custom(types::read_string(buf)?),
            0x0001 => ColumnType::Ascii,
            0x0002 => ColumnType::Bigint,
            0x0003 => ColumnType::Blob,
            0x0004 => ColumnType::Boolean,
            0x0005 => ColumnType::Counter,
            0x0006 => ColumnType::Decimal,
            0x0007 => ColumnType::Double,
            0x0008 => ColumnType::Float,
            0x0009 => ColumnType::Int,
            0x000B => ColumnType::Timestamp,
            0x000C => ColumnType::Uuid,
            0x000D => ColumnType::Varchar,
            0x000E => ColumnType::Varint,
            0x000F => ColumnType::Timeuuid,
            0x0010 => ColumnType::Inet,
            0x0011 => ColumnType::Date,
            0x0012 => ColumnType::Time,
            0x0013 => ColumnType::Smallint,
            0x0014 => ColumnType::Tinyint,
            0x0015 => ColumnType::Duration,
            0x0020 => ColumnType::List(Box::new(ColumnType::decode(buf)?)),
            0x0021 => ColumnType::Map(
                Box::new(ColumnType::decode(buf)?),
                Box::new(ColumnType::decode(buf)?),
            ),
            0x0022 => ColumnType::Set(Box::new(ColumnType::decode(buf)?)),
            0x0030 => {
                let keyspace = types::read_string(buf)?;
                let name = types::read_string(buf)?;
                let n = types::read_short(buf)? as usize;
                let mut fields = Vec::with_capacity(n);
                for _ in 0..n {
                    let field_name = types::read_string(buf)?;
                    fields.push((field_name, ColumnType::decode(buf)?));
                }
                ColumnType::Udt {
                    keyspace,
                    name,
                    fields,
                }
            }
            0x0031 => {
                let n = types::read_short(buf)? as usize;
                let mut elems = Vec::with_capacity(n);
                for _ in 0..n {
                    elems.push(ColumnType::decode(buf)?);
                }
                ColumnType::Tuple(elems)
            }
            other => {
                return Err(DriverError::ProtocolError(format!(
                    "unknown column type id {other:#06x}"
                )));
            }
        })
    }
}

/// One column of a result set or of a prepared statement's variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub column_type: ColumnType,
}

/// Metadata preceding the row content of a Rows result.
#[derive(Debug, Clone, Default)]
pub struct RowsMetadata {
    pub column_specs: Vec<ColumnSpec>,
    pub column_count: usize,
    pub paging_state: Option<Bytes>,
    pub new_metadata_id: Option<Bytes>,
    pub no_metadata: bool,
}

/// A decoded Rows result: metadata plus raw cells. A cell is `None` for a
/// database null.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    pub metadata: RowsMetadata,
    pub rows: Vec<Vec<Option<Bytes>>>,
}

/// The body of a RESULT frame answering a PREPARE.
#[derive(Debug, Clone)]
pub struct PreparedResult {
    pub id: Bytes,
    pub result_metadata_id: Option<Bytes>,
    pub variable_specs: Vec<ColumnSpec>,
    pub pk_indices: Vec<u16>,
    pub result_specs: Vec<ColumnSpec>,
}

/// A schema change, as carried by both RESULT frames and EVENT frames.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChange {
    pub change_type: String,
    pub target: String,
    pub keyspace: String,
    pub name: Option<String>,
}

/// The kinds of a RESULT frame.
#[derive(Debug, Clone)]
pub enum CqlResult {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared(PreparedResult),
    SchemaChange(SchemaChange),
}

/// Server-pushed EVENT frames, delivered on stream id -1.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    TopologyChange { change: String, address: SocketAddr },
    StatusChange { change: String, address: SocketAddr },
    SchemaChange(SchemaChange),
}

/// The response messages the driver receives.
#[derive(Debug, Clone)]
pub enum Response {
    Ready,
    Authenticate { mechanism: String },
    AuthChallenge { token: Option<Bytes> },
    AuthSuccess { token: Option<Bytes> },
    Supported { options: HashMap<String, Vec<String>> },
    Result(CqlResult),
    Event(ServerEvent),
    Error(DriverError),
}

/// A fully decoded response frame: the message itself plus the prologue
/// items the header flags announce.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub response: Response,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: Option<HashMap<String, Option<Bytes>>>,
}

impl DecodedResponse {
    /// Decodes the body of a response frame. The prologue order is fixed by
    /// the protocol: tracing id, then warnings, then custom payload.
    pub fn decode(frame: &Frame) -> Result<DecodedResponse, DriverError> {
        let mut body = frame.body.clone();

        let tracing_id = if frame.flags.contains(FrameFlags::TRACING) {
            Some(types::read_uuid(&mut body)?)
        } else {
            None
        };
        let warnings = if frame.flags.contains(FrameFlags::WARNING) {
            types::read_string_list(&mut body)?
        } else {
            Vec::new()
        };
        let custom_payload = if frame.flags.contains(FrameFlags::CUSTOM_PAYLOAD) {
            let n = types::read_short(&mut body)? as usize;
            let mut map = HashMap::with_capacity(n);
            for _ in 0..n {
                let key = types::read_string(&mut body)?;
                let value = types::read_bytes(&mut body)?;
                map.insert(key, value);
            }
            Some(map)
        } else {
            None
        };

        let response = match frame.opcode {
            Opcode::Ready => Response::Ready,
            Opcode::Authenticate => Response::Authenticate {
                mechanism: types::read_string(&mut body)?,
            },
            Opcode::AuthChallenge => Response::AuthChallenge {
                token: types::read_bytes(&mut body)?,
            },
            Opcode::AuthSuccess => Response::AuthSuccess {
                token: types::read_bytes(&mut body)?,
            },
            Opcode::Supported => Response::Supported {
                options: types::read_string_multimap(&mut body)?,
            },
            Opcode::Result => Response::Result(decode_result(frame.version, &mut body)?),
            Opcode::Event => Response::Event(decode_event(&mut body)?),
            Opcode::Error => Response::Error(decode_error(frame.version, &mut body)?),
            other => {
                return Err(DriverError::ProtocolError(format!(
                    "unexpected response opcode {other:?}"
                )));
            }
        };

        Ok(DecodedResponse {
            response,
            tracing_id,
            warnings,
            custom_payload,
        })
    }
}

fn decode_rows_metadata(
    version: ProtocolVersion,
    body: &mut Bytes,
) -> Result<RowsMetadata, DriverError> {
    let flags = types::read_int(body)?;
    let column_count = types::read_int(body)?;
    if column_count < 0 {
        return Err(DriverError::ProtocolError("negative column count".into()));
    }
    let column_count = column_count as usize;

    let mut metadata = RowsMetadata {
        column_count,
        no_metadata: flags & ROWS_NO_METADATA != 0,
        ..Default::default()
    };

    if version >= ProtocolVersion::V5 && flags & ROWS_METADATA_CHANGED != 0 {
        metadata.new_metadata_id = Some(types::read_short_bytes(body)?);
    }
    if flags & ROWS_HAS_MORE_PAGES != 0 {
        metadata.paging_state = types::read_bytes(body)?;
    }
    if !metadata.no_metadata {
        let global = flags & ROWS_GLOBAL_TABLES_SPEC != 0;
        let (global_ks, global_table) = if global {
            (types::read_string(body)?, types::read_string(body)?)
        } else {
            (String::new(), String::new())
        };
        let mut specs = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let (keyspace, table) = if global {
                (global_ks.clone(), global_table.clone())
            } else {
                (types::read_string(body)?, types::read_string(body)?)
            };
            let name = types::read_string(body)?;
            let column_type = ColumnType::decode(body)?;
            specs.push(ColumnSpec {
                keyspace,
                table,
                name,
                column_type,
            });
        }
        metadata.column_specs = specs;
    }
    Ok(metadata)
}

fn decode_result(version: ProtocolVersion, body: &mut Bytes) -> Result<CqlResult, DriverError> {
    let kind = types::read_int(body)?;
    Ok(match kind {
        RESULT_VOID => CqlResult::Void,
        RESULT_ROWS => {
            let metadata = decode_rows_metadata(version, body)?;
            let row_count = types::read_int(body)?;
            if row_count < 0 {
                return Err(DriverError::ProtocolError("negative row count".into()));
            }
            let mut rows = Vec::with_capacity(row_count as usize);
            for _ in 0..row_count {
                let mut row = Vec::with_capacity(metadata.column_count);
                for _ in 0..metadata.column_count {
                    row.push(types::read_bytes(body)?);
                }
                rows.push(row);
            }
            CqlResult::Rows(Rows { metadata, rows })
        }
        RESULT_SET_KEYSPACE => CqlResult::SetKeyspace(types::read_string(body)?),
        RESULT_PREPARED => {
            let id = types::read_short_bytes(body)?;
            let result_metadata_id = if version >= ProtocolVersion::V5 {
                Some(types::read_short_bytes(body)?)
            } else {
                None
            };

            // Variables metadata; v4 adds the partition-key indices.
            let flags = types::read_int(body)?;
            let column_count = types::read_int(body)? as usize;
            let mut pk_indices = Vec::new();
            if version >= ProtocolVersion::V4 {
                let pk_count = types::read_int(body)? as usize;
                pk_indices.reserve(pk_count);
                for _ in 0..pk_count {
                    pk_indices.push(types::read_short(body)?);
                }
            }
            let global = flags & ROWS_GLOBAL_TABLES_SPEC != 0;
            let (global_ks, global_table) = if global {
                (types::read_string(body)?, types::read_string(body)?)
            } else {
                (String::new(), String::new())
            };
            let mut variable_specs = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                let (keyspace, table) = if global {
                    (global_ks.clone(), global_table.clone())
                } else {
                    (types::read_string(body)?, types::read_string(body)?)
                };
                let name = types::read_string(body)?;
                let column_type = ColumnType::decode(body)?;
                variable_specs.push(ColumnSpec {
                    keyspace,
                    table,
                    name,
                    column_type,
                });
            }

            let result_metadata = decode_rows_metadata(version, body)?;
            CqlResult::Prepared(PreparedResult {
                id,
                result_metadata_id,
                variable_specs,
                pk_indices,
                result_specs: result_metadata.column_specs,
            })
        }
        RESULT_SCHEMA_CHANGE => CqlResult::SchemaChange(decode_schema_change(body)?),
        other => {
            return Err(DriverError::ProtocolError(format!(
                "unknown result kind {other:#06x}"
            )));
        }
    })
}

fn decode_schema_change(body: &mut Bytes) -> Result<SchemaChange, DriverError> {
    let change_type = types::read_string(body)?;
    let target = types::read_string(body)?;
    let keyspace = types::read_string(body)?;
    let name = match target.as_str() {
        "KEYSPACE" => None,
        // TABLE, TYPE, FUNCTION and AGGREGATE all carry an object name;
        // functions additionally list argument types, which are skipped.
        _ => {
            let name = types::read_string(body)?;
            if matches!(target.as_str(), "FUNCTION" | "AGGREGATE") {
                let _ = types::read_string_list(body)?;
            }
            Some(name)
        }
    };
    Ok(SchemaChange {
        change_type,
        target,
        keyspace,
        name,
    })
}

fn decode_event(body: &mut Bytes) -> Result<ServerEvent, DriverError> {
    let event_type = types::read_string(body)?;
    Ok(match event_type.as_str() {
        "TOPOLOGY_CHANGE" => ServerEvent::TopologyChange {
            change: types::read_string(body)?,
            address: types::read_inet(body)?,
        },
        "STATUS_CHANGE" => ServerEvent::StatusChange {
            change: types::read_string(body)?,
            address: types::read_inet(body)?,
        },
        "SCHEMA_CHANGE" => ServerEvent::SchemaChange(decode_schema_change(body)?),
        other => {
            return Err(DriverError::ProtocolError(format!(
                "unknown event type {other}"
            )));
        }
    })
}

/// v5 replaces the failure count of READ/WRITE failure errors with a map of
/// endpoint to failure code; only the count is retained.
fn read_failure_count(version: ProtocolVersion, body: &mut Bytes) -> Result<i32, DriverError> {
    if version >= ProtocolVersion::V5 {
        let n = types::read_int(body)?;
        for _ in 0..n {
            let _ = types::read_inetaddr(body)?;
            let _ = types::read_short(body)?;
        }
        Ok(n)
    } else {
        types::read_int(body)
    }
}

fn decode_error(version: ProtocolVersion, body: &mut Bytes) -> Result<DriverError, DriverError> {
    let code = types::read_int(body)?;
    let message = types::read_string(body)?;
    Ok(match code {
        ERR_SERVER => DriverError::ServerError(message),
        ERR_PROTOCOL => DriverError::ProtocolError(message),
        ERR_AUTH => DriverError::AuthenticationFailed(message),
        ERR_UNAVAILABLE => DriverError::Unavailable {
            consistency: types::read_consistency(body)?,
            required: types::read_int(body)?,
            alive: types::read_int(body)?,
        },
        ERR_OVERLOADED => DriverError::Overloaded,
        ERR_IS_BOOTSTRAPPING => DriverError::IsBootstrapping,
        ERR_TRUNCATE => DriverError::TruncateError(message),
        ERR_WRITE_TIMEOUT => DriverError::WriteTimeout {
            consistency: types::read_consistency(body)?,
            received: types::read_int(body)?,
            block_for: types::read_int(body)?,
            write_type: types::read_string(body)?,
        },
        ERR_READ_TIMEOUT => DriverError::ReadTimeout {
            consistency: types::read_consistency(body)?,
            received: types::read_int(body)?,
            block_for: types::read_int(body)?,
            data_present: types::read_byte(body)? != 0,
        },
        ERR_READ_FAILURE => {
            let consistency = types::read_consistency(body)?;
            let received = types::read_int(body)?;
            let block_for = types::read_int(body)?;
            let failures = read_failure_count(version, body)?;
            let data_present = types::read_byte(body)? != 0;
            DriverError::ReadFailure {
                consistency,
                received,
                block_for,
                failures,
                data_present,
            }
        }
        ERR_FUNCTION_FAILURE => DriverError::FunctionFailure(message),
        ERR_WRITE_FAILURE => {
            let consistency = types::read_consistency(body)?;
            let received = types::read_int(body)?;
            let block_for = types::read_int(body)?;
            let failures = read_failure_count(version, body)?;
            let write_type = types::read_string(body)?;
            DriverError::WriteFailure {
                consistency,
                received,
                block_for,
                failures,
                write_type,
            }
        }
        ERR_SYNTAX => DriverError::SyntaxError(message),
        ERR_UNAUTHORIZED => DriverError::Unauthorized(message),
        ERR_INVALID => DriverError::InvalidQuery(message),
        ERR_CONFIG => DriverError::ConfigError(message),
        ERR_ALREADY_EXISTS => DriverError::AlreadyExists {
            keyspace: types::read_string(body)?,
            table: types::read_string(body)?,
        },
        ERR_UNPREPARED => DriverError::Unprepared(types::read_short_bytes(body)?),
        other => DriverError::ServerError(format!("error code {other:#06x}: {message}")),
    })
}
