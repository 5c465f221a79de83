// src/core/protocol/mod.rs

//! Implements the native binary protocol: frame codec, wire primitives,
//! request encoding, response decoding and the v5 segment layer.

pub mod frame;
pub mod request;
pub mod response;
pub mod segment;
pub mod types;

pub use frame::{Compression, Frame, FrameCodec, FrameFlags, Opcode, ProtocolVersion};
pub use request::{BatchKind, BatchQuery, QueryParams, Request};
pub use response::{
    ColumnSpec, ColumnType, CqlResult, DecodedResponse, PreparedResult, Response, Rows,
    RowsMetadata, SchemaChange, ServerEvent,
};
pub use types::Consistency;
