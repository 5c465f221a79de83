// src/core/errors.rs

//! Defines the primary error type for the entire driver.

use crate::core::protocol::types::Consistency;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the driver.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol Error: {0}")]
    ProtocolError(String),

    #[error("Operation timed out: {0}")]
    OperationTimedOut(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Connection busy: all stream ids are in use")]
    ConnectionBusy,

    #[error("Host busy: no connection with a free stream id")]
    HostBusy,

    #[error("Cluster is closing")]
    ClusterClosing,

    #[error("Object disposed: the cluster has been shut down")]
    Disposed,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Every host in the query plan failed; carries the last error per host tried.
    #[error("No host available to execute the request ({} hosts tried)", .0.len())]
    NoHostAvailable(Vec<(SocketAddr, DriverError)>),

    // --- Server-reported errors, mapped from ERROR frames ---
    #[error("Server Error: {0}")]
    ServerError(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Syntax error: {0}")]
    SyntaxError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Already exists: {keyspace}.{table}")]
    AlreadyExists { keyspace: String, table: String },

    #[error("Unavailable: consistency {consistency}, required {required}, alive {alive}")]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    #[error("Read timeout: consistency {consistency}, received {received}/{block_for}")]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },

    #[error("Write timeout: consistency {consistency}, received {received}/{block_for}, type {write_type}")]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: String,
    },

    #[error("Read failure: consistency {consistency}, {failures} replica(s) failed")]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        failures: i32,
        data_present: bool,
    },

    #[error("Write failure: consistency {consistency}, {failures} replica(s) failed, type {write_type}")]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        failures: i32,
        write_type: String,
    },

    /// The coordinator does not know the prepared statement id; the executor
    /// recovers by re-preparing on the same host.
    #[error("Unprepared statement: id {}", hex::encode(.0))]
    Unprepared(Bytes),

    #[error("Coordinator overloaded")]
    Overloaded,

    #[error("Coordinator is bootstrapping")]
    IsBootstrapping,

    #[error("Truncate error: {0}")]
    TruncateError(String),

    #[error("Function failure: {0}")]
    FunctionFailure(String),

    /// Client-side misuse of the API; surfaced immediately, never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Driver internal error: {0}")]
    DriverInternalError(String),
}

impl PartialEq for DriverError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DriverError::Io(e1), DriverError::Io(e2)) => e1.to_string() == e2.to_string(),
            (DriverError::ProtocolError(s1), DriverError::ProtocolError(s2)) => s1 == s2,
            (DriverError::ConnectionClosed(s1), DriverError::ConnectionClosed(s2)) => s1 == s2,
            (DriverError::OperationTimedOut(s1), DriverError::OperationTimedOut(s2)) => s1 == s2,
            (DriverError::ServerError(s1), DriverError::ServerError(s2)) => s1 == s2,
            (DriverError::InvalidQuery(s1), DriverError::InvalidQuery(s2)) => s1 == s2,
            (DriverError::SyntaxError(s1), DriverError::SyntaxError(s2)) => s1 == s2,
            (DriverError::Unauthorized(s1), DriverError::Unauthorized(s2)) => s1 == s2,
            (DriverError::InvalidRequest(s1), DriverError::InvalidRequest(s2)) => s1 == s2,
            (DriverError::ConfigError(s1), DriverError::ConfigError(s2)) => s1 == s2,
            (DriverError::Unprepared(id1), DriverError::Unprepared(id2)) => id1 == id2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl DriverError {
    /// Whether this error means the connection it happened on is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DriverError::Io(_) | DriverError::ConnectionClosed(_) | DriverError::IncompleteData
        )
    }

    /// Protocol-fatal errors close the connection and are never retried on it.
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::ProtocolError(_) | DriverError::AuthenticationFailed(_)
        )
    }

    /// Whether the executor may move to the next host in the plan without
    /// consulting the retry policy (the request was never handed to a server).
    pub fn is_safe_to_try_next_host(&self) -> bool {
        matches!(
            self,
            DriverError::HostBusy | DriverError::ConnectionBusy | DriverError::IsBootstrapping
        )
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        DriverError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for DriverError {
    fn from(e: std::str::Utf8Error) -> Self {
        DriverError::ProtocolError(format!("invalid UTF-8 in frame: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for DriverError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        DriverError::ProtocolError(format!("invalid UTF-8 in frame: {e}"))
    }
}

impl From<std::net::AddrParseError> for DriverError {
    fn from(e: std::net::AddrParseError) -> Self {
        DriverError::ConfigError(format!("invalid address: {e}"))
    }
}
