// src/core/execution/result.rs

//! The user-facing result of one executed statement.

use crate::core::protocol::{Rows, SchemaChange};
use bytes::Bytes;
use std::net::SocketAddr;
use uuid::Uuid;

/// What came back from the coordinator, with the response prologue
/// (warnings, tracing id) preserved.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Row data for SELECTs; `None` for Void/SetKeyspace/SchemaChange
    /// results.
    pub rows: Option<Rows>,
    pub warnings: Vec<String>,
    pub tracing_id: Option<Uuid>,
    /// Set when the statement was a `USE`.
    pub keyspace: Option<String>,
    pub schema_change: Option<SchemaChange>,
    /// The node that answered.
    pub coordinator: SocketAddr,
}

impl QueryResult {
    pub(crate) fn empty(coordinator: SocketAddr) -> Self {
        Self {
            rows: None,
            warnings: Vec::new(),
            tracing_id: None,
            keyspace: None,
            schema_change: None,
            coordinator,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.as_ref().map(|r| r.rows.len()).unwrap_or(0)
    }

    pub fn first_row(&self) -> Option<&Vec<Option<Bytes>>> {
        self.rows.as_ref()?.rows.first()
    }

    /// Opaque continuation token for the next page, when the server has
    /// more rows.
    pub fn paging_state(&self) -> Option<Bytes> {
        self.rows.as_ref()?.metadata.paging_state.clone()
    }

    pub fn has_more_pages(&self) -> bool {
        self.paging_state().is_some()
    }
}
