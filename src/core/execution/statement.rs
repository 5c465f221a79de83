// src/core/execution/statement.rs

//! The statement kinds a session can execute, and the per-request options
//! bundle.

use crate::core::prepared::PreparedStatement;
use crate::core::protocol::{BatchKind, Consistency};
use crate::core::topology::murmur3_token;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;

/// A query string with positional values, parsed server-side on every
/// execution.
#[derive(Debug, Clone)]
pub struct SimpleStatement {
    pub query: String,
    pub values: Vec<Option<Bytes>>,
    pub idempotent: bool,
}

impl SimpleStatement {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            values: Vec::new(),
            idempotent: false,
        }
    }

    pub fn with_values(mut self, values: Vec<Option<Bytes>>) -> Self {
        self.values = values;
        self
    }

    /// Marks the statement safe to retry and to race speculatively.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

/// A prepared statement bound to a set of values.
#[derive(Debug, Clone)]
pub struct BoundStatement {
    pub prepared: Arc<PreparedStatement>,
    pub values: Vec<Option<Bytes>>,
    /// Overrides the idempotence recorded at prepare time.
    pub idempotent: Option<bool>,
}

impl BoundStatement {
    pub fn new(prepared: Arc<PreparedStatement>, values: Vec<Option<Bytes>>) -> Self {
        Self {
            prepared,
            values,
            idempotent: None,
        }
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent.unwrap_or(self.prepared.idempotent)
    }

    /// The serialized partition key, composed from the bound values at the
    /// partition-key indices the server reported. `None` when the indices
    /// are unknown (protocol v3) or a component is unbound.
    pub fn routing_key(&self) -> Option<Bytes> {
        match self.prepared.pk_indices.as_slice() {
            [] => None,
            [single] => self.values.get(*single as usize)?.clone(),
            composite => {
                // Composite keys are length-prefixed components, each
                // followed by a zero byte.
                let mut key = BytesMut::new();
                for index in composite {
                    let value = self.values.get(*index as usize)?.as_ref()?;
                    key.put_u16(value.len() as u16);
                    key.extend_from_slice(value);
                    key.put_u8(0);
                }
                Some(key.freeze())
            }
        }
    }
}

/// One child of a batch.
#[derive(Debug, Clone)]
pub enum BatchChild {
    Simple {
        query: String,
        values: Vec<Option<Bytes>>,
    },
    Prepared {
        statement: Arc<PreparedStatement>,
        values: Vec<Option<Bytes>>,
    },
}

/// A group of statements executed as one request.
#[derive(Debug, Clone)]
pub struct BatchStatement {
    pub kind: BatchKind,
    pub children: Vec<BatchChild>,
    pub idempotent: bool,
}

impl BatchStatement {
    pub fn new(kind: BatchKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
            idempotent: false,
        }
    }

    pub fn add_simple(mut self, query: impl Into<String>, values: Vec<Option<Bytes>>) -> Self {
        self.children.push(BatchChild::Simple {
            query: query.into(),
            values,
        });
        self
    }

    pub fn add_prepared(
        mut self,
        statement: Arc<PreparedStatement>,
        values: Vec<Option<Bytes>>,
    ) -> Self {
        self.children.push(BatchChild::Prepared { statement, values });
        self
    }
}

/// Anything the executor can run.
#[derive(Debug, Clone)]
pub enum Statement {
    Simple(SimpleStatement),
    Bound(BoundStatement),
    Batch(BatchStatement),
}

impl Statement {
    pub fn is_idempotent(&self) -> bool {
        match self {
            Statement::Simple(s) => s.idempotent,
            Statement::Bound(b) => b.is_idempotent(),
            Statement::Batch(b) => b.idempotent,
        }
    }

    /// The keyspace this statement is known to target, used for token-aware
    /// routing.
    pub fn keyspace(&self) -> Option<&str> {
        match self {
            Statement::Bound(b) => b.prepared.keyspace.as_deref(),
            _ => None,
        }
    }

    /// The partition token of the statement's routing key, when derivable.
    pub fn routing_token(&self) -> Option<i64> {
        match self {
            Statement::Bound(b) => b.routing_key().map(|k| murmur3_token(&k)),
            _ => None,
        }
    }
}

impl From<SimpleStatement> for Statement {
    fn from(s: SimpleStatement) -> Self {
        Statement::Simple(s)
    }
}

impl From<BoundStatement> for Statement {
    fn from(b: BoundStatement) -> Self {
        Statement::Bound(b)
    }
}

impl From<BatchStatement> for Statement {
    fn from(b: BatchStatement) -> Self {
        Statement::Batch(b)
    }
}

/// Per-request overrides; unset fields fall back to the configured query
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<Consistency>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    /// An explicit write timestamp in microseconds; otherwise the timestamp
    /// generator supplies one.
    pub timestamp: Option<i64>,
    pub read_timeout: Option<Duration>,
}
