// src/core/prepared.rs

//! The cluster-wide prepared-statement registry.
//!
//! Statements are keyed by the server-assigned id, compared by content. The
//! map is insert-or-get: the first PREPARE wins and later ones adopt the
//! existing entry. Fleet-wide preparation (after a first PREPARE, and again
//! when a host comes back up) is best effort under a shared semaphore;
//! failures are logged and swallowed because the executor lazily recovers
//! from UNPREPARED responses anyway.

use crate::core::DriverError;
use crate::core::pool::HostPool;
use crate::core::protocol::{ColumnSpec, PreparedResult, Request};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Concurrent PREPARE requests across the whole fleet fan-out.
const FANOUT_PERMITS: usize = 64;

/// A server-side compiled statement and the metadata needed to execute it.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-assigned opaque id; equality is by content.
    pub id: Bytes,
    pub query: String,
    pub keyspace: Option<String>,
    pub variable_specs: Vec<ColumnSpec>,
    /// Indices of the partition-key variables, used for routing-key
    /// computation. Empty on protocol v3, where the server does not report
    /// them.
    pub pk_indices: Vec<u16>,
    pub result_specs: Vec<ColumnSpec>,
    /// v5 result-metadata id, echoed back on EXECUTE.
    pub result_metadata_id: Option<Bytes>,
    pub idempotent: bool,
}

impl PreparedStatement {
    pub fn from_result(
        result: PreparedResult,
        query: String,
        keyspace: Option<String>,
        idempotent: bool,
    ) -> Self {
        Self {
            id: result.id,
            query,
            keyspace,
            variable_specs: result.variable_specs,
            pk_indices: result.pk_indices,
            result_specs: result.result_specs,
            result_metadata_id: result.result_metadata_id,
            idempotent,
        }
    }
}

/// The shared registry. Single-writer per id via insert-or-get.
pub struct PreparedRegistry {
    by_id: DashMap<Bytes, Arc<PreparedStatement>>,
    fanout: Arc<Semaphore>,
}

impl Default for PreparedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PreparedRegistry {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            fanout: Arc::new(Semaphore::new(FANOUT_PERMITS)),
        }
    }

    /// Inserts a freshly prepared statement, or returns the entry another
    /// caller registered first.
    pub fn insert_or_get(&self, statement: PreparedStatement) -> Arc<PreparedStatement> {
        self.by_id
            .entry(statement.id.clone())
            .or_insert_with(|| Arc::new(statement))
            .clone()
    }

    /// Looks a statement up by the id an UNPREPARED error reported.
    pub fn get(&self, id: &[u8]) -> Option<Arc<PreparedStatement>> {
        self.by_id.get(id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// A point-in-time view of every registered statement.
    pub fn statements(&self) -> Vec<Arc<PreparedStatement>> {
        self.by_id.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Best-effort PREPARE of one statement on every given pool, bounded by
    /// the shared semaphore. Used after a first successful PREPARE to warm
    /// the rest of the fleet.
    pub fn fan_out(
        self: &Arc<Self>,
        query: String,
        pools: Vec<Arc<HostPool>>,
        read_timeout: Duration,
    ) {
        for pool in pools {
            let permits = self.fanout.clone();
            let query = query.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                prepare_on_pool(&pool, &query, read_timeout).await;
            });
        }
    }

    /// Re-prepares every registered statement on a host that just came back
    /// up. Errors are logged and swallowed; the executor recovers lazily on
    /// UNPREPARED if anything is missed.
    pub fn reprepare_on_host(
        self: &Arc<Self>,
        pool: Arc<HostPool>,
        read_timeout: Duration,
    ) {
        let statements = self.statements();
        if statements.is_empty() {
            return;
        }
        debug!(addr = %pool.address(), count = statements.len(),
            "re-preparing statements on recovered host");
        for statement in statements {
            let permits = self.fanout.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                prepare_on_pool(&pool, &statement.query, read_timeout).await;
            });
        }
    }
}

async fn prepare_on_pool(pool: &Arc<HostPool>, query: &str, read_timeout: Duration) {
    let conn = match pool.borrow().await {
        Ok(conn) => conn,
        Err(DriverError::HostBusy) | Err(DriverError::ClusterClosing) => return,
        Err(e) => {
            warn!(addr = %pool.address(), error = %e, "cannot borrow a connection to prepare on");
            return;
        }
    };
    let request = Request::Prepare {
        query: query.to_string(),
    };
    if let Err(e) = conn.request(&request, read_timeout).await {
        warn!(addr = %pool.address(), error = %e, "background PREPARE failed");
    }
}
