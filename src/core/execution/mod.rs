// src/core/execution/mod.rs

//! The request executor: walks the query plan, dispatches attempts, and
//! orchestrates retries, speculative executions and UNPREPARED recovery.
//!
//! One user call spawns one *execution* that walks the shared plan host by
//! host. When the speculative policy allows and the statement is
//! idempotent, additional executions join after a delay, pulling from the
//! same plan; the first response wins and the losers are dropped (their
//! in-flight requests expire via the orphan discipline). Exhausting the
//! plan without a response surfaces `NoHostAvailable` with the last error
//! per host.

pub mod result;
pub mod statement;

pub use result::QueryResult;
pub use statement::{
    BatchChild, BatchStatement, BoundStatement, QueryOptions, SimpleStatement, Statement,
};

use crate::config::Config;
use crate::core::DriverError;
use crate::core::connection::Connection;
use crate::core::policies::{Policies, QueryPlan, RetryDecision, RoutingInfo};
use crate::core::pool::HostPool;
use crate::core::prepared::PreparedRegistry;
use crate::core::protocol::{
    BatchQuery, CqlResult, DecodedResponse, ProtocolVersion, QueryParams, Request, Response,
};
use crate::core::topology::Metadata;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Everything an execution needs, shared by every session of a cluster.
pub(crate) struct ExecutionContext {
    pub config: Arc<Config>,
    pub policies: Arc<Policies>,
    pub metadata: Arc<Metadata>,
    pub pools: Arc<DashMap<Uuid, Arc<HostPool>>>,
    pub prepared: Arc<PreparedRegistry>,
}

/// Why one execution stopped without a result.
enum ExecutionError {
    /// The plan ran dry; the shared error list holds the details.
    Exhausted,
    /// A non-retriable error that must surface as-is.
    Fatal(DriverError),
}

pub(crate) async fn execute(
    ctx: &Arc<ExecutionContext>,
    statement: &Statement,
    options: &QueryOptions,
    session_keyspace: Option<&str>,
) -> Result<QueryResult, DriverError> {
    let snapshot = ctx.metadata.snapshot();
    let routing = RoutingInfo {
        keyspace: statement.keyspace().or(session_keyspace),
        token: statement.routing_token(),
    };
    let plan = ctx
        .policies
        .load_balancing
        .new_query_plan(&routing, &snapshot);
    let plan = Arc::new(parking_lot::Mutex::new(plan));
    let errors: Arc<parking_lot::Mutex<Vec<(std::net::SocketAddr, DriverError)>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));

    let idempotent = statement.is_idempotent();
    let read_timeout = options
        .read_timeout
        .unwrap_or(ctx.config.socket.read_timeout);
    let params = base_params(ctx, options);

    let mut executions = FuturesUnordered::new();
    executions.push(Box::pin(run_execution(
        ctx.clone(),
        plan.clone(),
        statement.clone(),
        params.clone(),
        errors.clone(),
        idempotent,
        read_timeout,
    )));
    let mut started: u32 = 1;

    loop {
        // Non-idempotent statements bypass speculation entirely.
        let next_speculative = if idempotent {
            ctx.policies.speculative.next_execution(started)
        } else {
            None
        };

        tokio::select! {
            finished = executions.next() => match finished {
                Some(Ok(result)) => {
                    // First success wins; dropping the set cancels siblings.
                    return Ok(result);
                }
                Some(Err(ExecutionError::Fatal(e))) => return Err(e),
                Some(Err(ExecutionError::Exhausted)) | None => {
                    if executions.is_empty() {
                        let collected = std::mem::take(&mut *errors.lock());
                        return Err(DriverError::NoHostAvailable(collected));
                    }
                }
            },
            _ = sleep_or_never(next_speculative) => {
                debug!(execution = started + 1, "starting speculative execution");
                executions.push(Box::pin(run_execution(
                    ctx.clone(),
                    plan.clone(),
                    statement.clone(),
                    params.clone(),
                    errors.clone(),
                    idempotent,
                    read_timeout,
                )));
                started += 1;
            }
        }
    }
}

async fn sleep_or_never(delay: Option<Duration>) {
    match delay {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

fn base_params(ctx: &ExecutionContext, options: &QueryOptions) -> QueryParams {
    QueryParams {
        consistency: options.consistency.unwrap_or(ctx.config.query.consistency),
        serial_consistency: options
            .serial_consistency
            .or(ctx.config.query.serial_consistency),
        values: Vec::new(),
        skip_metadata: false,
        page_size: Some(options.page_size.unwrap_or(ctx.config.query.page_size)),
        paging_state: options.paging_state.clone(),
        // One timestamp per user call: a retried write carries the same
        // timestamp and cannot re-order against itself.
        timestamp: Some(
            options
                .timestamp
                .unwrap_or_else(|| ctx.policies.timestamp.next()),
        ),
        keyspace: None,
    }
}

/// One sequential walk over the shared plan.
async fn run_execution(
    ctx: Arc<ExecutionContext>,
    plan: Arc<parking_lot::Mutex<QueryPlan>>,
    statement: Statement,
    params: QueryParams,
    errors: Arc<parking_lot::Mutex<Vec<(std::net::SocketAddr, DriverError)>>>,
    idempotent: bool,
    read_timeout: Duration,
) -> Result<QueryResult, ExecutionError> {
    let mut attempt: u32 = 0;

    'hosts: loop {
        let host = { plan.lock().next() };
        let Some(host) = host else {
            return Err(ExecutionError::Exhausted);
        };
        let Some(pool) = ctx.pools.get(&host.id).map(|p| p.value().clone()) else {
            errors.lock().push((host.address, DriverError::HostBusy));
            continue 'hosts;
        };

        // At most one re-preparation per host visit.
        let mut reprepared = false;
        'same_host: loop {
            let conn = match pool.borrow().await {
                Ok(conn) => conn,
                Err(e @ DriverError::ClusterClosing) => {
                    return Err(ExecutionError::Fatal(e));
                }
                Err(e) => {
                    errors.lock().push((host.address, e));
                    continue 'hosts;
                }
            };

            let request = match make_request(&statement, &params, conn.version()) {
                Ok(request) => request,
                Err(e) => return Err(ExecutionError::Fatal(e)),
            };

            match conn.request(&request, read_timeout).await {
                Ok(decoded) => return Ok(assemble(decoded, conn.address())),
                Err(DriverError::Unprepared(id)) if !reprepared => {
                    reprepared = true;
                    match reprepare(&ctx, &statement, &conn, &id, read_timeout).await {
                        Ok(()) => continue 'same_host,
                        Err(e) => {
                            errors.lock().push((host.address, e));
                            continue 'hosts;
                        }
                    }
                }
                Err(e) if e.is_safe_to_try_next_host() => {
                    // The request never reached a server; no policy consult.
                    errors.lock().push((host.address, e));
                    continue 'hosts;
                }
                Err(e) => {
                    match ctx.policies.retry.on_error(&e, idempotent, attempt) {
                        RetryDecision::RetrySame => {
                            attempt += 1;
                            continue 'same_host;
                        }
                        RetryDecision::RetryNext => {
                            attempt += 1;
                            errors.lock().push((host.address, e));
                            continue 'hosts;
                        }
                        RetryDecision::Rethrow => return Err(ExecutionError::Fatal(e)),
                        RetryDecision::Ignore => {
                            return Ok(QueryResult::empty(conn.address()));
                        }
                    }
                }
            }
        }
    }
}

/// Builds the wire request for an attempt. The protocol version matters:
/// EXECUTE on v5 must echo the prepared result-metadata id.
fn make_request(
    statement: &Statement,
    params: &QueryParams,
    version: ProtocolVersion,
) -> Result<Request, DriverError> {
    Ok(match statement {
        Statement::Simple(s) => Request::Query {
            query: s.query.clone(),
            params: QueryParams {
                values: s.values.clone(),
                ..params.clone()
            },
        },
        Statement::Bound(b) => Request::Execute {
            id: b.prepared.id.clone(),
            result_metadata_id: if version >= ProtocolVersion::V5 {
                b.prepared.result_metadata_id.clone()
            } else {
                None
            },
            params: QueryParams {
                values: b.values.clone(),
                ..params.clone()
            },
        },
        Statement::Batch(b) => Request::Batch {
            kind: b.kind,
            queries: b
                .children
                .iter()
                .map(|child| match child {
                    BatchChild::Simple { query, values } => BatchQuery::Simple {
                        query: query.clone(),
                        values: values.clone(),
                    },
                    BatchChild::Prepared { statement, values } => BatchQuery::Prepared {
                        id: statement.id.clone(),
                        values: values.clone(),
                    },
                })
                .collect(),
            consistency: params.consistency,
            serial_consistency: params.serial_consistency,
            timestamp: params.timestamp,
        },
    })
}

/// Recovers from UNPREPARED by issuing a PREPARE for the reported id on the
/// same connection, so the retried EXECUTE lands on a coordinator that now
/// knows the statement.
async fn reprepare(
    ctx: &ExecutionContext,
    statement: &Statement,
    conn: &Arc<Connection>,
    id: &[u8],
    read_timeout: Duration,
) -> Result<(), DriverError> {
    let registered = ctx.prepared.get(id);
    let query = match (&registered, statement) {
        (Some(prepared), _) => prepared.query.clone(),
        (None, Statement::Bound(b)) if b.prepared.id == id => b.prepared.query.clone(),
        (None, _) => {
            return Err(DriverError::DriverInternalError(format!(
                "coordinator reported unprepared id {} not present in the registry",
                hex::encode(id)
            )));
        }
    };
    debug!(addr = %conn.address(), id = %hex::encode(id), "re-preparing on coordinator");
    let request = Request::Prepare { query };
    let decoded = conn.request(&request, read_timeout).await?;
    match decoded.response {
        Response::Result(CqlResult::Prepared(_)) => Ok(()),
        other => Err(DriverError::ProtocolError(format!(
            "unexpected response to PREPARE: {other:?}"
        ))),
    }
}

fn assemble(decoded: DecodedResponse, coordinator: std::net::SocketAddr) -> QueryResult {
    let mut result = QueryResult::empty(coordinator);
    result.warnings = decoded.warnings;
    result.tracing_id = decoded.tracing_id;
    match decoded.response {
        Response::Result(CqlResult::Rows(rows)) => result.rows = Some(rows),
        Response::Result(CqlResult::SetKeyspace(ks)) => result.keyspace = Some(ks),
        Response::Result(CqlResult::SchemaChange(change)) => result.schema_change = Some(change),
        Response::Result(CqlResult::Void) | Response::Result(CqlResult::Prepared(_)) => {}
        // Non-RESULT responses to QUERY/EXECUTE/BATCH cannot happen on a
        // conforming server; Error frames were already mapped to Err.
        _ => {}
    }
    result
}
