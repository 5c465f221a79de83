// src/core/cluster/session.rs

//! A session: the user-facing query surface over one cluster handle.

use crate::core::DriverError;
use crate::core::cluster::ClusterInner;
use crate::core::execution::{
    self, ExecutionContext, QueryOptions, QueryResult, SimpleStatement, Statement,
};
use crate::core::policies::RoutingInfo;
use crate::core::pool::HostPool;
use crate::core::prepared::PreparedStatement;
use crate::core::protocol::{CqlResult, Request, Response};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A handle for executing statements. Sessions are cheap, share the
/// cluster's pools, and stay valid until the cluster is shut down.
pub struct Session {
    id: Uuid,
    name: String,
    inner: Arc<ClusterInner>,
    ctx: Arc<ExecutionContext>,
}

impl Session {
    pub(crate) fn new(inner: Arc<ClusterInner>, name: String) -> Self {
        let ctx = inner.execution_context();
        Self {
            id: Uuid::new_v4(),
            name,
            inner,
            ctx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The keyspace the session is currently bound to.
    pub fn keyspace(&self) -> Option<String> {
        self.inner.keyspace.read().clone()
    }

    /// The registered prepared statements, as a point-in-time view.
    pub fn prepared_statements(&self) -> Vec<Arc<PreparedStatement>> {
        self.inner.prepared.statements()
    }

    /// Runs a query string with default options.
    pub async fn query(&self, cql: impl Into<String>) -> Result<QueryResult, DriverError> {
        self.execute(
            Statement::Simple(SimpleStatement::new(cql)),
            QueryOptions::default(),
        )
        .await
    }

    /// Runs any statement with explicit options.
    pub async fn execute(
        &self,
        statement: impl Into<Statement>,
        options: QueryOptions,
    ) -> Result<QueryResult, DriverError> {
        if self.inner.is_disposed() {
            return Err(DriverError::Disposed);
        }
        let statement = statement.into();
        let keyspace = self.keyspace();
        let result =
            execution::execute(&self.ctx, &statement, &options, keyspace.as_deref()).await?;
        if let Some(ks) = &result.keyspace {
            // A USE statement rebinds the whole pool set.
            self.inner.set_keyspace(ks);
        }
        Ok(result)
    }

    /// Fetches the next page of a paged result.
    pub async fn query_next_page(
        &self,
        statement: impl Into<Statement>,
        previous: &QueryResult,
        mut options: QueryOptions,
    ) -> Result<Option<QueryResult>, DriverError> {
        let Some(state) = previous.paging_state() else {
            return Ok(None);
        };
        options.paging_state = Some(state);
        self.execute(statement, options).await.map(Some)
    }

    /// Prepares a statement on one load-balanced host, registers it, and
    /// warms the rest of the fleet in the background.
    pub async fn prepare(&self, cql: &str) -> Result<Arc<PreparedStatement>, DriverError> {
        self.prepare_with(cql, false).await
    }

    /// Like [`Session::prepare`], marking the statement idempotent so it is
    /// eligible for transparent retries and speculative execution.
    pub async fn prepare_idempotent(
        &self,
        cql: &str,
    ) -> Result<Arc<PreparedStatement>, DriverError> {
        self.prepare_with(cql, true).await
    }

    async fn prepare_with(
        &self,
        cql: &str,
        idempotent: bool,
    ) -> Result<Arc<PreparedStatement>, DriverError> {
        if self.inner.is_disposed() {
            return Err(DriverError::Disposed);
        }
        let keyspace = self.keyspace();
        let snapshot = self.ctx.metadata.snapshot();
        let routing = RoutingInfo {
            keyspace: keyspace.as_deref(),
            token: None,
        };
        let plan = self
            .ctx
            .policies
            .load_balancing
            .new_query_plan(&routing, &snapshot);
        let read_timeout = self.ctx.config.socket.read_timeout;
        let request = Request::Prepare {
            query: cql.to_string(),
        };

        let mut errors = Vec::new();
        for host in plan {
            let Some(pool) = self.ctx.pools.get(&host.id).map(|p| p.value().clone()) else {
                continue;
            };
            let conn = match pool.borrow().await {
                Ok(conn) => conn,
                Err(e @ DriverError::ClusterClosing) => return Err(e),
                Err(e) => {
                    errors.push((host.address, e));
                    continue;
                }
            };
            match conn.request(&request, read_timeout).await {
                Ok(decoded) => match decoded.response {
                    Response::Result(CqlResult::Prepared(prepared)) => {
                        let statement = PreparedStatement::from_result(
                            prepared,
                            cql.to_string(),
                            keyspace.clone(),
                            idempotent,
                        );
                        let statement = self.ctx.prepared.insert_or_get(statement);
                        debug!(id = %hex::encode(&statement.id), "statement prepared");
                        self.fan_out_prepare(cql, host.id, read_timeout);
                        return Ok(statement);
                    }
                    other => {
                        return Err(DriverError::ProtocolError(format!(
                            "unexpected response to PREPARE: {other:?}"
                        )));
                    }
                },
                Err(e) if e.is_transport() || e == DriverError::ConnectionBusy => {
                    errors.push((host.address, e));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DriverError::NoHostAvailable(errors))
    }

    /// Background best-effort PREPARE on every other Up host.
    fn fan_out_prepare(&self, cql: &str, prepared_on: Uuid, read_timeout: std::time::Duration) {
        let others: Vec<Arc<HostPool>> = self
            .ctx
            .pools
            .iter()
            .filter(|entry| *entry.key() != prepared_on)
            .map(|entry| entry.value().clone())
            .collect();
        if !others.is_empty() {
            self.ctx
                .prepared
                .fan_out(cql.to_string(), others, read_timeout);
        }
    }
}
