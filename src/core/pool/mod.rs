// src/core/pool/mod.rs

//! The per-host connection pool: a distance-sized set of connections with
//! round-robin borrowing and a reconnection task driven by the reconnection
//! policy.
//!
//! The live-connection list is copy-on-write: borrowers read an `Arc` slice
//! without locking the writers; mutation clones, edits and swaps. Pool
//! transitions (refill, resize, close) are serialized by a single refill
//! task guarded by an atomic flag.

use crate::config::Config;
use crate::core::DriverError;
use crate::core::auth::AuthProvider;
use crate::core::connection::Connection;
use crate::core::policies::{Policies, ReconnectionSchedule as _};
use crate::core::topology::HostDistance;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct HostPool {
    host_id: Uuid,
    addr: SocketAddr,
    config: Arc<Config>,
    policies: Arc<Policies>,
    auth: Option<Arc<dyn AuthProvider>>,
    tls: Option<TlsConnector>,
    distance: RwLock<HostDistance>,
    connections: RwLock<Arc<Vec<Arc<Connection>>>>,
    next: AtomicUsize,
    closed: AtomicBool,
    refill_running: AtomicBool,
    keyspace: RwLock<Option<String>>,
    conn_established: tokio::sync::Notify,
}

impl HostPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host_id: Uuid,
        addr: SocketAddr,
        distance: HostDistance,
        config: Arc<Config>,
        policies: Arc<Policies>,
        auth: Option<Arc<dyn AuthProvider>>,
        tls: Option<TlsConnector>,
        keyspace: Option<String>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            host_id,
            addr,
            config,
            policies,
            auth,
            tls,
            distance: RwLock::new(distance),
            connections: RwLock::new(Arc::new(Vec::new())),
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            refill_running: AtomicBool::new(false),
            keyspace: RwLock::new(keyspace),
            conn_established: tokio::sync::Notify::new(),
        });
        pool.ensure_filled();
        pool
    }

    pub fn host_id(&self) -> Uuid {
        self.host_id
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().iter().filter(|c| !c.is_closed()).count()
    }

    fn target_size(&self) -> usize {
        match *self.distance.read() {
            HostDistance::Local => self.config.pooling.core_local,
            HostDistance::Remote => self.config.pooling.core_remote,
            HostDistance::Ignored => 0,
        }
    }

    /// Round-robin borrow over live connections. An empty pool suspends
    /// briefly while the refill task opens the first connection; a pool
    /// whose connections are all saturated fails with `HostBusy` right
    /// away, so the executor can move on to the next host in its plan.
    pub async fn borrow(self: &Arc<Self>) -> Result<Arc<Connection>, DriverError> {
        // One wait-and-retry round at most.
        for waited in 0..2 {
            if self.is_closed() {
                return Err(DriverError::ClusterClosing);
            }
            // Register interest before the emptiness check so a connection
            // landing in between still wakes the wait below.
            let mut established = std::pin::pin!(self.conn_established.notified());
            established.as_mut().enable();
            match self.try_borrow() {
                Some(conn) => return Ok(conn),
                None if self.connections.read().is_empty() && waited == 0 => {
                    self.ensure_filled();
                    let _ = tokio::time::timeout(
                        self.config.socket.connect_timeout,
                        established,
                    )
                    .await;
                }
                None => return Err(DriverError::HostBusy),
            }
        }
        Err(DriverError::HostBusy)
    }

    fn try_borrow(self: &Arc<Self>) -> Option<Arc<Connection>> {
        let connections = self.connections.read().clone();
        if connections.is_empty() {
            return None;
        }
        let offset = self.next.fetch_add(1, Ordering::Relaxed);
        let mut saw_dead = false;
        for i in 0..connections.len() {
            let conn = &connections[(offset + i) % connections.len()];
            if conn.is_closed() {
                saw_dead = true;
                continue;
            }
            if conn.has_free_stream() {
                return Some(conn.clone());
            }
        }
        if saw_dead {
            self.ensure_filled();
        }
        None
    }

    /// Re-sizes the pool for a policy-driven distance change. `Ignored`
    /// drains the pool entirely.
    pub fn set_distance(self: &Arc<Self>, distance: HostDistance) {
        let changed = {
            let mut guard = self.distance.write();
            let changed = *guard != distance;
            *guard = distance;
            changed
        };
        if !changed {
            return;
        }
        debug!(addr = %self.addr, ?distance, "pool distance changed");
        if distance == HostDistance::Ignored {
            self.drain("host ignored by the load-balancing policy");
        } else {
            self.ensure_filled();
        }
    }

    /// Records the session keyspace and binds existing connections to it.
    pub fn set_keyspace(self: &Arc<Self>, keyspace: String) {
        *self.keyspace.write() = Some(keyspace.clone());
        let connections = self.connections.read().clone();
        let timeout = self.config.socket.read_timeout;
        for conn in connections.iter().cloned() {
            let ks = keyspace.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.use_keyspace(&ks, timeout).await {
                    warn!(addr = %conn.address(), error = %e, "failed to bind keyspace");
                }
            });
        }
    }

    /// Starts the refill task unless one is already running.
    pub fn ensure_filled(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        if self
            .refill_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            pool.run_refill().await;
            pool.refill_running.store(false, Ordering::Release);
            // A deficit may have appeared while the flag was being cleared.
            if !pool.is_closed() && pool.connection_count() < pool.target_size() {
                pool.ensure_filled();
            }
        });
    }

    async fn run_refill(self: &Arc<Self>) {
        let mut schedule = self.policies.reconnection.new_schedule();
        loop {
            if self.is_closed() {
                return;
            }
            self.prune_closed();
            let live = self.connection_count();
            let target = self.target_size();
            if live >= target {
                return;
            }
            match Connection::open(
                self.addr,
                &self.config,
                self.auth.clone(),
                self.tls.as_ref(),
                None,
            )
            .await
            {
                Ok(conn) => {
                    let ks = self.keyspace.read().clone();
                    if let Some(ks) = ks {
                        if let Err(e) = conn
                            .use_keyspace(&ks, self.config.socket.read_timeout)
                            .await
                        {
                            warn!(addr = %self.addr, error = %e, "failed to bind keyspace on a new connection");
                            conn.close("keyspace binding failed");
                            tokio::time::sleep(schedule.next_delay()).await;
                            continue;
                        }
                    }
                    self.watch_connection(&conn);
                    self.push_connection(conn);
                    debug!(addr = %self.addr, live = self.connection_count(), target,
                        "pool connection established");
                    // Success resets the backoff.
                    schedule = self.policies.reconnection.new_schedule();
                }
                Err(e) => {
                    if self.is_closed() {
                        return;
                    }
                    let delay = schedule.next_delay();
                    warn!(addr = %self.addr, error = %e, ?delay, "connection attempt failed; backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn push_connection(&self, conn: Arc<Connection>) {
        {
            let mut guard = self.connections.write();
            let mut next: Vec<Arc<Connection>> = guard.iter().cloned().collect();
            next.push(conn);
            *guard = Arc::new(next);
        }
        self.conn_established.notify_waiters();
    }

    fn prune_closed(&self) {
        let mut guard = self.connections.write();
        if guard.iter().any(|c| c.is_closed()) {
            let next: Vec<Arc<Connection>> =
                guard.iter().filter(|c| !c.is_closed()).cloned().collect();
            *guard = Arc::new(next);
        }
    }

    /// Reacts to a connection death by topping the pool back up.
    fn watch_connection(self: &Arc<Self>, conn: &Arc<Connection>) {
        let pool = Arc::downgrade(self);
        let mut closed_rx = conn.subscribe_closed();
        tokio::spawn(async move {
            // Either the value flips to true or the connection is gone.
            let _ = closed_rx.wait_for(|closed| *closed).await;
            if let Some(pool) = pool.upgrade() {
                pool.prune_closed();
                pool.ensure_filled();
            }
        });
    }

    fn drain(&self, reason: &str) {
        let drained = {
            let mut guard = self.connections.write();
            std::mem::replace(&mut *guard, Arc::new(Vec::new()))
        };
        for conn in drained.iter() {
            conn.close(reason);
        }
    }

    /// Closes every connection; pending requests fail as "cluster closing".
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(addr = %self.addr, "closing host pool");
        self.drain("cluster closing");
    }
}
