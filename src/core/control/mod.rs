// src/core/control/mod.rs

//! The control channel: one dedicated connection used to watch the cluster.
//!
//! It probes candidate endpoints in order, REGISTERs for topology, status
//! and schema events *before* the initial refresh (so no event can fall in
//! the gap), then applies debounced refreshes as events arrive. When the
//! connection drops it reconnects over the remaining candidates with
//! policy-driven backoff; until then metadata reads serve the stale
//! snapshot and only a control-down notification goes out.

pub mod refresh;

pub use refresh::RefreshScope;

use crate::config::Config;
use crate::core::DriverError;
use crate::core::auth::AuthProvider;
use crate::core::connection::Connection;
use crate::core::policies::{Policies, ReconnectionSchedule as _};
use crate::core::protocol::{Request, ServerEvent};
use crate::core::topology::{HostState, Metadata, TopologyEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

const WATCHED_EVENTS: [&str; 3] = ["TOPOLOGY_CHANGE", "STATUS_CHANGE", "SCHEMA_CHANGE"];

pub struct ControlChannel {
    config: Arc<Config>,
    policies: Arc<Policies>,
    metadata: Arc<Metadata>,
    auth: Option<Arc<dyn AuthProvider>>,
    tls: Option<TlsConnector>,
    contact_points: Vec<SocketAddr>,
    conn: tokio::sync::RwLock<Option<Arc<Connection>>>,
}

impl ControlChannel {
    pub fn new(
        config: Arc<Config>,
        policies: Arc<Policies>,
        metadata: Arc<Metadata>,
        auth: Option<Arc<dyn AuthProvider>>,
        tls: Option<TlsConnector>,
        contact_points: Vec<SocketAddr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            policies,
            metadata,
            auth,
            tls,
            contact_points,
            conn: tokio::sync::RwLock::new(None),
        })
    }

    /// The endpoint the control connection is currently attached to.
    pub async fn current_endpoint(&self) -> Option<SocketAddr> {
        self.conn.read().await.as_ref().map(|c| c.address())
    }

    /// The long-running control task. `ready_tx` fires after the first
    /// successful register-and-refresh cycle; bootstrap awaits it under the
    /// init timeout.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
        ready_tx: oneshot::Sender<Result<(), DriverError>>,
    ) {
        let mut ready_tx = Some(ready_tx);
        let mut schedule = None;

        loop {
            let candidates = self.candidate_endpoints();
            let failure = match self.connect_any(&candidates).await {
                Ok((conn, event_rx)) => {
                    *self.conn.write().await = Some(conn.clone());
                    info!(addr = %conn.address(), "control connection established");

                    // Register first, then refresh: an event raced against
                    // the refresh is re-applied, never missed.
                    let failure = match self.register_and_refresh(&conn).await {
                        Ok(()) => {
                            schedule = None;
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                            self.event_loop(&conn, event_rx, &mut shutdown_rx).await;
                            None
                        }
                        Err(e) => {
                            warn!(addr = %conn.address(), error = %e,
                                "control bootstrap on this endpoint failed");
                            conn.close("control bootstrap failed");
                            Some(e)
                        }
                    };

                    *self.conn.write().await = None;
                    if is_shutdown(&mut shutdown_rx) {
                        conn.close("cluster shutting down");
                        return;
                    }
                    self.metadata.notify(TopologyEvent::ControlDown);
                    failure
                }
                Err(e) => Some(e),
            };

            if let Some(e) = failure {
                if is_shutdown(&mut shutdown_rx) {
                    return;
                }
                let delay = schedule
                    .get_or_insert_with(|| self.policies.reconnection.new_schedule())
                    .next_delay();
                warn!(error = %e, ?delay, "control channel unavailable; backing off");
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// Known hosts first (they are fresher than the static contact points),
    /// then the configured contact points, deduplicated, all translated.
    fn candidate_endpoints(&self) -> Vec<SocketAddr> {
        let snapshot = self.metadata.snapshot();
        let mut candidates: Vec<SocketAddr> = snapshot
            .up_hosts()
            .iter()
            .map(|h| h.address)
            .collect();
        for cp in &self.contact_points {
            let translated = self.policies.address_translator.translate(*cp);
            if !candidates.contains(&translated) {
                candidates.push(translated);
            }
        }
        candidates
    }

    async fn connect_any(
        &self,
        candidates: &[SocketAddr],
    ) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<ServerEvent>), DriverError> {
        let mut last_error = DriverError::DriverInternalError("no contact points".into());
        for addr in candidates {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            match Connection::open(
                *addr,
                &self.config,
                self.auth.clone(),
                self.tls.as_ref(),
                Some(event_tx),
            )
            .await
            {
                Ok(conn) => return Ok((conn, event_rx)),
                Err(e) => {
                    debug!(%addr, error = %e, "control candidate failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn register_and_refresh(&self, conn: &Arc<Connection>) -> Result<(), DriverError> {
        let register = Request::Register {
            events: WATCHED_EVENTS.iter().map(|s| s.to_string()).collect(),
        };
        conn.request(&register, self.config.socket.read_timeout)
            .await?;
        refresh::refresh(
            conn,
            &self.metadata,
            &self.config,
            &self.policies.address_translator,
            RefreshScope::ALL,
        )
        .await
    }

    /// Applies incoming events until the connection dies or shutdown is
    /// requested. Refreshes are coalesced within the debounce window.
    async fn event_loop(
        &self,
        conn: &Arc<Connection>,
        mut event_rx: mpsc::UnboundedReceiver<ServerEvent>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        let mut closed_rx = conn.subscribe_closed();
        let mut pending = RefreshScope::default();
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    conn.close("cluster shutting down");
                    return;
                }
                _ = async {
                    loop {
                        if *closed_rx.borrow() {
                            return;
                        }
                        if closed_rx.changed().await.is_err() {
                            return;
                        }
                    }
                } => {
                    return;
                }
                event = event_rx.recv() => {
                    let Some(event) = event else { return };
                    let scope = self.apply_event(event);
                    if !scope.is_empty() {
                        pending.merge(scope);
                        deadline.get_or_insert_with(|| {
                            Instant::now() + self.config.event_debounce
                        });
                    }
                }
                _ = maybe_sleep_until(deadline) => {
                    let scope = std::mem::take(&mut pending);
                    deadline = None;
                    if let Err(e) = refresh::refresh(
                        conn,
                        &self.metadata,
                        &self.config,
                        &self.policies.address_translator,
                        scope,
                    )
                    .await
                    {
                        warn!(error = %e, "metadata refresh failed; closing control connection");
                        conn.close("refresh failed");
                        return;
                    }
                }
            }
        }
    }

    /// Immediate effects of one event; returns what needs a refresh.
    fn apply_event(&self, event: ServerEvent) -> RefreshScope {
        debug!(?event, "control event");
        match event {
            ServerEvent::TopologyChange { .. } => RefreshScope {
                hosts: true,
                schema: false,
            },
            ServerEvent::SchemaChange(_) => RefreshScope {
                hosts: false,
                schema: true,
            },
            ServerEvent::StatusChange { change, address } => {
                // Status flips don't need a round trip to the system tables.
                let snapshot = self.metadata.snapshot();
                let translated = self.policies.address_translator.translate(address);
                let host = snapshot
                    .host_by_address(&translated)
                    .or_else(|| {
                        snapshot
                            .hosts
                            .values()
                            .find(|h| h.broadcast_address == Some(address.ip()))
                    })
                    .cloned();
                match host {
                    Some(host) => {
                        let state = if change == "UP" {
                            HostState::Up
                        } else {
                            HostState::Down
                        };
                        self.metadata.set_host_state(host.id, state);
                        RefreshScope::default()
                    }
                    None => {
                        // A status change for a node the driver has never
                        // seen implies the host list is stale.
                        RefreshScope {
                            hosts: true,
                            schema: false,
                        }
                    }
                }
            }
        }
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn is_shutdown(shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        shutdown_rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}
