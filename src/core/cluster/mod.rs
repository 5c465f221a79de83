// src/core/cluster/mod.rs

//! The cluster handle: contact-point resolution, the stored initialization
//! future, pool lifecycle driven by topology events, and idempotent
//! shutdown.

mod session;

pub use session::Session;

use crate::config::Config;
use crate::core::DriverError;
use crate::core::auth::{AuthProvider, PlainTextAuthProvider};
use crate::core::control::ControlChannel;
use crate::core::execution::ExecutionContext;
use crate::core::policies::Policies;
use crate::core::pool::HostPool;
use crate::core::prepared::PreparedRegistry;
use crate::core::tls;
use crate::core::topology::{Host, Metadata, TopologyEvent};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, oneshot};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClusterState {
    New,
    Ready,
    Failed,
    Disposed,
}

pub(crate) struct ClusterInner {
    pub config: Arc<Config>,
    pub policies: Arc<Policies>,
    pub metadata: Arc<Metadata>,
    pub pools: Arc<DashMap<Uuid, Arc<HostPool>>>,
    pub prepared: Arc<PreparedRegistry>,
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub tls: Option<TlsConnector>,
    pub keyspace: RwLock<Option<String>>,
    state: RwLock<ClusterState>,
    init: tokio::sync::OnceCell<Result<(), DriverError>>,
    control: std::sync::OnceLock<Arc<ControlChannel>>,
    shutdown_tx: broadcast::Sender<()>,
    session_counter: AtomicUsize,
}

impl Cluster {
    /// The endpoint the control connection is currently attached to, when
    /// the cluster is initialized and the control channel is connected.
    pub async fn control_endpoint(&self) -> Option<std::net::SocketAddr> {
        match self.inner.control.get() {
            Some(control) => control.current_endpoint().await,
            None => None,
        }
    }
}

/// An owned handle to one logical cluster. Sessions borrow it; dropping the
/// handle without [`Cluster::shutdown`] leaves background tasks to wind
/// down on their own.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Builds a cluster handle with default policies. Nothing connects
    /// until the first [`Cluster::connect`].
    pub fn new(config: Config) -> Result<Cluster, DriverError> {
        let policies = Policies::from_config(&config);
        Self::with_policies(config, policies, None)
    }

    /// Builds a cluster handle with explicit policies and, optionally, a
    /// custom authentication provider. Configured plain-text credentials
    /// are used when no provider is given.
    pub fn with_policies(
        config: Config,
        policies: Policies,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Result<Cluster, DriverError> {
        config
            .validate()
            .map_err(|e| DriverError::ConfigError(e.to_string()))?;
        let auth = auth.or_else(|| {
            config.auth.as_ref().map(|a| {
                Arc::new(PlainTextAuthProvider::new(&a.username, &a.password))
                    as Arc<dyn AuthProvider>
            })
        });
        let tls_connector = tls::build_connector(config.tls.as_ref())?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Cluster {
            inner: Arc::new(ClusterInner {
                config: Arc::new(config),
                policies: Arc::new(policies),
                metadata: Arc::new(Metadata::new()),
                pools: Arc::new(DashMap::new()),
                prepared: Arc::new(PreparedRegistry::new()),
                auth,
                tls: tls_connector,
                keyspace: RwLock::new(None),
                state: RwLock::new(ClusterState::New),
                init: tokio::sync::OnceCell::new(),
                control: std::sync::OnceLock::new(),
                shutdown_tx,
                session_counter: AtomicUsize::new(0),
            }),
        })
    }

    /// Shared topology view, readable regardless of session state.
    pub fn metadata(&self) -> Arc<Metadata> {
        self.inner.metadata.clone()
    }

    /// Live connection counts per host pool, for diagnostics.
    pub fn pool_connection_counts(&self) -> std::collections::HashMap<Uuid, usize> {
        self.inner
            .pools
            .iter()
            .map(|entry| (*entry.key(), entry.value().connection_count()))
            .collect()
    }

    /// Opens a session, initializing the cluster on first use. A failed
    /// initialization is sticky: the stored cause is re-surfaced verbatim
    /// until a new cluster handle is built.
    pub async fn connect(&self) -> Result<Session, DriverError> {
        self.connect_inner(None).await
    }

    /// Like [`Cluster::connect`], binding every session connection to a
    /// keyspace.
    pub async fn connect_keyspace(&self, keyspace: &str) -> Result<Session, DriverError> {
        self.connect_inner(Some(keyspace.to_string())).await
    }

    async fn connect_inner(&self, keyspace: Option<String>) -> Result<Session, DriverError> {
        if *self.inner.state.read() == ClusterState::Disposed {
            return Err(DriverError::Disposed);
        }
        let inner = self.inner.clone();
        let init = self
            .inner
            .init
            .get_or_init(|| async move { initialize(inner).await })
            .await;
        if let Err(e) = init {
            return Err(e.clone());
        }
        if *self.inner.state.read() == ClusterState::Disposed {
            return Err(DriverError::Disposed);
        }

        if let Some(ks) = keyspace {
            self.inner.set_keyspace(&ks);
        }
        let number = self.inner.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}{}", self.inner.config.session_name, number);
        Ok(Session::new(self.inner.clone(), name))
    }

    /// Idempotent teardown: fails in-flight requests with "cluster
    /// closing", closes pools and the control channel, and leaves the
    /// handle permanently disposed.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.write();
            if *state == ClusterState::Disposed {
                return;
            }
            *state = ClusterState::Disposed;
        }
        info!("shutting down cluster");
        let _ = self.inner.shutdown_tx.send(());
        for entry in self.inner.pools.iter() {
            entry.value().close();
        }
        self.inner.pools.clear();
    }
}

impl ClusterInner {
    pub(crate) fn execution_context(self: &Arc<Self>) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext {
            config: self.config.clone(),
            policies: self.policies.clone(),
            metadata: self.metadata.clone(),
            pools: self.pools.clone(),
            prepared: self.prepared.clone(),
        })
    }

    pub(crate) fn is_disposed(&self) -> bool {
        *self.state.read() == ClusterState::Disposed
    }

    /// Cluster-wide keyspace binding, applied to every pool.
    pub(crate) fn set_keyspace(&self, keyspace: &str) {
        *self.keyspace.write() = Some(keyspace.to_string());
        for entry in self.pools.iter() {
            entry.value().set_keyspace(keyspace.to_string());
        }
    }

    /// Idempotent: the bootstrap path and the topology listener can both
    /// learn of a host; only the first materializes a pool.
    fn create_pool(self: &Arc<Self>, host: &Host) {
        let distance = self.policies.load_balancing.distance(host);
        self.pools.entry(host.id).or_insert_with(|| {
            HostPool::new(
                host.id,
                host.address,
                distance,
                self.config.clone(),
                self.policies.clone(),
                self.auth.clone(),
                self.tls.clone(),
                self.keyspace.read().clone(),
            )
        });
    }
}

/// Runs once per cluster: resolves contact points, starts the control task,
/// and builds the initial pool set. Wrapped in the init timeout
/// `max(floor, 2 × connect_timeout × host_count)`.
async fn initialize(inner: Arc<ClusterInner>) -> Result<(), DriverError> {
    let contact_points = resolve_contact_points(&inner.config).await?;
    let host_count = contact_points.len();
    let timeout = inner
        .config
        .init_timeout_floor
        .max(inner.config.socket.connect_timeout * (2 * host_count as u32));
    info!(?contact_points, ?timeout, "initializing cluster");

    let control = ControlChannel::new(
        inner.config.clone(),
        inner.policies.clone(),
        inner.metadata.clone(),
        inner.auth.clone(),
        inner.tls.clone(),
        contact_points,
    );
    let _ = inner.control.set(control.clone());

    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(control.clone().run(inner.shutdown_tx.subscribe(), ready_tx));
    tokio::spawn(run_topology_listener(
        Arc::downgrade(&inner),
        inner.metadata.subscribe(),
        inner.shutdown_tx.subscribe(),
    ));

    let outcome = match tokio::time::timeout(timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_)) => Err(DriverError::DriverInternalError(
            "control task ended before the cluster became ready".into(),
        )),
        Err(_) => Err(DriverError::OperationTimedOut(format!(
            "cluster initialization did not complete within {timeout:?}"
        ))),
    };

    match outcome {
        Ok(()) => {
            let snapshot = inner.metadata.snapshot();
            inner.policies.load_balancing.initialize(&snapshot);
            for host in snapshot.hosts.values() {
                inner.create_pool(host);
            }
            {
                // A shutdown racing the init keeps its Disposed verdict.
                let mut state = inner.state.write();
                if *state != ClusterState::Disposed {
                    *state = ClusterState::Ready;
                }
            }
            info!(
                hosts = snapshot.hosts.len(),
                cluster = snapshot.cluster_name.as_deref().unwrap_or("unknown"),
                "cluster ready"
            );
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "cluster initialization failed");
            {
                let mut state = inner.state.write();
                if *state != ClusterState::Disposed {
                    *state = ClusterState::Failed;
                }
            }
            let _ = inner.shutdown_tx.send(());
            Err(e)
        }
    }
}

/// Resolves contact points (hostnames or socket addresses) into a
/// deduplicated endpoint set. An empty list falls back to one implicit
/// loopback candidate on the configured port.
async fn resolve_contact_points(config: &Config) -> Result<Vec<SocketAddr>, DriverError> {
    if config.contact_points.is_empty() {
        let fallback = SocketAddr::from(([127, 0, 0, 1], config.port));
        debug!(%fallback, "no contact points configured; using the implicit loopback candidate");
        return Ok(vec![fallback]);
    }

    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    for cp in &config.contact_points {
        let with_port = if cp.contains(':') && cp.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
            cp.clone()
        } else {
            format!("{cp}:{}", config.port)
        };
        match tokio::net::lookup_host(&with_port).await {
            Ok(addrs) => {
                for addr in addrs {
                    if seen.insert(addr) {
                        resolved.push(addr);
                    }
                }
            }
            Err(e) => {
                warn!(contact_point = %cp, error = %e, "cannot resolve contact point");
            }
        }
    }
    if resolved.is_empty() {
        return Err(DriverError::ConfigError(
            "none of the contact points could be resolved".into(),
        ));
    }
    Ok(resolved)
}

/// Keeps the pool set aligned with topology notifications: new hosts get
/// pools, removed hosts lose them, recovered hosts are re-prepared.
async fn run_topology_listener(
    inner: std::sync::Weak<ClusterInner>,
    mut events: broadcast::Receiver<(TopologyEvent, u64)>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown_rx.recv() => return,
            event = events.recv() => event,
        };
        let Some(inner) = inner.upgrade() else { return };
        match event {
            Ok((TopologyEvent::HostAdded(id), _)) => {
                if let Some(host) = inner.metadata.snapshot().host(&id).cloned() {
                    debug!(host = %id, addr = %host.address, "adding pool for new host");
                    inner.create_pool(&host);
                }
            }
            Ok((TopologyEvent::HostRemoved(id), _)) => {
                if let Some((_, pool)) = inner.pools.remove(&id) {
                    debug!(host = %id, "removing pool for departed host");
                    pool.close();
                }
            }
            Ok((TopologyEvent::HostUp(id), _)) => {
                match inner.pools.get(&id).map(|p| p.value().clone()) {
                    Some(pool) => pool.ensure_filled(),
                    None => {
                        if let Some(host) = inner.metadata.snapshot().host(&id).cloned() {
                            inner.create_pool(&host);
                        }
                    }
                }
                if inner.config.query.reprepare_on_up
                    && let Some(pool) = inner.pools.get(&id).map(|p| p.value().clone())
                {
                    inner
                        .prepared
                        .reprepare_on_host(pool, inner.config.socket.read_timeout);
                }
            }
            Ok((TopologyEvent::HostDown(_), _)) => {
                // The pool keeps its reconnection schedule; nothing to do.
            }
            Ok((TopologyEvent::SchemaChanged, _)) | Ok((TopologyEvent::ControlDown, _)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "topology listener lagged behind the event bus");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
