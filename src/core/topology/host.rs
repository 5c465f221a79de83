// src/core/topology/host.rs

//! Node identity and per-node attributes as observed by the control channel.

use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

/// Liveness of a host as currently believed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostState {
    #[default]
    Unknown,
    Up,
    Down,
    /// Excluded by the load-balancing policy; no pool is kept.
    Ignored,
}

/// Distance assigned by the load-balancing policy, controlling pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDistance {
    Local,
    Remote,
    Ignored,
}

/// One node of the cluster. Hosts are immutable values inside a metadata
/// snapshot; a state change produces a new snapshot.
#[derive(Debug, Clone)]
pub struct Host {
    /// Cluster-wide host id, from `system.local`/`system.peers`.
    pub id: Uuid,
    /// The endpoint the driver connects to, after address translation.
    pub address: SocketAddr,
    pub broadcast_address: Option<IpAddr>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub release_version: Option<String>,
    /// Token ownership, parsed from the `tokens` system column.
    pub tokens: Vec<i64>,
    pub state: HostState,
}

impl Host {
    pub fn is_up(&self) -> bool {
        matches!(self.state, HostState::Up | HostState::Unknown)
    }

    pub fn in_datacenter(&self, dc: &str) -> bool {
        self.datacenter.as_deref() == Some(dc)
    }

    /// Returns a copy with a different liveness state.
    pub fn with_state(&self, state: HostState) -> Host {
        let mut host = self.clone();
        host.state = state;
        host
    }
}
