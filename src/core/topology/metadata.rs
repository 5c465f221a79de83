// src/core/topology/metadata.rs

//! The process-wide metadata store: a read-copy-update snapshot of hosts,
//! keyspaces and the token ring, plus the observer bus.
//!
//! Readers clone an `Arc` to the current snapshot and keep working against
//! it; the control channel is the only writer. A write swaps in a new
//! snapshot, bumps the revision, and notifies observers outside the critical
//! section.

use crate::core::topology::host::{Host, HostState};
use crate::core::topology::ring::{KeyspaceInfo, TokenRing};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_BUS_CAPACITY: usize = 1024;

/// Notifications delivered to pools and policies after a snapshot swap.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    HostAdded(Uuid),
    HostRemoved(Uuid),
    HostUp(Uuid),
    HostDown(Uuid),
    SchemaChanged,
    /// The control connection is down; metadata may be stale.
    ControlDown,
}

/// One immutable view of the cluster.
#[derive(Debug, Clone, Default)]
pub struct MetadataSnapshot {
    pub revision: u64,
    pub cluster_name: Option<String>,
    pub hosts: HashMap<Uuid, Arc<Host>>,
    /// Keyspace descriptors in the order the control channel discovered them.
    pub keyspaces: IndexMap<String, KeyspaceInfo>,
    pub ring: TokenRing,
}

impl MetadataSnapshot {
    pub fn host(&self, id: &Uuid) -> Option<&Arc<Host>> {
        self.hosts.get(id)
    }

    pub fn host_by_address(&self, address: &SocketAddr) -> Option<&Arc<Host>> {
        self.hosts.values().find(|h| h.address == *address)
    }

    pub fn keyspace(&self, name: &str) -> Option<&KeyspaceInfo> {
        self.keyspaces.get(name)
    }

    /// Hosts currently believed usable, in arbitrary order.
    pub fn up_hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.values().filter(|h| h.is_up()).cloned().collect()
    }
}

/// The shared store. Mutation happens only through [`Metadata::apply`],
/// which the control channel drives.
#[derive(Debug)]
pub struct Metadata {
    snapshot: RwLock<Arc<MetadataSnapshot>>,
    revision: AtomicU64,
    events: broadcast::Sender<(TopologyEvent, u64)>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

impl Metadata {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            snapshot: RwLock::new(Arc::new(MetadataSnapshot::default())),
            revision: AtomicU64::new(0),
            events,
        }
    }

    /// The current snapshot. Cheap; holds no lock beyond the clone.
    pub fn snapshot(&self) -> Arc<MetadataSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Subscribes to topology notifications. Each carries the revision of
    /// the snapshot it was produced against, so late readers can reconcile.
    pub fn subscribe(&self) -> broadcast::Receiver<(TopologyEvent, u64)> {
        self.events.subscribe()
    }

    /// Applies a mutation: `f` builds the next snapshot and the events that
    /// describe the change. Observers are notified after the swap.
    pub fn apply<F>(&self, f: F) -> Arc<MetadataSnapshot>
    where
        F: FnOnce(&MetadataSnapshot) -> (MetadataSnapshot, Vec<TopologyEvent>),
    {
        let (next, events) = {
            let mut guard = self.snapshot.write();
            let (mut next, events) = f(guard.as_ref());
            next.revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
            let next = Arc::new(next);
            *guard = next.clone();
            (next, events)
        };
        for event in events {
            // Send errors only mean nobody is subscribed right now.
            let _ = self.events.send((event, next.revision));
        }
        next
    }

    /// Emits an event without touching the snapshot (control-channel
    /// liveness notifications).
    pub fn notify(&self, event: TopologyEvent) {
        let _ = self.events.send((event, self.revision()));
    }

    /// Convenience mutation: flips one host's state and reports the matching
    /// event. A no-op when the host is unknown or already in that state.
    pub fn set_host_state(&self, id: Uuid, state: HostState) {
        self.apply(|current| {
            let mut next = current.clone();
            let mut events = Vec::new();
            if let Some(host) = next.hosts.get(&id)
                && host.state != state
            {
                let updated = Arc::new(host.with_state(state));
                next.hosts.insert(id, updated);
                events.push(match state {
                    HostState::Up | HostState::Unknown => TopologyEvent::HostUp(id),
                    HostState::Down | HostState::Ignored => TopologyEvent::HostDown(id),
                });
            }
            (next, events)
        });
    }
}
