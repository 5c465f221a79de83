// src/core/policies/load_balancing.rs

//! Load-balancing: host distance assignment and query-plan generation.

use crate::core::topology::{Host, HostDistance, MetadataSnapshot};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Routing facts the executor derives from a statement before asking for a
/// plan.
#[derive(Debug, Clone, Default)]
pub struct RoutingInfo<'a> {
    pub keyspace: Option<&'a str>,
    /// The partition token of the routing key, when one could be computed.
    pub token: Option<i64>,
}

/// A finite, non-restartable sequence of candidate coordinators. Yields each
/// host at most once; safe to abandon mid-way.
#[derive(Debug)]
pub struct QueryPlan {
    hosts: Vec<Arc<Host>>,
    cursor: usize,
}

impl QueryPlan {
    pub fn new(hosts: Vec<Arc<Host>>) -> Self {
        Self { hosts, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.hosts.len() - self.cursor
    }
}

impl Iterator for QueryPlan {
    type Item = Arc<Host>;

    fn next(&mut self) -> Option<Self::Item> {
        let host = self.hosts.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(host)
    }
}

/// The load-balancing contract. Implementations are pure with respect to the
/// snapshot they are handed and must not block.
pub trait LoadBalancingPolicy: Send + Sync {
    /// Called once, with the first metadata snapshot after the initial
    /// refresh.
    fn initialize(&self, snapshot: &MetadataSnapshot);

    fn distance(&self, host: &Host) -> HostDistance;

    fn new_query_plan(&self, routing: &RoutingInfo<'_>, snapshot: &MetadataSnapshot) -> QueryPlan;
}

/// The default policy: token-aware on top of datacenter-aware round-robin.
///
/// Replicas of the routing key in the local datacenter come first (rotated
/// per request so the load spreads), then the remaining local hosts, then
/// remote hosts. Hosts believed down are excluded from plans entirely.
pub struct DefaultLoadBalancing {
    local_dc: RwLock<Option<String>>,
    counter: AtomicUsize,
}

impl DefaultLoadBalancing {
    pub fn new() -> Self {
        Self {
            local_dc: RwLock::new(None),
            counter: AtomicUsize::new(0),
        }
    }

    /// Pins the local datacenter instead of inferring it from the first
    /// contacted host.
    pub fn with_local_dc(dc: impl Into<String>) -> Self {
        Self {
            local_dc: RwLock::new(Some(dc.into())),
            counter: AtomicUsize::new(0),
        }
    }

    fn is_local(&self, host: &Host) -> bool {
        match self.local_dc.read().as_deref() {
            Some(dc) => host.in_datacenter(dc),
            // Until a local DC is known every host counts as local.
            None => true,
        }
    }
}

impl Default for DefaultLoadBalancing {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for DefaultLoadBalancing {
    fn initialize(&self, snapshot: &MetadataSnapshot) {
        let mut local_dc = self.local_dc.write();
        if local_dc.is_none() {
            // Adopt the datacenter of the first known host, which is the
            // node the control channel bootstrapped from.
            *local_dc = snapshot
                .hosts
                .values()
                .find_map(|h| h.datacenter.clone());
        }
    }

    fn distance(&self, host: &Host) -> HostDistance {
        if self.is_local(host) {
            HostDistance::Local
        } else {
            HostDistance::Remote
        }
    }

    fn new_query_plan(&self, routing: &RoutingInfo<'_>, snapshot: &MetadataSnapshot) -> QueryPlan {
        let offset = self.counter.fetch_add(1, Ordering::Relaxed);

        // Token-aware head: replicas of the routing key, local ones first.
        let mut plan: Vec<Arc<Host>> = Vec::new();
        if let (Some(token), Some(ks_name)) = (routing.token, routing.keyspace)
            && let Some(keyspace) = snapshot.keyspace(ks_name)
        {
            let replicas = snapshot.ring.replicas(token, keyspace, &snapshot.hosts);
            let (local, remote): (Vec<_>, Vec<_>) = replicas
                .iter()
                .filter_map(|id| snapshot.host(id))
                .filter(|h| h.is_up())
                .cloned()
                .partition(|h| self.is_local(h));
            plan.extend(local);
            plan.extend(remote);
        }

        // Round-robin tail over the hosts not already planned.
        let mut local_rest: Vec<Arc<Host>> = Vec::new();
        let mut remote_rest: Vec<Arc<Host>> = Vec::new();
        for host in snapshot.hosts.values() {
            if !host.is_up() || plan.iter().any(|p| p.id == host.id) {
                continue;
            }
            if self.is_local(host) {
                local_rest.push(host.clone());
            } else {
                remote_rest.push(host.clone());
            }
        }
        // Deterministic order before rotation, so tests can reason about it.
        local_rest.sort_by_key(|h| h.address);
        remote_rest.sort_by_key(|h| h.address);
        if !local_rest.is_empty() {
            let len = local_rest.len();
            local_rest.rotate_left(offset % len);
        }
        if !remote_rest.is_empty() {
            let len = remote_rest.len();
            remote_rest.rotate_left(offset % len);
        }
        plan.extend(local_rest);
        plan.extend(remote_rest);

        QueryPlan::new(plan)
    }
}
