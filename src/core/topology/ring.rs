// src/core/topology/ring.rs

//! The token ring: a sorted map of token → owning host, with
//! replication-strategy-aware replica selection.

use crate::core::topology::host::Host;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;
use uuid::Uuid;

/// How a keyspace places replicas on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationStrategy {
    Simple {
        replication_factor: usize,
    },
    NetworkTopology {
        /// Replication factor per datacenter name.
        datacenters: HashMap<String, usize>,
    },
    /// Local or unrecognized strategies; token-aware routing is skipped.
    Other {
        class: String,
    },
}

impl ReplicationStrategy {
    /// Parses the `replication` map of `system_schema.keyspaces`.
    pub fn from_replication_map(map: &HashMap<String, String>) -> ReplicationStrategy {
        let class = map.get("class").map(String::as_str).unwrap_or_default();
        let short = class.rsplit('.').next().unwrap_or(class);
        match short {
            "SimpleStrategy" => ReplicationStrategy::Simple {
                replication_factor: map
                    .get("replication_factor")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
            },
            "NetworkTopologyStrategy" => {
                let datacenters = map
                    .iter()
                    .filter(|(k, _)| k.as_str() != "class")
                    .filter_map(|(k, v)| v.parse().ok().map(|rf| (k.clone(), rf)))
                    .collect();
                ReplicationStrategy::NetworkTopology { datacenters }
            }
            _ => ReplicationStrategy::Other {
                class: class.to_string(),
            },
        }
    }
}

/// A keyspace as far as routing is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceInfo {
    pub name: String,
    pub strategy: ReplicationStrategy,
    pub durable_writes: bool,
}

/// The Murmur3 token of a routing key: the low 64 bits of the x64_128 hash,
/// with the minimum value normalized the way the partitioner defines.
pub fn murmur3_token(routing_key: &[u8]) -> i64 {
    let hash = murmur3::murmur3_x64_128(&mut Cursor::new(routing_key), 0).unwrap_or_default();
    let token = hash as u64 as i64;
    if token == i64::MIN { i64::MAX } else { token }
}

/// A sorted ring of (token, host id) built from the token sets of all hosts.
#[derive(Debug, Clone, Default)]
pub struct TokenRing {
    entries: Vec<(i64, Uuid)>,
}

impl TokenRing {
    pub fn build(hosts: &HashMap<Uuid, Arc<Host>>) -> TokenRing {
        let mut entries: Vec<(i64, Uuid)> = hosts
            .values()
            .flat_map(|h| h.tokens.iter().map(|t| (*t, h.id)))
            .collect();
        entries.sort_unstable_by_key(|(t, _)| *t);
        entries.dedup_by_key(|(t, _)| *t);
        TokenRing { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Index of the first ring entry owning `token`, wrapping at the end.
    fn insertion_point(&self, token: i64) -> usize {
        match self.entries.binary_search_by_key(&token, |(t, _)| *t) {
            Ok(i) => i,
            Err(i) if i == self.entries.len() => 0,
            Err(i) => i,
        }
    }

    /// The host owning the first token at or after `token`.
    pub fn primary_replica(&self, token: i64) -> Option<Uuid> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries[self.insertion_point(token)].1)
    }

    /// Replicas for `token` under the keyspace's strategy, in ring order
    /// starting at the primary. Unknown strategies yield the primary only.
    pub fn replicas(
        &self,
        token: i64,
        keyspace: &KeyspaceInfo,
        hosts: &HashMap<Uuid, Arc<Host>>,
    ) -> Vec<Uuid> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        match &keyspace.strategy {
            ReplicationStrategy::Simple { replication_factor } => {
                self.walk_simple(token, (*replication_factor).max(1).min(hosts.len()))
            }
            ReplicationStrategy::NetworkTopology { datacenters } => {
                self.walk_network_topology(token, datacenters, hosts)
            }
            ReplicationStrategy::Other { .. } => {
                self.primary_replica(token).into_iter().collect()
            }
        }
    }

    fn walk_simple(&self, token: i64, rf: usize) -> Vec<Uuid> {
        let start = self.insertion_point(token);
        let mut out = Vec::with_capacity(rf);
        for offset in 0..self.entries.len() {
            let (_, host) = self.entries[(start + offset) % self.entries.len()];
            if !out.contains(&host) {
                out.push(host);
                if out.len() == rf {
                    break;
                }
            }
        }
        out
    }

    /// The NetworkTopologyStrategy walk: per datacenter, prefer hosts on
    /// racks not yet represented; same-rack hosts are parked and only added
    /// once every rack of the datacenter has a replica.
    fn walk_network_topology(
        &self,
        token: i64,
        datacenters: &HashMap<String, usize>,
        hosts: &HashMap<Uuid, Arc<Host>>,
    ) -> Vec<Uuid> {
        let racks_per_dc: HashMap<String, usize> = {
            let mut racks: HashMap<String, HashSet<String>> = HashMap::new();
            for host in hosts.values() {
                if let Some(dc) = &host.datacenter {
                    racks
                        .entry(dc.clone())
                        .or_default()
                        .insert(host.rack.clone().unwrap_or_default());
                }
            }
            racks.into_iter().map(|(dc, set)| (dc, set.len())).collect()
        };

        let start = self.insertion_point(token);
        let mut out: Vec<Uuid> = Vec::new();
        let mut per_dc_count: HashMap<String, usize> = HashMap::new();
        let mut per_dc_racks: HashMap<String, HashSet<String>> = HashMap::new();
        let mut parked: Vec<(Uuid, String)> = Vec::new();

        let wanted_total: usize = datacenters.values().sum();

        for offset in 0..self.entries.len() {
            if out.len() >= wanted_total {
                break;
            }
            let (_, host_id) = self.entries[(start + offset) % self.entries.len()];
            if out.contains(&host_id) {
                continue;
            }
            let Some(host) = hosts.get(&host_id) else {
                continue;
            };
            let Some(dc) = host.datacenter.clone() else {
                continue;
            };
            let Some(&rf) = datacenters.get(&dc) else {
                continue;
            };
            if per_dc_count.get(&dc).copied().unwrap_or(0) >= rf {
                continue;
            }
            let rack = host.rack.clone().unwrap_or_default();
            let racks_seen = per_dc_racks.entry(dc.clone()).or_default();
            let all_racks_covered =
                racks_seen.len() >= racks_per_dc.get(&dc).copied().unwrap_or(1);
            if racks_seen.contains(&rack) && !all_racks_covered {
                // Same rack as an existing replica while other racks remain;
                // hold it back in ring order.
                parked.push((host_id, dc));
                continue;
            }
            racks_seen.insert(rack);
            *per_dc_count.entry(dc).or_default() += 1;
            out.push(host_id);
        }

        // Fill remaining slots from the parked same-rack hosts, in ring order.
        for (host_id, dc) in parked {
            let Some(&rf) = datacenters.get(&dc) else {
                continue;
            };
            let count = per_dc_count.entry(dc).or_default();
            if *count < rf && !out.contains(&host_id) {
                *count += 1;
                out.push(host_id);
            }
        }

        out
    }
}
