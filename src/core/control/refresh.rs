// src/core/control/refresh.rs

//! System-table refresh: turns `system.local`, `system.peers[_v2]` and
//! `system_schema.keyspaces` into a new metadata snapshot.

use crate::config::Config;
use crate::core::DriverError;
use crate::core::connection::Connection;
use crate::core::policies::AddressTranslator;
use crate::core::protocol::{
    ColumnSpec, Consistency, CqlResult, QueryParams, Request, Response, Rows,
};
use crate::core::topology::ring::{KeyspaceInfo, ReplicationStrategy};
use crate::core::topology::{Host, HostState, Metadata, TokenRing, TopologyEvent};
use bytes::{Buf, Bytes};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const SELECT_LOCAL: &str = "SELECT * FROM system.local";
const SELECT_PEERS: &str = "SELECT * FROM system.peers";
const SELECT_PEERS_V2: &str = "SELECT * FROM system.peers_v2";
const SELECT_KEYSPACES: &str = "SELECT * FROM system_schema.keyspaces";

/// What an event batch asked to be re-read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshScope {
    pub hosts: bool,
    pub schema: bool,
}

impl RefreshScope {
    pub const ALL: RefreshScope = RefreshScope {
        hosts: true,
        schema: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.hosts && !self.schema
    }

    pub fn merge(&mut self, other: RefreshScope) {
        self.hosts |= other.hosts;
        self.schema |= other.schema;
    }
}

/// Runs the refresh against the control connection and publishes the new
/// snapshot. Returns the events describing the difference.
pub async fn refresh(
    conn: &Arc<Connection>,
    metadata: &Metadata,
    config: &Config,
    translator: &Arc<dyn AddressTranslator>,
    scope: RefreshScope,
) -> Result<(), DriverError> {
    let timeout = config.socket.read_timeout;

    let (hosts, cluster_name) = if scope.hosts {
        let local = query_rows(conn, SELECT_LOCAL, timeout).await?;
        let peers = match query_rows(conn, SELECT_PEERS_V2, timeout).await {
            Ok(rows) => rows,
            Err(DriverError::InvalidQuery(_)) | Err(DriverError::ServerError(_)) => {
                query_rows(conn, SELECT_PEERS, timeout).await?
            }
            Err(e) => return Err(e),
        };
        let previous = metadata.snapshot();
        let (hosts, name) = build_hosts(conn, config, translator, &previous.hosts, local, peers)?;
        (Some(hosts), name)
    } else {
        (None, None)
    };

    let keyspaces = if scope.schema {
        Some(build_keyspaces(query_rows(conn, SELECT_KEYSPACES, timeout).await?))
    } else {
        None
    };

    metadata.apply(move |current| {
        let mut next = current.clone();
        let mut events = Vec::new();

        if let Some(hosts) = hosts {
            for id in hosts.keys() {
                if !current.hosts.contains_key(id) {
                    events.push(TopologyEvent::HostAdded(*id));
                }
            }
            for id in current.hosts.keys() {
                if !hosts.contains_key(id) {
                    events.push(TopologyEvent::HostRemoved(*id));
                }
            }
            next.ring = TokenRing::build(&hosts);
            next.hosts = hosts;
            if cluster_name.is_some() {
                next.cluster_name = cluster_name;
            }
        }
        if let Some(keyspaces) = keyspaces {
            if keyspaces != next.keyspaces {
                events.push(TopologyEvent::SchemaChanged);
            }
            next.keyspaces = keyspaces;
        }
        (next, events)
    });

    debug!(revision = metadata.revision(), "metadata refreshed");
    Ok(())
}

async fn query_rows(
    conn: &Arc<Connection>,
    cql: &str,
    timeout: std::time::Duration,
) -> Result<Rows, DriverError> {
    let request = Request::Query {
        query: cql.to_string(),
        params: QueryParams {
            consistency: Consistency::One,
            ..Default::default()
        },
    };
    match conn.request(&request, timeout).await?.response {
        Response::Result(CqlResult::Rows(rows)) => Ok(rows),
        other => Err(DriverError::ProtocolError(format!(
            "expected rows from '{cql}', got {other:?}"
        ))),
    }
}

fn build_hosts(
    conn: &Arc<Connection>,
    config: &Config,
    translator: &Arc<dyn AddressTranslator>,
    previous: &HashMap<Uuid, Arc<Host>>,
    local: Rows,
    peers: Rows,
) -> Result<(HashMap<Uuid, Arc<Host>>, Option<String>), DriverError> {
    let mut hosts = HashMap::new();
    let mut cluster_name = None;

    if let Some(row) = RowView::rows(&local).next() {
        cluster_name = row.string("cluster_name");
        let Some(id) = row.uuid("host_id") else {
            return Err(DriverError::ProtocolError(
                "system.local row has no host_id".into(),
            ));
        };
        // The local node is reachable at the address the control connection
        // already dialed.
        let host = make_host(id, conn.address(), &row, previous);
        hosts.insert(id, Arc::new(host));
    } else {
        return Err(DriverError::ProtocolError(
            "system.local returned no rows".into(),
        ));
    }

    for row in RowView::rows(&peers) {
        let Some(id) = row.uuid("host_id") else {
            warn!("skipping a peer row without host_id");
            continue;
        };
        let Some(address) = peer_address(&row, config) else {
            warn!(host_id = %id, "skipping a peer row without a routable address");
            continue;
        };
        let address = translator.translate(address);
        let host = make_host(id, address, &row, previous);
        hosts.insert(id, Arc::new(host));
    }

    Ok((hosts, cluster_name))
}

/// The connect address of a peer row: `native_address/native_port` on
/// `peers_v2`, `rpc_address` with the configured port on `peers`, falling
/// back to the `peer` column when the node binds the wildcard address.
fn peer_address(row: &RowView<'_>, config: &Config) -> Option<SocketAddr> {
    let port = row
        .int("native_port")
        .map(|p| p as u16)
        .unwrap_or(config.port);
    let ip = row
        .inet("native_address")
        .or_else(|| row.inet("rpc_address"))
        .filter(|ip| !ip.is_unspecified())
        .or_else(|| row.inet("peer"))?;
    Some(SocketAddr::new(ip, port))
}

fn make_host(
    id: Uuid,
    address: SocketAddr,
    row: &RowView<'_>,
    previous: &HashMap<Uuid, Arc<Host>>,
) -> Host {
    let state = previous
        .get(&id)
        .map(|h| h.state)
        .unwrap_or(HostState::Up);
    Host {
        id,
        address,
        broadcast_address: row
            .inet("broadcast_address")
            .or_else(|| row.inet("peer")),
        datacenter: row.string("data_center"),
        rack: row.string("rack"),
        release_version: row.string("release_version"),
        tokens: row
            .string_set("tokens")
            .iter()
            .filter_map(|t| t.parse().ok())
            .collect(),
        state,
    }
}

fn build_keyspaces(rows: Rows) -> IndexMap<String, KeyspaceInfo> {
    let mut keyspaces = IndexMap::new();
    for row in RowView::rows(&rows) {
        let Some(name) = row.string("keyspace_name") else {
            continue;
        };
        let replication = row.string_map("replication");
        keyspaces.insert(
            name.clone(),
            KeyspaceInfo {
                name,
                strategy: ReplicationStrategy::from_replication_map(&replication),
                durable_writes: row.boolean("durable_writes").unwrap_or(true),
            },
        );
    }
    keyspaces
}

/// A borrowed view over one row of a result set, addressing cells by column
/// name and decoding the handful of value shapes the system tables use.
pub(crate) struct RowView<'a> {
    specs: &'a [ColumnSpec],
    cells: &'a [Option<Bytes>],
}

impl<'a> RowView<'a> {
    pub(crate) fn rows(rows: &'a Rows) -> impl Iterator<Item = RowView<'a>> {
        rows.rows.iter().map(|cells| RowView {
            specs: &rows.metadata.column_specs,
            cells,
        })
    }

    fn cell(&self, name: &str) -> Option<&'a Bytes> {
        let index = self.specs.iter().position(|s| s.name == name)?;
        self.cells.get(index)?.as_ref()
    }

    pub(crate) fn string(&self, name: &str) -> Option<String> {
        let cell = self.cell(name)?;
        std::str::from_utf8(cell).ok().map(str::to_string)
    }

    pub(crate) fn uuid(&self, name: &str) -> Option<Uuid> {
        let cell = self.cell(name)?;
        let raw: [u8; 16] = cell.as_ref().try_into().ok()?;
        Some(Uuid::from_bytes(raw))
    }

    pub(crate) fn int(&self, name: &str) -> Option<i32> {
        let cell = self.cell(name)?;
        let raw: [u8; 4] = cell.as_ref().try_into().ok()?;
        Some(i32::from_be_bytes(raw))
    }

    pub(crate) fn boolean(&self, name: &str) -> Option<bool> {
        let cell = self.cell(name)?;
        cell.first().map(|b| *b != 0)
    }

    pub(crate) fn inet(&self, name: &str) -> Option<IpAddr> {
        let cell = self.cell(name)?;
        match cell.len() {
            4 => {
                let raw: [u8; 4] = cell.as_ref().try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(raw)))
            }
            16 => {
                let raw: [u8; 16] = cell.as_ref().try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(raw)))
            }
            _ => None,
        }
    }

    /// Decodes a `set<text>`/`list<text>` cell.
    pub(crate) fn string_set(&self, name: &str) -> Vec<String> {
        let Some(cell) = self.cell(name) else {
            return Vec::new();
        };
        let mut buf = cell.clone();
        let Some(count) = read_collection_count(&mut buf) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(element) = read_collection_element(&mut buf) else {
                break;
            };
            if let Ok(s) = std::str::from_utf8(&element) {
                out.push(s.to_string());
            }
        }
        out
    }

    /// Decodes a `map<text, text>` cell.
    pub(crate) fn string_map(&self, name: &str) -> HashMap<String, String> {
        let Some(cell) = self.cell(name) else {
            return HashMap::new();
        };
        let mut buf = cell.clone();
        let Some(count) = read_collection_count(&mut buf) else {
            return HashMap::new();
        };
        let mut out = HashMap::with_capacity(count);
        for _ in 0..count {
            let (Some(key), Some(value)) = (
                read_collection_element(&mut buf),
                read_collection_element(&mut buf),
            ) else {
                break;
            };
            if let (Ok(k), Ok(v)) = (std::str::from_utf8(&key), std::str::from_utf8(&value)) {
                out.insert(k.to_string(), v.to_string());
            }
        }
        out
    }
}

fn read_collection_count(buf: &mut Bytes) -> Option<usize> {
    if buf.remaining() < 4 {
        return None;
    }
    let count = buf.get_i32();
    usize::try_from(count).ok()
}

fn read_collection_element(buf: &mut Bytes) -> Option<Bytes> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_i32();
    let len = usize::try_from(len).ok()?;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.split_to(len))
}
