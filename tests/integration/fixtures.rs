// tests/integration/fixtures.rs

//! A minimal in-process mock node speaking just enough of the native
//! protocol for end-to-end driver tests: version negotiation, STARTUP,
//! REGISTER, the system-table queries the control channel issues, PREPARE
//! and EXECUTE, plus server-pushed EVENT frames.

use bytes::BytesMut;
use lazulite::core::protocol::types;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use uuid::Uuid;

// Column type specs as they appear on the wire.
const T_VARCHAR: &[u8] = &[0x00, 0x0D];
const T_UUID: &[u8] = &[0x00, 0x0C];
const T_INT: &[u8] = &[0x00, 0x09];
const T_BOOLEAN: &[u8] = &[0x00, 0x04];
const T_INET: &[u8] = &[0x00, 0x10];
const T_SET_VARCHAR: &[u8] = &[0x00, 0x22, 0x00, 0x0D];
const T_MAP_VARCHAR: &[u8] = &[0x00, 0x21, 0x00, 0x0D, 0x00, 0x0D];

/// Installs a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
pub struct Counters {
    pub options: AtomicUsize,
    pub startup: AtomicUsize,
    pub register: AtomicUsize,
    pub query: AtomicUsize,
    pub prepare: AtomicUsize,
    pub execute: AtomicUsize,
}

pub struct PeerRecord {
    pub host_id: Uuid,
    pub addr: SocketAddr,
    pub data_center: String,
    pub rack: String,
    pub tokens: Vec<String>,
}

pub struct MockState {
    pub host_id: Uuid,
    pub data_center: String,
    pub rack: String,
    pub tokens: Vec<String>,
    pub peers: StdMutex<Vec<PeerRecord>>,
    pub prepared_id: Vec<u8>,
    /// When set, the next EXECUTE answers UNPREPARED once.
    pub unprepared_once: AtomicBool,
    /// Artificial latency applied to user queries and executes.
    pub query_delay: StdMutex<Option<Duration>>,
    pub counters: Counters,
    control_txs: StdMutex<Vec<UnboundedSender<Vec<u8>>>>,
}

impl MockState {
    pub fn new(data_center: &str, rack: &str, token: &str) -> Self {
        Self {
            host_id: Uuid::new_v4(),
            data_center: data_center.to_string(),
            rack: rack.to_string(),
            tokens: vec![token.to_string()],
            peers: StdMutex::new(Vec::new()),
            prepared_id: vec![0x0B, 0x0B, 0x0B, 0x0B],
            unprepared_once: AtomicBool::new(false),
            query_delay: StdMutex::new(None),
            counters: Counters::default(),
            control_txs: StdMutex::new(Vec::new()),
        }
    }
}

pub struct MockNode {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockNode {
    pub async fn start(state: MockState) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(state);
        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });
        MockNode { addr, state }
    }

    /// A peer record describing this node, for another node's peers table.
    pub fn as_peer(&self) -> PeerRecord {
        PeerRecord {
            host_id: self.state.host_id,
            addr: self.addr,
            data_center: self.state.data_center.clone(),
            rack: self.state.rack.clone(),
            tokens: self.state.tokens.clone(),
        }
    }

    /// Pushes a TOPOLOGY_CHANGE NEW_NODE event to every registered control
    /// connection.
    pub fn send_new_node_event(&self, addr: SocketAddr) {
        let mut body = BytesMut::new();
        types::write_string(&mut body, "TOPOLOGY_CHANGE");
        types::write_string(&mut body, "NEW_NODE");
        types::write_inet(&mut body, &addr);
        let frame = frame_bytes(4, -1, 0x0C, &body);
        for tx in self.state.control_txs.lock().unwrap().iter() {
            let _ = tx.send(frame.clone());
        }
    }
}

fn frame_bytes(version: u8, stream_id: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + body.len());
    out.push(0x80 | version);
    out.push(0x00);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.push(opcode);
    out.extend_from_slice(&(body.len() as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

// --- Cell encodings for system-table values ---

fn cell_text(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

fn cell_uuid(id: Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

fn cell_int(v: i32) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

fn cell_bool(v: bool) -> Vec<u8> {
    vec![v as u8]
}

fn cell_inet(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn cell_text_set(items: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(items.len() as i32).to_be_bytes());
    for item in items {
        out.extend_from_slice(&(item.len() as i32).to_be_bytes());
        out.extend_from_slice(item.as_bytes());
    }
    out
}

fn cell_text_map(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
    for (k, v) in pairs {
        out.extend_from_slice(&(k.len() as i32).to_be_bytes());
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(&(v.len() as i32).to_be_bytes());
        out.extend_from_slice(v.as_bytes());
    }
    out
}

/// A Rows result body with a global table spec.
fn rows_body(columns: &[(&str, &[u8])], rows: &[Vec<Option<Vec<u8>>>]) -> BytesMut {
    let mut body = BytesMut::new();
    types::write_int(&mut body, 0x0002); // kind: Rows
    types::write_int(&mut body, 0x0001); // flags: global tables spec
    types::write_int(&mut body, columns.len() as i32);
    types::write_string(&mut body, "system");
    types::write_string(&mut body, "mock");
    for (name, type_spec) in columns {
        types::write_string(&mut body, name);
        body.extend_from_slice(type_spec);
    }
    types::write_int(&mut body, rows.len() as i32);
    for row in rows {
        for cell in row {
            types::write_bytes(&mut body, cell.as_deref());
        }
    }
    body
}

fn error_body(code: i32, message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    types::write_int(&mut body, code);
    types::write_string(&mut body, message);
    body
}

fn supported_body() -> BytesMut {
    let mut body = BytesMut::new();
    types::write_short(&mut body, 2);
    types::write_string(&mut body, "PROTOCOL_VERSIONS");
    types::write_string_list(&mut body, &["3/v3".to_string(), "4/v4".to_string()]);
    types::write_string(&mut body, "COMPRESSION");
    types::write_string_list(&mut body, &[]);
    body
}

fn local_rows(state: &MockState) -> BytesMut {
    rows_body(
        &[
            ("cluster_name", T_VARCHAR),
            ("host_id", T_UUID),
            ("data_center", T_VARCHAR),
            ("rack", T_VARCHAR),
            ("release_version", T_VARCHAR),
            ("tokens", T_SET_VARCHAR),
        ],
        &[vec![
            Some(cell_text("mock-cluster")),
            Some(cell_uuid(state.host_id)),
            Some(cell_text(&state.data_center)),
            Some(cell_text(&state.rack)),
            Some(cell_text("4.0.0")),
            Some(cell_text_set(&state.tokens)),
        ]],
    )
}

fn peers_v2_rows(state: &MockState) -> BytesMut {
    let peers = state.peers.lock().unwrap();
    let rows: Vec<Vec<Option<Vec<u8>>>> = peers
        .iter()
        .map(|p| {
            vec![
                Some(cell_uuid(p.host_id)),
                Some(cell_inet(p.addr.ip())),
                Some(cell_int(p.addr.port() as i32)),
                Some(cell_text(&p.data_center)),
                Some(cell_text(&p.rack)),
                Some(cell_text("4.0.0")),
                Some(cell_text_set(&p.tokens)),
            ]
        })
        .collect();
    rows_body(
        &[
            ("host_id", T_UUID),
            ("native_address", T_INET),
            ("native_port", T_INT),
            ("data_center", T_VARCHAR),
            ("rack", T_VARCHAR),
            ("release_version", T_VARCHAR),
            ("tokens", T_SET_VARCHAR),
        ],
        &rows,
    )
}

/// The legacy peers table, served in case a client falls back to it. Ports
/// cannot be expressed here, so it is only accurate for default-port peers.
fn peers_v1_rows(state: &MockState) -> BytesMut {
    let peers = state.peers.lock().unwrap();
    let rows: Vec<Vec<Option<Vec<u8>>>> = peers
        .iter()
        .map(|p| {
            vec![
                Some(cell_uuid(p.host_id)),
                Some(cell_inet(p.addr.ip())),
                Some(cell_text(&p.data_center)),
                Some(cell_text(&p.rack)),
                Some(cell_text("4.0.0")),
                Some(cell_text_set(&p.tokens)),
            ]
        })
        .collect();
    rows_body(
        &[
            ("host_id", T_UUID),
            ("rpc_address", T_INET),
            ("data_center", T_VARCHAR),
            ("rack", T_VARCHAR),
            ("release_version", T_VARCHAR),
            ("tokens", T_SET_VARCHAR),
        ],
        &rows,
    )
}

fn keyspaces_rows() -> BytesMut {
    rows_body(
        &[
            ("keyspace_name", T_VARCHAR),
            ("durable_writes", T_BOOLEAN),
            ("replication", T_MAP_VARCHAR),
        ],
        &[vec![
            Some(cell_text("ks")),
            Some(cell_bool(true)),
            Some(cell_text_map(&[
                ("class", "org.apache.cassandra.locator.SimpleStrategy"),
                ("replication_factor", "1"),
            ])),
        ]],
    )
}

fn value_rows() -> BytesMut {
    rows_body(&[("v", T_VARCHAR)], &[vec![Some(cell_text("ok"))]])
}

fn prepared_body(state: &MockState) -> BytesMut {
    let mut body = BytesMut::new();
    types::write_int(&mut body, 0x0004); // kind: Prepared
    types::write_short_bytes(&mut body, &state.prepared_id);
    // Variables metadata: one int partition-key column.
    types::write_int(&mut body, 0x0001);
    types::write_int(&mut body, 1);
    types::write_int(&mut body, 1);
    types::write_short(&mut body, 0);
    types::write_string(&mut body, "ks");
    types::write_string(&mut body, "t");
    types::write_string(&mut body, "k");
    body.extend_from_slice(T_INT);
    // Result metadata: none.
    types::write_int(&mut body, 0x0004);
    types::write_int(&mut body, 0);
    body
}

fn set_keyspace_body(keyspace: &str) -> BytesMut {
    let mut body = BytesMut::new();
    types::write_int(&mut body, 0x0003);
    types::write_string(&mut body, keyspace);
    body
}

fn void_body() -> BytesMut {
    let mut body = BytesMut::new();
    types::write_int(&mut body, 0x0001);
    body
}

async fn serve(stream: TcpStream, state: Arc<MockState>) {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                return;
            }
        }
    });

    loop {
        let mut header = [0u8; 9];
        if reader.read_exact(&mut header).await.is_err() {
            return;
        }
        let version = header[0] & 0x7F;
        let stream_id = i16::from_be_bytes([header[2], header[3]]);
        let opcode = header[4];
        let body_len = i32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        let mut body = vec![0u8; body_len];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }

        let reply = match opcode {
            // OPTIONS
            0x05 => {
                state.counters.options.fetch_add(1, Ordering::Relaxed);
                frame_bytes(version, stream_id, 0x06, &supported_body())
            }
            // STARTUP
            0x01 => {
                state.counters.startup.fetch_add(1, Ordering::Relaxed);
                frame_bytes(version, stream_id, 0x02, &[])
            }
            // REGISTER: remember the connection as a control channel.
            0x0B => {
                state.counters.register.fetch_add(1, Ordering::Relaxed);
                state.control_txs.lock().unwrap().push(out_tx.clone());
                frame_bytes(version, stream_id, 0x02, &[])
            }
            // QUERY
            0x07 => {
                state.counters.query.fetch_add(1, Ordering::Relaxed);
                let query_len =
                    i32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
                let query = String::from_utf8_lossy(&body[4..4 + query_len]).to_string();
                if query.contains("system.peers_v2") {
                    frame_bytes(version, stream_id, 0x08, &peers_v2_rows(&state))
                } else if query.contains("system.peers") {
                    frame_bytes(version, stream_id, 0x08, &peers_v1_rows(&state))
                } else if query.contains("system.local") {
                    frame_bytes(version, stream_id, 0x08, &local_rows(&state))
                } else if query.contains("system_schema.keyspaces") {
                    frame_bytes(version, stream_id, 0x08, &keyspaces_rows())
                } else if let Some(rest) = query.strip_prefix("USE ") {
                    let keyspace = rest.trim().trim_matches('"');
                    frame_bytes(version, stream_id, 0x08, &set_keyspace_body(keyspace))
                } else {
                    let delay = *state.query_delay.lock().unwrap();
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    frame_bytes(version, stream_id, 0x08, &value_rows())
                }
            }
            // PREPARE
            0x09 => {
                state.counters.prepare.fetch_add(1, Ordering::Relaxed);
                frame_bytes(version, stream_id, 0x08, &prepared_body(&state))
            }
            // EXECUTE
            0x0A => {
                state.counters.execute.fetch_add(1, Ordering::Relaxed);
                if state.unprepared_once.swap(false, Ordering::AcqRel) {
                    let mut body = error_body(0x2500, "unknown prepared statement");
                    types::write_short_bytes(&mut body, &state.prepared_id);
                    frame_bytes(version, stream_id, 0x00, &body)
                } else {
                    let delay = *state.query_delay.lock().unwrap();
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    frame_bytes(version, stream_id, 0x08, &value_rows())
                }
            }
            // BATCH
            0x0D => frame_bytes(version, stream_id, 0x08, &void_body()),
            _ => frame_bytes(
                version,
                stream_id,
                0x00,
                &error_body(0x000A, "unsupported opcode"),
            ),
        };
        if out_tx.send(reply).is_err() {
            return;
        }
    }
}
