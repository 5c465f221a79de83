// src/core/connection/handler.rs

//! The multiplexed node connection.
//!
//! A connection owns a split transport: the writer half lives behind an
//! async mutex and the reader half runs in a spawned task that dispatches
//! response frames to pending requests by stream id. EVENT frames (stream
//! id -1) are forwarded to the control channel. A heartbeat task probes the
//! server with OPTIONS after an idle interval and closes the connection when
//! the probe goes unanswered.
//!
//! Stream-id discipline: an id expires back to the free list on response,
//! on a failed write, or on connection death. A request whose deadline
//! passes leaves its id *orphaned* until the server answers it, so a late
//! response can never be misdelivered to a future request. Too many orphans
//! reset the connection.

use crate::config::Config;
use crate::core::DriverError;
use crate::core::auth::AuthProvider;
use crate::core::connection::handshake::{self, Negotiated};
use crate::core::connection::streams::StreamIdPool;
use crate::core::connection::NodeStream;
use crate::core::protocol::segment::{segment_payloads, Segment, SegmentCodec};
use crate::core::protocol::{
    Compression, DecodedResponse, Frame, FrameCodec, ProtocolVersion, QueryParams, Request,
    Response, ServerEvent,
};
use bytes::BytesMut;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{ReadHalf, WriteHalf, split};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Connection tunables, extracted from the driver configuration.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub read_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_orphans: usize,
}

impl ConnectionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_timeout: config.socket.read_timeout,
            heartbeat_interval: config.pooling.heartbeat_interval,
            max_orphans: config.limits.max_orphan_ids,
        }
    }
}

/// The write side: legacy framing sends frames directly; modern (v5)
/// framing encodes the frame and wraps it into checksummed segments.
enum FrameSink {
    Legacy(FramedWrite<WriteHalf<NodeStream>, FrameCodec>),
    Modern {
        inner: FramedWrite<WriteHalf<NodeStream>, SegmentCodec>,
        codec: FrameCodec,
    },
}

impl FrameSink {
    async fn send(&mut self, frame: Frame) -> Result<(), DriverError> {
        match self {
            FrameSink::Legacy(framed) => framed.send(frame).await,
            FrameSink::Modern { inner, codec } => {
                let mut buf = BytesMut::new();
                use tokio_util::codec::Encoder;
                codec.encode(frame, &mut buf)?;
                for segment in segment_payloads(buf.freeze()) {
                    inner.feed(segment).await?;
                }
                inner.flush().await
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            FrameSink::Legacy(framed) => framed.close().await,
            FrameSink::Modern { inner, .. } => inner.close().await,
        };
    }
}

/// The read side, mirroring [`FrameSink`]. Modern framing accumulates
/// segment payloads until a whole frame can be decoded.
enum FrameSource {
    Legacy(FramedRead<ReadHalf<NodeStream>, FrameCodec>),
    Modern {
        inner: FramedRead<ReadHalf<NodeStream>, SegmentCodec>,
        codec: FrameCodec,
        buf: BytesMut,
    },
}

impl FrameSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, DriverError>> {
        match self {
            FrameSource::Legacy(framed) => framed.next().await,
            FrameSource::Modern { inner, codec, buf } => loop {
                match codec.decode(buf) {
                    Ok(Some(frame)) => return Some(Ok(frame)),
                    Ok(None) => {}
                    Err(e) => return Some(Err(e)),
                }
                match inner.next().await {
                    Some(Ok(Segment { payload, .. })) => buf.extend_from_slice(&payload),
                    Some(Err(e)) => return Some(Err(e)),
                    None => return None,
                }
            },
        }
    }
}

enum PendingSlot {
    Waiting(oneshot::Sender<Result<Frame, DriverError>>),
    /// The requester gave up on its deadline; the id stays out of the free
    /// list until the server answers or the connection dies.
    Orphaned,
}

struct Shared {
    addr: SocketAddr,
    streams: StreamIdPool,
    pending: DashMap<i16, PendingSlot>,
    orphans: AtomicUsize,
    max_orphans: usize,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    last_traffic: parking_lot::Mutex<Instant>,
    sink: tokio::sync::Mutex<FrameSink>,
}

impl Shared {
    /// Idempotent teardown: fails every pending request with a retriable
    /// error, signals watchers, and shuts the write half down.
    fn close(self: &Arc<Self>, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(addr = %self.addr, reason, "closing connection");
        let _ = self.closed_tx.send(true);

        let ids: Vec<i16> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, PendingSlot::Waiting(tx))) = self.pending.remove(&id) {
                let _ = tx.send(Err(DriverError::ConnectionClosed(reason.to_string())));
            }
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = self.clone();
            handle.spawn(async move {
                shared.sink.lock().await.shutdown().await;
            });
        }
    }
}

/// One ready connection to one node.
pub struct Connection {
    shared: Arc<Shared>,
    version: ProtocolVersion,
}

impl Connection {
    /// Opens a transport, runs the handshake, and starts the reader and
    /// heartbeat tasks. `event_tx` receives server-pushed EVENT frames and
    /// is only set on the control connection.
    pub async fn open(
        addr: SocketAddr,
        config: &Config,
        auth: Option<Arc<dyn AuthProvider>>,
        tls_connector: Option<&TlsConnector>,
        event_tx: Option<mpsc::UnboundedSender<ServerEvent>>,
    ) -> Result<Arc<Connection>, DriverError> {
        let Negotiated {
            stream,
            version,
            compression,
        } = handshake::establish(addr, config, auth.as_ref(), tls_connector).await?;
        let options = ConnectionOptions::from_config(config);
        let max_frame_len = config.limits.max_frame_length;

        let (read_half, write_half) = split(stream);
        let (sink, source) = if version.uses_modern_framing() {
            let compress = compression == Compression::Lz4;
            (
                FrameSink::Modern {
                    inner: FramedWrite::new(write_half, SegmentCodec::new(compress)),
                    codec: FrameCodec::new(version, Compression::None, max_frame_len),
                },
                FrameSource::Modern {
                    inner: FramedRead::new(read_half, SegmentCodec::new(compress)),
                    codec: FrameCodec::new(version, Compression::None, max_frame_len),
                    buf: BytesMut::new(),
                },
            )
        } else {
            let codec = FrameCodec::new(version, compression, max_frame_len);
            (
                FrameSink::Legacy(FramedWrite::new(write_half, codec.clone())),
                FrameSource::Legacy(FramedRead::new(read_half, codec)),
            )
        };

        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            addr,
            streams: StreamIdPool::new(version.stream_id_capacity()),
            pending: DashMap::new(),
            orphans: AtomicUsize::new(0),
            max_orphans: options.max_orphans,
            closed: AtomicBool::new(false),
            closed_tx,
            last_traffic: parking_lot::Mutex::new(Instant::now()),
            sink: tokio::sync::Mutex::new(sink),
        });

        tokio::spawn(run_reader(shared.clone(), source, event_tx));

        let connection = Arc::new(Connection { shared, version });
        tokio::spawn(run_heartbeat(
            Arc::downgrade(&connection),
            connection.shared.closed_tx.subscribe(),
            options.heartbeat_interval,
            options.read_timeout,
        ));

        debug!(%addr, %version, "connection ready");
        Ok(connection)
    }

    pub fn address(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn has_free_stream(&self) -> bool {
        self.shared.streams.has_free()
    }

    /// Stream ids currently out of the free list, orphans included.
    pub fn outstanding_streams(&self) -> usize {
        self.shared.streams.outstanding()
    }

    /// Requests currently registered for a response, orphans included.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// A watch that flips to `true` when the connection dies.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.shared.closed_tx.subscribe()
    }

    pub fn close(&self, reason: &str) {
        self.shared.close(reason);
    }

    /// Sends one request and awaits its response within `timeout`.
    ///
    /// Server ERROR frames surface as `Err`; the response prologue
    /// (warnings, tracing id, custom payload) stays attached to successful
    /// responses.
    pub async fn request(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<DecodedResponse, DriverError> {
        if self.is_closed() {
            return Err(DriverError::ConnectionClosed(
                "connection is closed".into(),
            ));
        }
        let Some(id) = self.shared.streams.borrow() else {
            return Err(DriverError::ConnectionBusy);
        };
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, PendingSlot::Waiting(tx));

        let frame = match request.to_frame(self.version, id) {
            Ok(frame) => frame,
            Err(e) => {
                self.shared.pending.remove(&id);
                self.shared.streams.release(id);
                return Err(e);
            }
        };

        {
            let mut sink = self.shared.sink.lock().await;
            if let Err(e) = sink.send(frame).await {
                self.shared.pending.remove(&id);
                self.shared.streams.release(id);
                self.shared.close(&format!("write failed: {e}"));
                return Err(DriverError::ConnectionClosed(format!("write failed: {e}")));
            }
        }
        *self.shared.last_traffic.lock() = Instant::now();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(frame))) => {
                self.shared.streams.release(id);
                let decoded = DecodedResponse::decode(&frame)?;
                if let Response::Error(e) = decoded.response {
                    Err(e)
                } else {
                    Ok(decoded)
                }
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(DriverError::ConnectionClosed(
                "connection closed while awaiting a response".into(),
            )),
            Err(_) => {
                match self.shared.pending.entry(id) {
                    Entry::Occupied(mut occupied) => {
                        *occupied.get_mut() = PendingSlot::Orphaned;
                        drop(occupied);
                        let orphans = self.shared.orphans.fetch_add(1, Ordering::AcqRel) + 1;
                        if orphans > self.shared.max_orphans {
                            self.shared.close("too many orphaned stream ids");
                        }
                    }
                    Entry::Vacant(_) => {
                        // The response landed while the deadline fired. The
                        // reader took the entry and, finding our receiver
                        // gone, releases the id itself.
                    }
                }
                Err(DriverError::OperationTimedOut(format!(
                    "no response from {} within {timeout:?}",
                    self.shared.addr
                )))
            }
        }
    }

    /// Binds the connection to a keyspace with a `USE` statement.
    pub async fn use_keyspace(
        &self,
        keyspace: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let request = Request::Query {
            query: format!("USE \"{keyspace}\""),
            params: QueryParams::default(),
        };
        self.request(&request, timeout).await.map(|_| ())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close("connection dropped");
    }
}

async fn run_reader(
    shared: Arc<Shared>,
    mut source: FrameSource,
    event_tx: Option<mpsc::UnboundedSender<ServerEvent>>,
) {
    let mut closed_rx = shared.closed_tx.subscribe();
    loop {
        tokio::select! {
            _ = closed_rx.changed() => break,
            next = source.next_frame() => match next {
                Some(Ok(frame)) => {
                    *shared.last_traffic.lock() = Instant::now();
                    if frame.stream_id < 0 {
                        dispatch_event(&shared, &frame, event_tx.as_ref());
                        continue;
                    }
                    match shared.pending.remove(&frame.stream_id) {
                        Some((id, PendingSlot::Waiting(tx))) => {
                            if tx.send(Ok(frame)).is_err() {
                                // The requester was cancelled mid-await; the
                                // response still expires the id.
                                shared.streams.release(id);
                            }
                        }
                        Some((id, PendingSlot::Orphaned)) => {
                            shared.orphans.fetch_sub(1, Ordering::AcqRel);
                            shared.streams.release(id);
                        }
                        None => {
                            warn!(addr = %shared.addr, stream_id = frame.stream_id,
                                "response for an unknown stream id");
                        }
                    }
                }
                Some(Err(e)) => {
                    shared.close(&format!("read error: {e}"));
                    break;
                }
                None => {
                    shared.close("server closed the connection");
                    break;
                }
            }
        }
    }
}

fn dispatch_event(
    shared: &Arc<Shared>,
    frame: &Frame,
    event_tx: Option<&mpsc::UnboundedSender<ServerEvent>>,
) {
    match DecodedResponse::decode(frame) {
        Ok(decoded) => match decoded.response {
            Response::Event(event) => {
                if let Some(tx) = event_tx {
                    let _ = tx.send(event);
                }
            }
            other => {
                warn!(addr = %shared.addr, "non-event response on stream id -1: {other:?}");
            }
        },
        Err(e) => {
            shared.close(&format!("undecodable event frame: {e}"));
        }
    }
}

/// Probes the server with OPTIONS once traffic has been idle for the
/// configured interval; a missed reply kills the connection.
async fn run_heartbeat(
    connection: std::sync::Weak<Connection>,
    mut closed_rx: watch::Receiver<bool>,
    interval: Duration,
    read_timeout: Duration,
) {
    loop {
        let wait = {
            let Some(conn) = connection.upgrade() else {
                return;
            };
            if conn.is_closed() {
                return;
            }
            interval.saturating_sub(conn.shared.last_traffic.lock().elapsed())
        };
        if !wait.is_zero() {
            tokio::select! {
                _ = closed_rx.changed() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            continue;
        }
        let Some(conn) = connection.upgrade() else {
            return;
        };
        if let Err(e) = conn.request(&Request::Options, read_timeout).await {
            warn!(addr = %conn.address(), error = %e, "heartbeat failed");
            conn.shared.close("heartbeat went unanswered");
            return;
        }
    }
}
