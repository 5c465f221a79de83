// src/core/connection/handshake.rs

//! Establishes a node connection: transport open, OPTIONS/SUPPORTED version
//! negotiation, STARTUP, and the SASL exchange when the server challenges.
//!
//! Any error before READY/AUTH_SUCCESS is fatal for the attempt and surfaces
//! as "cannot open". The only sanctioned recovery is a one-shot protocol
//! downgrade when STARTUP is rejected with a protocol error.

use crate::config::Config;
use crate::core::DriverError;
use crate::core::auth::AuthProvider;
use crate::core::connection::NodeStream;
use crate::core::protocol::{
    Compression, DecodedResponse, FrameCodec, ProtocolVersion, Request, Response,
};
use crate::core::tls;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// The outcome of a successful handshake.
pub struct Negotiated {
    pub stream: NodeStream,
    pub version: ProtocolVersion,
    pub compression: Compression,
}

/// Runs the complete handshake against `addr`.
pub async fn establish(
    addr: SocketAddr,
    config: &Config,
    auth: Option<&Arc<dyn AuthProvider>>,
    tls_connector: Option<&TlsConnector>,
) -> Result<Negotiated, DriverError> {
    let mut proposal = config.initial_protocol_version();
    let mut downgraded = false;

    loop {
        match attempt(addr, config, auth, tls_connector, proposal).await {
            Ok(negotiated) => return Ok(negotiated),
            Err(DriverError::ProtocolError(message))
                if !downgraded && config.protocol_version.is_none() =>
            {
                let Some(lower) = proposal.downgrade() else {
                    return Err(DriverError::ProtocolError(message));
                };
                debug!(%addr, from = %proposal, to = %lower, %message,
                    "STARTUP rejected; retrying with a lower protocol version");
                proposal = lower;
                downgraded = true;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn attempt(
    addr: SocketAddr,
    config: &Config,
    auth: Option<&Arc<dyn AuthProvider>>,
    tls_connector: Option<&TlsConnector>,
    proposal: ProtocolVersion,
) -> Result<Negotiated, DriverError> {
    let stream = open_transport(addr, config, tls_connector).await?;
    // Compression stays off until STARTUP is acknowledged; the handshake
    // itself always runs uncompressed.
    let codec = FrameCodec::new(proposal, Compression::None, config.limits.max_frame_length);
    let mut framed = Framed::new(stream, codec);
    let read_timeout = config.socket.read_timeout;

    // OPTIONS/SUPPORTED: learn what the server can do before committing.
    let supported = roundtrip(&mut framed, &Request::Options, read_timeout).await?;
    let mut version = proposal;
    let mut compression = config.compression;
    if let Response::Supported { options } = supported.response {
        if let Some(listed) = options.get("PROTOCOL_VERSIONS") {
            version = pick_version(listed, proposal)?;
            if version != proposal {
                debug!(%addr, proposed = %proposal, negotiated = %version,
                    "server supports a lower protocol version");
                framed.codec_mut().set_version(version);
            }
        }
        if let Some(name) = compression.startup_name()
            && let Some(algorithms) = options.get("COMPRESSION")
            && !algorithms.iter().any(|a| a.eq_ignore_ascii_case(name))
        {
            warn!(%addr, algorithm = name, "server does not offer the configured compression; disabling");
            compression = Compression::None;
        }
    }
    if version >= ProtocolVersion::V5 && compression == Compression::Snappy {
        warn!(%addr, "snappy is not defined for protocol v5; disabling compression");
        compression = Compression::None;
    }

    // STARTUP, then drive authentication if the server challenges.
    let mut startup_options = config.startup_options();
    startup_options.retain(|(k, _)| k != "COMPRESSION");
    if let Some(name) = compression.startup_name() {
        startup_options.push(("COMPRESSION".to_string(), name.to_string()));
    }
    let startup = Request::Startup {
        options: startup_options,
    };
    let mut reply = roundtrip(&mut framed, &startup, read_timeout).await?;

    if let Response::Authenticate { mechanism } = &reply.response {
        let mechanism = mechanism.clone();
        let provider = auth.ok_or_else(|| {
            DriverError::AuthenticationFailed(format!(
                "node {addr} requires authentication ({mechanism}) but no provider is configured"
            ))
        })?;
        let mut token = provider.initial_response(&mechanism).await?;
        reply = loop {
            let answer = roundtrip(&mut framed, &Request::AuthResponse { token }, read_timeout)
                .await?;
            match answer.response {
                Response::AuthChallenge { token: challenge } => {
                    token = provider.evaluate_challenge(challenge).await?;
                }
                Response::AuthSuccess { token: ref final_token } => {
                    provider.on_success(final_token.clone()).await?;
                    break answer;
                }
                Response::Error(e) => return Err(e),
                other => {
                    return Err(DriverError::ProtocolError(format!(
                        "unexpected response during authentication: {other:?}"
                    )));
                }
            }
        };
    }

    match reply.response {
        Response::Ready | Response::AuthSuccess { .. } => Ok(Negotiated {
            stream: framed.into_inner(),
            version,
            compression,
        }),
        Response::Error(e) => Err(e),
        other => Err(DriverError::ProtocolError(format!(
            "unexpected response to STARTUP: {other:?}"
        ))),
    }
}

async fn open_transport(
    addr: SocketAddr,
    config: &Config,
    tls_connector: Option<&TlsConnector>,
) -> Result<NodeStream, DriverError> {
    let tcp = tokio::time::timeout(config.socket.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            DriverError::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )))
        })??;
    tcp.set_nodelay(config.socket.tcp_nodelay)?;
    if config.socket.keepalive {
        socket2::SockRef::from(&tcp).set_keepalive(true)?;
    }

    if let Some(connector) = tls_connector {
        let name = tls::server_name(&addr.ip().to_string())?;
        let stream = connector
            .connect(name, tcp)
            .await
            .map_err(|e| DriverError::ConnectionClosed(format!("TLS handshake failed: {e}")))?;
        Ok(NodeStream::Tls(Box::new(stream)))
    } else {
        Ok(NodeStream::Tcp(tcp))
    }
}

/// One request/response exchange on stream id 0, used only while the
/// connection is not yet multiplexed.
async fn roundtrip(
    framed: &mut Framed<NodeStream, FrameCodec>,
    request: &Request,
    read_timeout: Duration,
) -> Result<DecodedResponse, DriverError> {
    let frame = request.to_frame(framed.codec().version(), 0)?;
    framed.send(frame).await?;
    match tokio::time::timeout(read_timeout, framed.next()).await {
        Ok(Some(Ok(frame))) => DecodedResponse::decode(&frame),
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => Err(DriverError::ConnectionClosed(
            "server closed the connection during the handshake".into(),
        )),
        Err(_) => Err(DriverError::OperationTimedOut(
            "no handshake response within the read timeout".into(),
        )),
    }
}

/// Picks the highest version both sides support. Entries look like `4/v4`;
/// beta versions are never picked implicitly.
fn pick_version(listed: &[String], proposal: ProtocolVersion) -> Result<ProtocolVersion, DriverError> {
    let mut best: Option<ProtocolVersion> = None;
    for entry in listed {
        if entry.contains("beta") {
            continue;
        }
        let digits = entry.split('/').next().unwrap_or(entry);
        let Ok(raw) = digits.trim().parse::<u8>() else {
            continue;
        };
        let Ok(version) = ProtocolVersion::from_byte(raw) else {
            continue;
        };
        if version <= proposal && best.is_none_or(|b| version > b) {
            best = Some(version);
        }
    }
    best.ok_or_else(|| {
        DriverError::ProtocolError(format!(
            "no mutually supported protocol version at or below {proposal} in {listed:?}"
        ))
    })
}
