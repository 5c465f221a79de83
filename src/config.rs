// src/config.rs

//! Manages driver configuration: loading, defaults, and validation.

use crate::core::protocol::{Compression, Consistency, ProtocolVersion};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Pool sizing and connection keepalive settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PoolingConfig {
    /// Connections kept open to every host the load balancer marks Local.
    #[serde(default = "default_core_local")]
    pub core_local: usize,
    /// Connections kept open to every Remote host.
    #[serde(default = "default_core_remote")]
    pub core_remote: usize,
    #[serde(default = "default_max_local")]
    pub max_local: usize,
    #[serde(default = "default_max_remote")]
    pub max_remote: usize,
    /// An OPTIONS probe is sent after this much idle time on a connection.
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            core_local: default_core_local(),
            core_remote: default_core_remote(),
            max_local: default_max_local(),
            max_remote: default_max_remote(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

fn default_core_local() -> usize {
    1
}
fn default_core_remote() -> usize {
    1
}
fn default_max_local() -> usize {
    2
}
fn default_max_remote() -> usize {
    1
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

/// Socket-level settings applied to every node connection.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SocketConfig {
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Per-request deadline; also bounds heartbeat replies.
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    #[serde(default)]
    pub keepalive: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            tcp_nodelay: default_true(),
            keepalive: false,
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_read_timeout() -> Duration {
    Duration::from_secs(12)
}
fn default_true() -> bool {
    true
}

/// Defaults applied to every statement unless overridden per request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueryConfig {
    #[serde(default)]
    pub consistency: Consistency,
    #[serde(default)]
    pub serial_consistency: Option<Consistency>,
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    /// Re-prepare every cached statement on a host when it comes back up.
    #[serde(default = "default_true")]
    pub reprepare_on_up: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            consistency: Consistency::default(),
            serial_consistency: None,
            page_size: default_page_size(),
            reprepare_on_up: default_true(),
        }
    }
}

fn default_page_size() -> i32 {
    5000
}

/// Backoff applied by pool and control-channel reconnection.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReconnectConfig {
    #[serde(with = "humantime_serde", default = "default_reconnect_base")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_reconnect_cap")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: default_reconnect_base(),
            max_delay: default_reconnect_cap(),
        }
    }
}

fn default_reconnect_base() -> Duration {
    Duration::from_secs(1)
}
fn default_reconnect_cap() -> Duration {
    Duration::from_secs(600)
}

/// TLS settings; certificate validation is delegated to rustls.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Extra PEM trust anchors appended to the webpki roots.
    #[serde(default)]
    pub ca_cert_file: Option<String>,
}

/// Plain-text credentials; a custom provider can be injected on the cluster
/// instead.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// Limits guarding the codec and the multiplexer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProtocolLimitsConfig {
    /// A frame declaring a larger body is rejected as a protocol error.
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    /// A connection accumulating more orphaned stream ids than this is reset.
    #[serde(default = "default_max_orphan_ids")]
    pub max_orphan_ids: usize,
}

impl Default for ProtocolLimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_length: default_max_frame_length(),
            max_orphan_ids: default_max_orphan_ids(),
        }
    }
}

fn default_max_frame_length() -> usize {
    256 * 1024 * 1024
}
fn default_max_orphan_ids() -> usize {
    16
}

/// The root configuration of a cluster handle.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Initial endpoints, as `host` or `host:port` strings. All explicit
    /// ports must agree with `port`.
    #[serde(default)]
    pub contact_points: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pin a protocol version instead of negotiating the highest supported.
    #[serde(default)]
    pub protocol_version: Option<ProtocolVersion>,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub pooling: PoolingConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub limits: ProtocolLimitsConfig,
    /// Floor for the init timeout `2 × connect_timeout × host_count`.
    #[serde(with = "humantime_serde", default = "default_init_timeout_floor")]
    pub init_timeout_floor: Duration,
    /// Coalescing window for control-channel refreshes.
    #[serde(with = "humantime_serde", default = "default_event_debounce")]
    pub event_debounce: Duration,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// Advertised to the server in STARTUP and visible in its client list.
    #[serde(default)]
    pub application_name: Option<String>,
    #[serde(default)]
    pub application_version: Option<String>,
    #[serde(default)]
    pub cluster_id: Option<String>,
}

fn default_port() -> u16 {
    9042
}
fn default_init_timeout_floor() -> Duration {
    Duration::from_secs(10)
}
fn default_event_debounce() -> Duration {
    Duration::from_secs(1)
}
fn default_session_name() -> String {
    "session".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            contact_points: Vec::new(),
            port: default_port(),
            protocol_version: None,
            compression: Compression::default(),
            tls: None,
            auth: None,
            pooling: PoolingConfig::default(),
            socket: SocketConfig::default(),
            query: QueryConfig::default(),
            reconnect: ReconnectConfig::default(),
            limits: ProtocolLimitsConfig::default(),
            init_timeout_floor: default_init_timeout_floor(),
            event_debounce: default_event_debounce(),
            session_name: default_session_name(),
            application_name: None,
            application_version: None,
            cluster_id: None,
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        for cp in &self.contact_points {
            if cp.trim().is_empty() {
                return Err(anyhow!("contact point cannot be empty"));
            }
            if let Some((_, port)) = cp.rsplit_once(':')
                && let Ok(explicit) = port.parse::<u16>()
                && explicit != self.port
            {
                return Err(anyhow!(
                    "contact point '{cp}' disagrees with the configured port {}",
                    self.port
                ));
            }
        }
        if self.pooling.core_local == 0 {
            return Err(anyhow!("core_local must be at least 1"));
        }
        if self.pooling.max_local < self.pooling.core_local {
            return Err(anyhow!("max_local cannot be below core_local"));
        }
        if self.pooling.max_remote < self.pooling.core_remote {
            return Err(anyhow!("max_remote cannot be below core_remote"));
        }
        if self.query.page_size <= 0 {
            return Err(anyhow!("page_size must be positive"));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(anyhow!("reconnect base delay cannot exceed the cap"));
        }
        if self.limits.max_frame_length == 0 {
            return Err(anyhow!("max_frame_length cannot be 0"));
        }
        Ok(())
    }

    /// The protocol version the first connection attempt will propose.
    pub fn initial_protocol_version(&self) -> ProtocolVersion {
        self.protocol_version.unwrap_or(ProtocolVersion::LATEST)
    }

    /// Options advertised in every STARTUP body.
    pub fn startup_options(&self) -> Vec<(String, String)> {
        let mut options = vec![
            ("CQL_VERSION".to_string(), "3.0.0".to_string()),
            ("DRIVER_NAME".to_string(), "Lazulite".to_string()),
            (
                "DRIVER_VERSION".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
        ];
        if let Some(name) = self.compression.startup_name() {
            options.push(("COMPRESSION".to_string(), name.to_string()));
        }
        if let Some(name) = &self.application_name {
            options.push(("APPLICATION_NAME".to_string(), name.clone()));
        }
        if let Some(version) = &self.application_version {
            options.push(("APPLICATION_VERSION".to_string(), version.clone()));
        }
        if let Some(id) = &self.cluster_id {
            options.push(("CLIENT_ID".to_string(), id.clone()));
        }
        options
    }
}
