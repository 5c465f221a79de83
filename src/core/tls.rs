// src/core/tls.rs

//! Builds the rustls connector used to wrap node streams. Handshake
//! internals and certificate validation live in rustls; this module only
//! assembles a `TlsConnector` from the driver configuration.

use crate::config::TlsConfig;
use crate::core::DriverError;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::{TlsConnector, rustls};

/// Assembles a connector from the configured trust anchors, or `None` when
/// TLS is disabled.
pub fn build_connector(config: Option<&TlsConfig>) -> Result<Option<TlsConnector>, DriverError> {
    let Some(config) = config else {
        return Ok(None);
    };
    if !config.enabled {
        return Ok(None);
    }

    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &config.ca_cert_file {
        let file = File::open(path).map_err(|e| {
            DriverError::ConfigError(format!("cannot open CA certificate {path}: {e}"))
        })?;
        let mut reader = BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| {
                DriverError::ConfigError(format!("invalid certificate in {path}: {e}"))
            })?;
            root_cert_store.add(cert).map_err(|e| {
                DriverError::ConfigError(format!("rejected certificate in {path}: {e}"))
            })?;
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    Ok(Some(TlsConnector::from(Arc::new(tls_config))))
}

/// The server name presented during the TLS handshake for a node address.
pub fn server_name(host: &str) -> Result<rustls::pki_types::ServerName<'static>, DriverError> {
    rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| DriverError::ConfigError(format!("invalid TLS server name {host}")))
}
