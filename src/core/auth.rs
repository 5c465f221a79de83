// src/core/auth.rs

//! The SASL-style authentication contract and a plain-text reference
//! implementation.
//!
//! When a server answers STARTUP with AUTHENTICATE(mechanism), the connection
//! asks the provider for an initial response, sends it as AUTH_RESPONSE, and
//! keeps evaluating AUTH_CHALLENGE tokens until AUTH_SUCCESS arrives.

use crate::core::DriverError;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

/// Produces SASL tokens for one authentication exchange.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The first token, sent before any challenge is seen. `mechanism` is the
    /// authenticator class name the server advertised.
    async fn initial_response(&self, mechanism: &str) -> Result<Option<Bytes>, DriverError>;

    /// Answers a server challenge token.
    async fn evaluate_challenge(&self, token: Option<Bytes>) -> Result<Option<Bytes>, DriverError>;

    /// Observes the final token of AUTH_SUCCESS. Most mechanisms ignore it.
    async fn on_success(&self, _token: Option<Bytes>) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Username/password authentication over the PLAIN SASL mechanism.
#[derive(Debug, Clone)]
pub struct PlainTextAuthProvider {
    username: String,
    password: String,
}

impl PlainTextAuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn token(&self) -> Bytes {
        // PLAIN: authzid NUL authcid NUL passwd, with an empty authzid.
        let mut buf = BytesMut::with_capacity(2 + self.username.len() + self.password.len());
        buf.put_u8(0);
        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(self.password.as_bytes());
        buf.freeze()
    }
}

#[async_trait]
impl AuthProvider for PlainTextAuthProvider {
    async fn initial_response(&self, _mechanism: &str) -> Result<Option<Bytes>, DriverError> {
        Ok(Some(self.token()))
    }

    async fn evaluate_challenge(&self, _token: Option<Bytes>) -> Result<Option<Bytes>, DriverError> {
        // PLAIN is a single-round mechanism; a challenge means the server
        // expects a different exchange.
        Err(DriverError::AuthenticationFailed(
            "unexpected challenge during PLAIN authentication".into(),
        ))
    }
}
