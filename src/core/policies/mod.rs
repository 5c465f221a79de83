// src/core/policies/mod.rs

//! The pluggable policy contracts and their default implementations.
//!
//! Policies are narrow, object-safe traits shared as `Arc<dyn ...>`. They
//! are pure with respect to the metadata snapshots handed to them and never
//! block.

pub mod address;
pub mod load_balancing;
pub mod reconnect;
pub mod retry;
pub mod speculative;
pub mod timestamp;

pub use address::{AddressTranslator, FixedMapTranslator, IdentityTranslator};
pub use load_balancing::{DefaultLoadBalancing, LoadBalancingPolicy, QueryPlan, RoutingInfo};
pub use reconnect::{
    ConstantReconnection, ExponentialReconnection, ReconnectionPolicy, ReconnectionSchedule,
};
pub use retry::{DefaultRetryPolicy, FallthroughRetryPolicy, RetryDecision, RetryPolicy};
pub use speculative::{
    ConstantSpeculativeExecution, NoSpeculativeExecution, SpeculativeExecutionPolicy,
};
pub use timestamp::{MonotonicTimestampGenerator, TimestampGenerator};

use crate::config::Config;
use std::sync::Arc;

/// The policy bundle a cluster runs with. Every slot has a default; any can
/// be replaced before the cluster is built.
#[derive(Clone)]
pub struct Policies {
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub retry: Arc<dyn RetryPolicy>,
    pub speculative: Arc<dyn SpeculativeExecutionPolicy>,
    pub reconnection: Arc<dyn ReconnectionPolicy>,
    pub address_translator: Arc<dyn AddressTranslator>,
    pub timestamp: Arc<dyn TimestampGenerator>,
}

impl Policies {
    /// Defaults, with the reconnection backoff taken from the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            load_balancing: Arc::new(DefaultLoadBalancing::new()),
            retry: Arc::new(DefaultRetryPolicy),
            speculative: Arc::new(NoSpeculativeExecution),
            reconnection: Arc::new(ExponentialReconnection::new(
                config.reconnect.base_delay,
                config.reconnect.max_delay,
            )),
            address_translator: Arc::new(IdentityTranslator),
            timestamp: Arc::new(MonotonicTimestampGenerator::new()),
        }
    }
}

impl Default for Policies {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
