// src/core/policies/address.rs

//! Address translation: maps the endpoint a node advertises to the endpoint
//! the driver should actually dial (NAT, proxies, port forwarding).

use std::collections::HashMap;
use std::net::SocketAddr;

/// The translation contract.
pub trait AddressTranslator: Send + Sync {
    fn translate(&self, address: SocketAddr) -> SocketAddr;
}

/// The default: addresses are routable as advertised.
#[derive(Debug, Default)]
pub struct IdentityTranslator;

impl AddressTranslator for IdentityTranslator {
    fn translate(&self, address: SocketAddr) -> SocketAddr {
        address
    }
}

/// A static mapping, mostly useful in tests and port-forwarded setups.
#[derive(Debug, Default)]
pub struct FixedMapTranslator {
    mapping: HashMap<SocketAddr, SocketAddr>,
}

impl FixedMapTranslator {
    pub fn new(mapping: HashMap<SocketAddr, SocketAddr>) -> Self {
        Self { mapping }
    }
}

impl AddressTranslator for FixedMapTranslator {
    fn translate(&self, address: SocketAddr) -> SocketAddr {
        self.mapping.get(&address).copied().unwrap_or(address)
    }
}
