//! Resolution of the addresses that peers report about themselves into
//! addresses the driver can connect to.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

/// Translates an address reported by the cluster (the `rpc_address` or `peer`
/// column of `system.peers`, or an address in an event) into a connect address.
///
/// Contact points given to the session are never resolved.
#[async_trait]
pub trait AddressResolutionPolicy: Send + Sync {
    async fn resolve(&self, address: IpAddr) -> IpAddr;
}

/// Connects to the reported addresses as they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAddressResolution;

#[async_trait]
impl AddressResolutionPolicy for NoAddressResolution {
    async fn resolve(&self, address: IpAddr) -> IpAddr {
        address
    }
}

/// Translates addresses through a fixed map, passing unknown addresses through.
#[derive(Debug, Default, Clone)]
pub struct StaticAddressResolution {
    rules: HashMap<IpAddr, IpAddr>,
}

impl StaticAddressResolution {
    pub fn new(rules: HashMap<IpAddr, IpAddr>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl AddressResolutionPolicy for StaticAddressResolution {
    async fn resolve(&self, address: IpAddr) -> IpAddr {
        self.rules.get(&address).copied().unwrap_or(address)
    }
}

/// Resolves the IP part of `address`, keeping its port.
pub(crate) async fn resolve_socket_addr(
    policy: &dyn AddressResolutionPolicy,
    address: SocketAddr,
) -> SocketAddr {
    SocketAddr::new(policy.resolve(address.ip()).await, address.port())
}
