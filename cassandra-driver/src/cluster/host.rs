use std::fmt::Display;
use std::net::SocketAddr;

use uuid::Uuid;

/// Whether the driver currently considers a host reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostState {
    Up,
    Down,
}

/// What the cluster reports about a host in `system.local` / `system.peers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub id: Option<Uuid>,
    pub rack: Option<String>,
    pub datacenter: Option<String>,
    pub release_version: Option<String>,
    pub tokens: Vec<String>,
}

/// A host of the cluster, as known to the [`Registry`](super::Registry).
///
/// Hosts are immutable. A change of state replaces the registry entry
/// with a new `Host`, so a snapshot never changes underneath its reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    address: SocketAddr,
    info: HostInfo,
    state: HostState,
}

impl Host {
    pub(crate) fn new(address: SocketAddr, info: HostInfo, state: HostState) -> Self {
        Self {
            address,
            info,
            state,
        }
    }

    /// Address the driver connects to.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn id(&self) -> Option<Uuid> {
        self.info.id
    }

    pub fn rack(&self) -> Option<&str> {
        self.info.rack.as_deref()
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.info.datacenter.as_deref()
    }

    pub fn release_version(&self) -> Option<&str> {
        self.info.release_version.as_deref()
    }

    pub fn tokens(&self) -> &[String] {
        &self.info.tokens
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == HostState::Up
    }

    // Tokens are not part of the identity: a MOVED_NODE keeps the host.
    pub(crate) fn has_identity(&self, info: &HostInfo) -> bool {
        self.info.id == info.id
            && self.info.rack == info.rack
            && self.info.datacenter == info.datacenter
            && self.info.release_version == info.release_version
    }

    pub(crate) fn with_state(&self, state: HostState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    pub(crate) fn with_info(&self, info: HostInfo) -> Self {
        Self {
            info,
            ..self.clone()
        }
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)?;
        if let Some(datacenter) = self.datacenter() {
            write!(f, " ({})", datacenter)?;
        }
        Ok(())
    }
}
