//! Load balancing configurations\
//! The execution client asks a `LoadBalancingPolicy` for a plan: the ordered
//! list of hosts to try for one request.
//!
//! Policies learn about hosts by listening to the [`Registry`](crate::cluster::Registry).
//! They must be registered before any other listener, so that they see hosts
//! come up first and go down last.

use std::sync::Arc;

use cassandra_cql::Consistency;

use crate::cluster::Host;
use crate::policies::host_listener::HostListener;

mod dc_aware;
mod round_robin;
pub use dc_aware::DcAwareRoundRobinPolicy;
pub use round_robin::RoundRobinPolicy;

/// Represents info about statement that can be used by load balancing policies.
#[derive(Default, Clone, Debug)]
pub struct RoutingInfo<'a> {
    /// Keyspace the request will be executed in, if known.
    pub keyspace: Option<&'a str>,
    /// Requested consistency allows to keep requests with a LOCAL_* consistency
    /// in the local datacenter.
    pub consistency: Consistency,
}

/// A single-use, lazily computed sequence of hosts to try.
pub type Plan = Box<dyn Iterator<Item = Arc<Host>> + Send + Sync>;

/// How the driver should treat a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostDistance {
    /// Used first. Gets the local pool size.
    Local,
    /// Used when local hosts fail. Gets the remote pool size.
    Remote,
    /// Never used; no connections are opened to it.
    Ignore,
}

/// Policy that decides which hosts to contact for each request.
pub trait LoadBalancingPolicy: HostListener + std::fmt::Debug {
    /// Returns the hosts to try, best first.
    fn plan(&self, request: &RoutingInfo) -> Plan;

    /// Tells how far a host is from this client.
    fn distance(&self, host: &Host) -> HostDistance;

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

fn is_local_consistency(consistency: Consistency) -> bool {
    matches!(
        consistency,
        Consistency::LocalOne | Consistency::LocalQuorum
    )
}
