use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use super::{is_local_consistency, HostDistance, LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::Host;
use crate::policies::host_listener::{HostEvent, HostListener};

#[derive(Debug, Default)]
struct DcHosts {
    local: Vec<Arc<Host>>,
    remote: Vec<Arc<Host>>,
}

/// Round robin over the hosts of the local datacenter, followed by round robin
/// over a limited number of hosts of remote datacenters.
///
/// Hosts that report no datacenter are considered local.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    datacenter: String,
    max_remote_hosts: Option<usize>,
    use_remote_hosts_for_local_consistency: bool,
    hosts: ArcSwap<DcHosts>,
    write_lock: Mutex<()>,
    position: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(datacenter: impl Into<String>) -> Self {
        Self {
            datacenter: datacenter.into(),
            max_remote_hosts: None,
            use_remote_hosts_for_local_consistency: false,
            hosts: ArcSwap::from_pointee(DcHosts::default()),
            write_lock: Mutex::new(()),
            position: AtomicUsize::new(0),
        }
    }

    /// Limits how many remote hosts are used. Others are ignored.
    pub fn max_remote_hosts(mut self, max_remote_hosts: usize) -> Self {
        self.max_remote_hosts = Some(max_remote_hosts);
        self
    }

    /// Allows LOCAL_ONE and LOCAL_QUORUM requests to fail over to remote hosts.
    pub fn use_remote_hosts_for_local_consistency(mut self, enabled: bool) -> Self {
        self.use_remote_hosts_for_local_consistency = enabled;
        self
    }

    fn is_local(&self, host: &Host) -> bool {
        host.datacenter()
            .is_none_or(|datacenter| datacenter == self.datacenter)
    }
}

impl HostListener for DcAwareRoundRobinPolicy {
    fn on_event(&self, host: &Host, event: HostEvent) {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self.hosts.load();
        let mut local = current.local.clone();
        let mut remote = current.remote.clone();
        local.retain(|known| known.address() != host.address());
        remote.retain(|known| known.address() != host.address());
        match event {
            HostEvent::Up => {
                if self.is_local(host) {
                    local.push(Arc::new(host.clone()));
                } else if self
                    .max_remote_hosts
                    .is_none_or(|max_remote_hosts| remote.len() < max_remote_hosts)
                {
                    remote.push(Arc::new(host.clone()));
                }
            }
            HostEvent::Down | HostEvent::Lost => {}
            HostEvent::Found => return,
        }
        self.hosts.store(Arc::new(DcHosts { local, remote }));
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn plan(&self, request: &RoutingInfo) -> Plan {
        let hosts = self.hosts.load_full();
        let total = hosts.local.len() + hosts.remote.len();
        if total == 0 {
            return Box::new(std::iter::empty());
        }
        let start = self.position.fetch_add(1, Ordering::Relaxed) % total;

        let use_remote = !is_local_consistency(request.consistency)
            || self.use_remote_hosts_for_local_consistency;
        let local_count = hosts.local.len();
        let remote_count = if use_remote { hosts.remote.len() } else { 0 };

        let local_hosts = Arc::clone(&hosts);
        let local =
            (0..local_count).map(move |i| Arc::clone(&local_hosts.local[(start + i) % local_count]));
        let remote = (0..remote_count)
            .map(move |i| Arc::clone(&hosts.remote[(start + local_count + i) % remote_count]));
        Box::new(local.chain(remote))
    }

    fn distance(&self, host: &Host) -> HostDistance {
        let hosts = self.hosts.load();
        let (known, distance) = if self.is_local(host) {
            (&hosts.local, HostDistance::Local)
        } else {
            (&hosts.remote, HostDistance::Remote)
        };
        if known.iter().any(|known| known.address() == host.address()) {
            distance
        } else {
            HostDistance::Ignore
        }
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_owned()
    }
}
