use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use super::{HostDistance, LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::Host;
use crate::policies::host_listener::{HostEvent, HostListener};

/// Rotates the starting point of the plan over all up hosts, all of which are local.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    hosts: ArcSwap<Vec<Arc<Host>>>,
    write_lock: Mutex<()>,
    position: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostListener for RoundRobinPolicy {
    fn on_event(&self, host: &Host, event: HostEvent) {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut hosts = Vec::clone(&self.hosts.load());
        hosts.retain(|known| known.address() != host.address());
        match event {
            HostEvent::Up => hosts.push(Arc::new(host.clone())),
            HostEvent::Down | HostEvent::Lost => {}
            HostEvent::Found => return,
        }
        self.hosts.store(Arc::new(hosts));
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan(&self, _request: &RoutingInfo) -> Plan {
        let hosts = self.hosts.load_full();
        if hosts.is_empty() {
            return Box::new(std::iter::empty());
        }
        let start = self.position.fetch_add(1, Ordering::Relaxed) % hosts.len();
        let total = hosts.len();
        Box::new((0..total).map(move |i| Arc::clone(&hosts[(start + i) % total])))
    }

    fn distance(&self, host: &Host) -> HostDistance {
        if self
            .hosts
            .load()
            .iter()
            .any(|known| known.address() == host.address())
        {
            HostDistance::Local
        } else {
            HostDistance::Ignore
        }
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_owned()
    }
}
