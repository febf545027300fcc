use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use super::host::{Host, HostInfo, HostState};
use crate::policies::host_listener::{HostEvent, HostListener};

type HostMap = HashMap<SocketAddr, Arc<Host>>;

/// Directory of the hosts of the cluster.
///
/// Readers get immutable snapshots and never wait for writers. Writers are
/// serialized by a lock, and listeners are notified after the lock is released,
/// so a listener may call back into the registry.
pub struct Registry {
    hosts: ArcSwap<HostMap>,
    listeners: ArcSwap<Vec<Arc<dyn HostListener>>>,
    write_lock: Mutex<()>,
}

// A notification to deliver once the write lock is released.
enum Notification {
    Found(Arc<Host>),
    Lost(Arc<Host>),
    Up(Arc<Host>),
    Down(Arc<Host>),
}

impl Registry {
    pub fn new() -> Self {
        Self {
            hosts: ArcSwap::from_pointee(HashMap::new()),
            listeners: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn HostListener>) {
        let _guard = self.lock();
        let mut listeners = Vec::clone(&self.listeners.load());
        listeners.push(listener);
        self.listeners.store(Arc::new(listeners));
    }

    pub fn remove_listener(&self, listener: &Arc<dyn HostListener>) {
        let _guard = self.lock();
        let mut listeners = Vec::clone(&self.listeners.load());
        listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        self.listeners.store(Arc::new(listeners));
    }

    /// A point-in-time copy of all hosts. Later changes are not visible in it.
    pub fn each_host(&self) -> Arc<HostMap> {
        self.hosts.load_full()
    }

    pub fn host(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts.load().get(&address).cloned()
    }

    pub fn has_host(&self, address: SocketAddr) -> bool {
        self.hosts.load().contains_key(&address)
    }

    /// Records a host reported by the cluster.
    ///
    /// A host with the same identity is kept (and marked up). A host whose
    /// identity changed is replaced: the old one is lost before the new one is found.
    pub fn host_found(&self, address: SocketAddr, info: HostInfo) {
        let notifications = {
            let _guard = self.lock();
            let mut notifications = Vec::new();
            let current = self.hosts.load().get(&address).cloned();

            let host = match current {
                Some(host) if host.has_identity(&info) => {
                    if host.is_up() && host.tokens() == info.tokens.as_slice() {
                        return;
                    }
                    let updated = Arc::new(host.with_info(info).with_state(HostState::Up));
                    if !host.is_up() {
                        notifications.push(Notification::Up(Arc::clone(&updated)));
                    }
                    updated
                }
                Some(host) => {
                    Self::lost_notifications(&host, &mut notifications);
                    Self::found_notifications(address, info, &mut notifications)
                }
                None => Self::found_notifications(address, info, &mut notifications),
            };

            self.update(|hosts| {
                hosts.insert(address, host);
            });
            notifications
        };
        self.notify(notifications);
    }

    pub fn host_up(&self, address: SocketAddr) {
        self.toggle(address, HostState::Up);
    }

    pub fn host_down(&self, address: SocketAddr) {
        self.toggle(address, HostState::Down);
    }

    pub fn host_lost(&self, address: SocketAddr) {
        let notifications = {
            let _guard = self.lock();
            let Some(host) = self.hosts.load().get(&address).cloned() else {
                return;
            };
            self.update(|hosts| {
                hosts.remove(&address);
            });
            let mut notifications = Vec::new();
            Self::lost_notifications(&host, &mut notifications);
            notifications
        };
        self.notify(notifications);
    }

    fn toggle(&self, address: SocketAddr, state: HostState) {
        let notifications = {
            let _guard = self.lock();
            let host = match self.hosts.load().get(&address) {
                Some(host) if host.state() != state => Arc::new(host.with_state(state)),
                _ => return,
            };
            self.update(|hosts| {
                hosts.insert(address, Arc::clone(&host));
            });
            match state {
                HostState::Up => vec![Notification::Up(host)],
                HostState::Down => vec![Notification::Down(host)],
            }
        };
        self.notify(notifications);
    }

    fn found_notifications(
        address: SocketAddr,
        info: HostInfo,
        notifications: &mut Vec<Notification>,
    ) -> Arc<Host> {
        let host = Arc::new(Host::new(address, info, HostState::Up));
        notifications.push(Notification::Found(Arc::clone(&host)));
        notifications.push(Notification::Up(Arc::clone(&host)));
        host
    }

    fn lost_notifications(host: &Arc<Host>, notifications: &mut Vec<Notification>) {
        if host.is_up() {
            let down = Arc::new(host.with_state(HostState::Down));
            notifications.push(Notification::Down(Arc::clone(&down)));
            notifications.push(Notification::Lost(down));
        } else {
            notifications.push(Notification::Lost(Arc::clone(host)));
        }
    }

    // Must be called with the write lock held.
    fn update(&self, f: impl FnOnce(&mut HostMap)) {
        let mut hosts = HostMap::clone(&self.hosts.load());
        f(&mut hosts);
        self.hosts.store(Arc::new(hosts));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Up/found events go to listeners in registration order,
    // down/lost events in reverse order.
    fn notify(&self, notifications: Vec<Notification>) {
        let listeners = self.listeners.load_full();
        for notification in notifications {
            let (host, event) = match &notification {
                Notification::Found(host) => (host, HostEvent::Found),
                Notification::Up(host) => (host, HostEvent::Up),
                Notification::Down(host) => (host, HostEvent::Down),
                Notification::Lost(host) => (host, HostEvent::Lost),
            };
            debug!("Host {} event: {:?}", host.address(), event);

            let deliver = |listener: &Arc<dyn HostListener>| {
                let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_event(host, event)));
                if delivered.is_err() {
                    warn!(
                        "Host listener panicked while handling {:?} of {}",
                        event,
                        host.address()
                    );
                }
            };
            match event {
                HostEvent::Found | HostEvent::Up => listeners.iter().for_each(deliver),
                HostEvent::Down | HostEvent::Lost => listeners.iter().rev().for_each(deliver),
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("hosts", &self.hosts.load())
            .field("listeners", &self.listeners.load().len())
            .finish()
    }
}
