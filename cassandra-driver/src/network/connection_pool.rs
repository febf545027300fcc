use super::connection::Connection;

use crate::errors::ConnectionPoolError;
use crate::policies::load_balancing::HostDistance;

use arc_swap::ArcSwap;
use rand::Rng;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

/// The target size of the per-host connection pools.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Connections opened to each host at [`HostDistance::Local`].
    pub connections_per_local_host: NonZeroUsize,
    /// Connections opened to each host at [`HostDistance::Remote`].
    pub connections_per_remote_host: NonZeroUsize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections_per_local_host: NonZeroUsize::MIN,
            connections_per_remote_host: NonZeroUsize::MIN,
        }
    }
}

impl PoolConfig {
    /// Number of connections a pool to a host at `distance` should hold.
    /// Ignored hosts get no pool at all.
    pub(crate) fn size_for(&self, distance: HostDistance) -> Option<NonZeroUsize> {
        match distance {
            HostDistance::Local => Some(self.connections_per_local_host),
            HostDistance::Remote => Some(self.connections_per_remote_host),
            HostDistance::Ignore => None,
        }
    }
}

/// Open connections to one host.
///
/// Readers work on immutable snapshots; every change swaps in a new list
/// under `write_lock`. A connection removes itself once it is closed.
pub(crate) struct ConnectionPool {
    host: SocketAddr,
    connections: ArcSwap<Vec<Arc<Connection>>>,
    write_lock: Mutex<()>,
}

impl ConnectionPool {
    pub(crate) fn new(host: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            host,
            connections: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        })
    }

    pub(crate) fn host(&self) -> SocketAddr {
        self.host
    }

    /// Adds a connection and arranges for its removal when it closes.
    pub(crate) fn add(self: &Arc<Self>, connection: Arc<Connection>) {
        let closed = connection.closed();
        let pool = Arc::downgrade(self);
        let weak_connection = Arc::downgrade(&connection);

        {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut connections = Vec::clone(&self.connections.load());
            connections.push(connection);
            self.connections.store(Arc::new(connections));
        }

        tokio::spawn(async move {
            let cause = closed.await;
            if let Some(pool) = pool.upgrade() {
                debug!(
                    host = %pool.host,
                    "Removing closed connection from the pool: {}", cause
                );
                pool.remove(&weak_connection);
            }
        });
    }

    fn remove(&self, connection: &Weak<Connection>) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let connections = self.connections.load();
        if !connections
            .iter()
            .any(|c| std::ptr::eq(Arc::as_ptr(c), connection.as_ptr()))
        {
            return;
        }
        let remaining = connections
            .iter()
            .filter(|c| !std::ptr::eq(Arc::as_ptr(c), connection.as_ptr()))
            .cloned()
            .collect();
        self.connections.store(Arc::new(remaining));
    }

    /// Picks one of the open connections at random.
    pub(crate) fn random_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        let connections = self.connections.load();
        let open: Vec<&Arc<Connection>> = connections.iter().filter(|c| !c.is_closed()).collect();
        if open.is_empty() {
            return Err(ConnectionPoolError::Empty(self.host));
        }
        let index = rand::rng().random_range(0..open.len());
        Ok(Arc::clone(open[index]))
    }

    /// A point-in-time copy of the connections, unaffected by later changes.
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<Connection>>> {
        self.connections.load_full()
    }

    pub(crate) fn size(&self) -> usize {
        self.connections.load().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Empties the pool and closes every connection it held.
    pub(crate) async fn close(&self) {
        let connections = {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.connections.swap(Arc::new(Vec::new()))
        };
        futures::future::join_all(connections.iter().map(|c| c.close())).await;
    }
}
