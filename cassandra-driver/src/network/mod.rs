//! Connections to the nodes of the cluster.
//!
//! - [`connection`] multiplexes requests over one socket,
//! - [`connection_pool`] holds the open connections to one host,
//! - [`connector`] opens connections, runs the handshake and keeps
//!   the registry informed about host reachability.

pub(crate) mod connection;
pub(crate) mod connection_pool;
pub(crate) mod connector;

pub use connection::ConnectionConfig;
pub(crate) use connection::{Connection, VerifiedKeyspaceName};
pub(crate) use connection_pool::ConnectionPool;
pub use connection_pool::PoolConfig;
pub(crate) use connector::Connector;
