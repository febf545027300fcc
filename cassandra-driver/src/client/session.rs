//! `Session` is the main object used in the driver.\
//! It discovers the cluster, keeps connections to its hosts and executes CQL requests.

use std::borrow::Borrow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::net::{lookup_host, ToSocketAddrs};
use tracing::{debug, info, warn};

use super::execution::{ExecutionClient, ExecutionConfig};
use crate::cluster::control_connection::ControlConnection;
use crate::cluster::{ControlConnectionConfig, HostInfo, Registry, SchemaListener};
use crate::errors::{ExecutionError, MetadataError, NewSessionError};
use crate::network::{ConnectionConfig, Connector, PoolConfig};
use crate::policies::address_resolution::{AddressResolutionPolicy, NoAddressResolution};
use crate::policies::host_listener::HostListener;
use crate::policies::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use crate::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::response::QueryResult;
use crate::statement::batch::Batch;
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;
use crate::statement::Values;

const DEFAULT_PORT: u16 = 9042;

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to start from the default
/// and change what is needed.
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Database servers known on Session startup.
    /// Session connects to these nodes to discover the other nodes of the cluster.
    /// Each node can be given as a hostname or an IP address, with an optional port.
    pub known_nodes: Vec<String>,

    /// Timeout of the DNS lookup of each known node. `None` waits forever.
    pub hostname_resolution_timeout: Option<Duration>,

    pub connection: ConnectionConfig,
    pub pool: PoolConfig,
    pub execution: ExecutionConfig,
    pub control_connection: ControlConnectionConfig,

    /// Chooses the hosts each request is sent to and which hosts get connections.
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Delays between attempts to reach hosts that went down.
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
    /// Translates the addresses found in `system.peers`.
    pub address_resolution: Arc<dyn AddressResolutionPolicy>,

    /// Notified about schema changes of the cluster.
    pub schema_listeners: Vec<Arc<dyn SchemaListener>>,
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] with default configuration
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
            connection: ConnectionConfig::default(),
            pool: PoolConfig::default(),
            execution: ExecutionConfig::default(),
            control_connection: ControlConnectionConfig::default(),
            load_balancing: Arc::new(RoundRobinPolicy::new()),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            address_resolution: Arc::new(NoAddressResolution),
            schema_listeners: Vec::new(),
        }
    }

    /// Adds a known database server with a hostname.
    /// If the port is not explicitly specified, 9042 is used as default
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes.push(hostname.as_ref().to_owned());
    }

    /// Adds a known database server with an IP address
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes.push(node_addr.to_string());
    }

    pub fn add_known_nodes(&mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) {
        for hostname in hostnames {
            self.add_known_node(hostname);
        }
    }

    pub fn add_known_nodes_addr(
        &mut self,
        node_addrs: impl IntoIterator<Item = impl Borrow<SocketAddr>>,
    ) {
        for address in node_addrs {
            self.add_known_node_addr(*address.borrow());
        }
    }
}

/// Creates default [`SessionConfig`], same as [`SessionConfig::new`]
impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("known_nodes", &self.known_nodes)
            .field(
                "hostname_resolution_timeout",
                &self.hostname_resolution_timeout,
            )
            .field("connection", &self.connection)
            .field("pool", &self.pool)
            .field("execution", &self.execution)
            .field("control_connection", &self.control_connection)
            .field("load_balancing", &self.load_balancing)
            .field("retry_policy", &self.retry_policy)
            .field("reconnection_policy", &self.reconnection_policy)
            .field("schema_listeners", &self.schema_listeners.len())
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
enum DnsLookupError {
    #[error("Failed to perform DNS lookup within {0}ms")]
    Timeout(u128),
    #[error("Empty address list returned by DNS for {0}")]
    EmptyAddressListForHost(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Performs a DNS lookup with provided optional timeout.
async fn lookup_host_with_timeout(
    host: impl ToSocketAddrs,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<impl Iterator<Item = SocketAddr>, DnsLookupError> {
    if let Some(timeout) = hostname_resolution_timeout {
        match tokio::time::timeout(timeout, lookup_host(host)).await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(DnsLookupError::Timeout(timeout.as_millis())),
        }
    } else {
        lookup_host(host).await.map_err(Into::into)
    }
}

// Resolves "host" or "host:port", preferring IPv4 addresses.
async fn resolve_hostname(
    hostname: &str,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<SocketAddr, DnsLookupError> {
    let addrs = match lookup_host_with_timeout(hostname, hostname_resolution_timeout).await {
        Ok(addrs) => itertools::Either::Left(addrs),
        Err(DnsLookupError::Timeout(t)) => return Err(DnsLookupError::Timeout(t)),
        // Without a port the lookup fails at once; try again with the default one.
        Err(e) => {
            let addrs =
                lookup_host_with_timeout((hostname, DEFAULT_PORT), hostname_resolution_timeout)
                    .await
                    .or(Err(e))?;
            itertools::Either::Right(addrs)
        }
    };

    addrs
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_)))
        .ok_or_else(|| DnsLookupError::EmptyAddressListForHost(hostname.to_owned()))
}

async fn resolve_contact_points(
    known_nodes: &[String],
    hostname_resolution_timeout: Option<Duration>,
) -> Result<Vec<SocketAddr>, NewSessionError> {
    let resolved = futures::future::join_all(
        known_nodes
            .iter()
            .map(|node| resolve_hostname(node, hostname_resolution_timeout)),
    )
    .await;

    let mut contact_points = Vec::with_capacity(known_nodes.len());
    for (node, result) in known_nodes.iter().zip(resolved) {
        match result {
            Ok(address) => contact_points.push(address),
            Err(err) => warn!("Failed to resolve {}: {}", node, err),
        }
    }
    if contact_points.is_empty() {
        return Err(NewSessionError::FailedToResolveAnyHostname(
            known_nodes.to_vec(),
        ));
    }
    // Spreads the control connections of many clients over the contact points.
    let mut contact_points: Vec<SocketAddr> = contact_points.into_iter().unique().collect();
    contact_points.shuffle(&mut rand::rng());
    Ok(contact_points)
}

/// `Session` manages connections to the cluster and allows to execute CQL requests.
pub struct Session {
    registry: Arc<Registry>,
    control_connection: ControlConnection,
    client: Arc<ExecutionClient>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("hosts", &self.registry.each_host().keys().collect::<Vec<_>>())
            .field(
                "control_connection",
                &self.control_connection.connected_address(),
            )
            .field("config", self.client.config())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Establishes a CQL session with the database.
    ///
    /// Opens the control connection to one of the known nodes, discovers the
    /// other hosts of the cluster and opens connection pools to the hosts the
    /// load balancing policy does not ignore.
    pub async fn connect(config: SessionConfig) -> Result<Self, NewSessionError> {
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }
        let contact_points =
            resolve_contact_points(&config.known_nodes, config.hostname_resolution_timeout)
                .await?;
        debug!("Contact points: {:?}", contact_points);

        let registry = Arc::new(Registry::new());
        let connector = Connector::new(config.connection, Arc::clone(&registry));

        let client = ExecutionClient::new(
            Arc::clone(&registry),
            Arc::clone(&connector),
            Arc::clone(&config.load_balancing),
            config.retry_policy,
            Arc::clone(&config.reconnection_policy),
            Arc::clone(&config.address_resolution),
            config.pool,
            config.execution,
        );

        let mut schema_listeners = config.schema_listeners;
        schema_listeners.push(Arc::clone(&client) as Arc<dyn SchemaListener>);
        let control_connection = ControlConnection::new(
            Arc::clone(&registry),
            connector,
            Arc::clone(&config.load_balancing),
            config.reconnection_policy,
            config.address_resolution,
            config.control_connection,
            schema_listeners,
        );

        // The load balancing policy sees hosts come up first and go down last.
        registry.add_listener(Arc::clone(&config.load_balancing) as Arc<dyn HostListener>);
        for contact_point in contact_points {
            registry.host_found(contact_point, HostInfo::default());
        }
        registry.add_listener(control_connection.host_listener());
        control_connection.connect().await?;

        registry.add_listener(Arc::clone(&client) as Arc<dyn HostListener>);
        if let Err(err) = client.connect().await {
            control_connection.close().await;
            return Err(err);
        }

        info!(
            "Session connected to a cluster of {} host(s)",
            registry.each_host().len()
        );
        Ok(Session {
            registry,
            control_connection,
            client,
        })
    }

    /// Executes an unprepared statement with the given values.
    ///
    /// Returns one page of rows: use [`Session::next_page`] to fetch the rest.
    pub async fn query(
        &self,
        statement: impl Into<Statement>,
        values: impl Into<Values>,
    ) -> Result<QueryResult, ExecutionError> {
        self.client
            .query(&statement.into(), &values.into())
            .await
    }

    /// Prepares a statement on the cluster. The returned statement inherits
    /// the options set on `statement`.
    pub async fn prepare(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<PreparedStatement, ExecutionError> {
        self.client.prepare(&statement.into()).await
    }

    /// Executes a prepared statement. Hosts that lost the statement get it
    /// prepared again transparently.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: impl Into<Values>,
    ) -> Result<QueryResult, ExecutionError> {
        self.client.execute(prepared, &values.into()).await
    }

    /// Executes a batch. `values` holds one entry per statement of the batch.
    /// Requires protocol v3 or newer.
    pub async fn batch(
        &self,
        batch: &Batch,
        values: &[Values],
    ) -> Result<QueryResult, ExecutionError> {
        self.client.batch(batch, values).await
    }

    /// Fetches the page following `page`, or `None` if `page` was the last one.
    pub async fn next_page(
        &self,
        page: &QueryResult,
    ) -> Result<Option<QueryResult>, ExecutionError> {
        self.client.next_page(page).await
    }

    /// Sends `USE <keyspace>`. Later requests run in this keyspace on every host.
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), ExecutionError> {
        let keyspace_name = keyspace_name.into();
        let statement = if case_sensitive {
            format!("USE \"{}\"", keyspace_name)
        } else {
            format!("USE {}", keyspace_name)
        };
        self.query(statement, Values::Empty).await?;
        Ok(())
    }

    /// The keyspace set by the last `USE`.
    pub fn get_keyspace(&self) -> Option<String> {
        self.client
            .keyspace()
            .map(|keyspace| keyspace.as_str().to_owned())
    }

    /// Hosts known to this session.
    pub fn get_registry(&self) -> &Registry {
        &self.registry
    }

    /// Reads the hosts of the cluster from the system tables again.
    /// Topology changes are followed through events, so this is rarely needed.
    pub async fn refresh_topology(&self) -> Result<(), MetadataError> {
        self.control_connection.refresh_hosts().await
    }

    /// Closes the control connection and every pooled connection.
    /// Requests issued afterwards fail with [`ClientError::Closed`](crate::errors::ClientError::Closed).
    pub async fn close(&self) {
        self.control_connection.close().await;
        self.client.close().await;
        info!("Session closed");
    }
}
