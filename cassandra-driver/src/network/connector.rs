use super::connection::{Connection, ConnectionConfig};

use crate::cluster::Registry;
use crate::errors::{BrokenConnectionErrorKind, ConnectionError, DbError, RequestAttemptError};

use cassandra_cql::frame::response::event::{Event, EventType};
use cassandra_cql::frame::Compression;
use cassandra_cql::ProtocolVersion;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CQL_VERSION: &str = "3.0.0";

/// Opens ready-to-use connections: TCP connect, OPTIONS, STARTUP,
/// authentication and, for event connections, REGISTER.
///
/// The connector also tracks how many connections are open to each host.
/// The first one reports the host up, and losing the last one to an error
/// reports it down.
pub(crate) struct Connector {
    config: ConnectionConfig,
    registry: Arc<Registry>,
    // Highest version worth trying. Lowered when a server rejects a version,
    // so later connections skip the doomed attempts.
    protocol_version: AtomicU8,
    state: Mutex<ConnectorState>,
}

#[derive(Default)]
struct ConnectorState {
    open_per_host: HashMap<SocketAddr, usize>,
    // Connections opened by `refresh_status`, handed out by the next `connect`.
    spare: HashMap<SocketAddr, Vec<Arc<Connection>>>,
}

impl Connector {
    pub(crate) fn new(config: ConnectionConfig, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            protocol_version: AtomicU8::new(config.protocol_version.as_byte()),
            config,
            registry,
            state: Mutex::new(ConnectorState::default()),
        })
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Version the next connection will start negotiating with.
    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::try_from(self.protocol_version.load(Ordering::Relaxed))
            .unwrap_or(self.config.protocol_version)
    }

    /// Number of open connections to `host` made by this connector.
    pub(crate) fn open_connections(&self, host: SocketAddr) -> usize {
        self.lock_state()
            .open_per_host
            .get(&host)
            .copied()
            .unwrap_or(0)
    }

    /// Opens a data connection to `host`.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        host: SocketAddr,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let spare = {
            let mut state = self.lock_state();
            let spare = state.spare.get_mut(&host).and_then(Vec::pop);
            if state.spare.get(&host).is_some_and(Vec::is_empty) {
                state.spare.remove(&host);
            }
            spare
        };
        if let Some(connection) = spare.filter(|c| !c.is_closed()) {
            return Ok(connection);
        }

        self.connect_and_track(host, None).await
    }

    /// Opens a connection that receives server events, registered for
    /// topology, status and schema changes.
    pub(crate) async fn connect_with_events(
        self: &Arc<Self>,
        host: SocketAddr,
        event_sender: mpsc::Sender<Event>,
    ) -> Result<Arc<Connection>, ConnectionError> {
        self.connect_and_track(host, Some(event_sender)).await
    }

    /// Checks whether a host is reachable, by opening a single connection
    /// unless one is already open. The connection is kept for the next
    /// [`Connector::connect`] to the host.
    pub(crate) async fn refresh_status(self: &Arc<Self>, host: SocketAddr) -> Result<(), ConnectionError> {
        if self.open_connections(host) > 0 {
            self.registry.host_up(host);
            return Ok(());
        }

        info!(%host, "Refreshing host status");
        let connection = self.connect_and_track(host, None).await?;
        self.lock_state()
            .spare
            .entry(host)
            .or_default()
            .push(connection);
        Ok(())
    }

    async fn connect_and_track(
        self: &Arc<Self>,
        host: SocketAddr,
        event_sender: Option<mpsc::Sender<Event>>,
    ) -> Result<Arc<Connection>, ConnectionError> {
        debug!(%host, "Connecting");
        match self.open(host, event_sender).await {
            Ok(connection) => {
                let connection = Arc::new(connection);
                self.watch_closing(host, &connection);
                debug!(%host, version = %connection.version(), "Connected");
                self.connected(host);
                Ok(connection)
            }
            Err(error) => {
                warn!(%host, "Connection failed: {}", error);
                self.connection_error(host, &error);
                Err(error)
            }
        }
    }

    // Negotiates a protocol version, going lower while the server rejects them.
    async fn open(
        &self,
        host: SocketAddr,
        event_sender: Option<mpsc::Sender<Event>>,
    ) -> Result<Connection, ConnectionError> {
        let mut version = self.protocol_version();
        loop {
            match self.open_with_version(host, version, event_sender.clone()).await {
                Err(error) if is_unsupported_version(&error) => {
                    let lower = version
                        .lower()
                        .filter(|_| self.config.allow_protocol_downgrade);
                    let Some(lower) = lower else {
                        return Err(ConnectionError::ProtocolVersionUnsupported(version));
                    };
                    info!(
                        %host,
                        "Protocol version {} rejected, trying again with {}", version, lower
                    );
                    self.protocol_version
                        .fetch_min(lower.as_byte(), Ordering::Relaxed);
                    version = lower;
                }
                result => return result,
            }
        }
    }

    async fn open_with_version(
        &self,
        host: SocketAddr,
        version: ProtocolVersion,
        event_sender: Option<mpsc::Sender<Event>>,
    ) -> Result<Connection, ConnectionError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        let registers = event_sender.is_some();
        let mut connection = Connection::new(host, version, &self.config, event_sender).await?;

        let compression = match tokio::time::timeout_at(deadline, self.negotiate(&connection)).await
        {
            Ok(Ok(compression)) => compression,
            Ok(Err(error)) => {
                connection.close().await;
                return Err(error);
            }
            Err(_) => {
                connection.close().await;
                return Err(ConnectionError::ConnectTimeout);
            }
        };
        connection.set_compression(compression);

        let startup = self.startup(&connection, compression, registers);
        match tokio::time::timeout_at(deadline, startup).await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(error)) => {
                connection.close().await;
                Err(error)
            }
            Err(_) => {
                // Never leave a half-open socket behind.
                connection.close().await;
                Err(ConnectionError::ConnectTimeout)
            }
        }
    }

    async fn negotiate(&self, connection: &Connection) -> Result<Option<Compression>, ConnectionError> {
        let supported = connection.get_options().await?;
        match self.config.compression {
            Some(compression)
                if supported
                    .compression()
                    .iter()
                    .any(|name| name == compression.as_str()) =>
            {
                Ok(Some(compression))
            }
            Some(compression) => {
                debug!(
                    host = %connection.get_connect_address(),
                    "Server does not offer {} compression, continuing without it", compression
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn startup(
        &self,
        connection: &Connection,
        compression: Option<Compression>,
        register: bool,
    ) -> Result<(), ConnectionError> {
        let mut options = HashMap::from([("CQL_VERSION".to_owned(), CQL_VERSION.to_owned())]);
        if let Some(compression) = compression {
            options.insert("COMPRESSION".to_owned(), compression.as_str().to_owned());
        }

        if let Some(authenticate) = connection.startup(options).await? {
            connection
                .perform_authenticate(&authenticate, self.config.authenticator.as_ref())
                .await?;
        }

        if register {
            connection
                .register(vec![
                    EventType::TopologyChange,
                    EventType::StatusChange,
                    EventType::SchemaChange,
                ])
                .await?;
        }
        Ok(())
    }

    fn watch_closing(self: &Arc<Self>, host: SocketAddr, connection: &Arc<Connection>) {
        let closed = connection.closed();
        let connector: Weak<Connector> = Arc::downgrade(self);
        tokio::spawn(async move {
            let cause = closed.await;
            debug!(%host, "Disconnected: {}", cause);
            if let Some(connector) = connector.upgrade() {
                let closed_by_client =
                    matches!(cause.kind(), BrokenConnectionErrorKind::ClosedByClient);
                connector.disconnected(host, !closed_by_client);
            }
        });
    }

    fn connected(&self, host: SocketAddr) {
        let first = {
            let mut state = self.lock_state();
            let open = state.open_per_host.entry(host).or_insert(0);
            *open += 1;
            *open == 1
        };
        if first {
            self.registry.host_up(host);
        }
    }

    fn disconnected(&self, host: SocketAddr, failed: bool) {
        let last = {
            let mut state = self.lock_state();
            let Some(open) = state.open_per_host.get_mut(&host) else {
                return;
            };
            *open -= 1;
            if *open == 0 {
                state.open_per_host.remove(&host);
                true
            } else {
                false
            }
        };
        if last && failed {
            self.registry.host_down(host);
        }
    }

    // Only network failures say anything about the host; errors returned by
    // the server mean it is alive.
    fn connection_error(&self, host: SocketAddr, error: &ConnectionError) {
        let network_failure = matches!(
            error,
            ConnectionError::IoError(_) | ConnectionError::ConnectTimeout
        );
        if network_failure && self.open_connections(host) == 0 {
            self.registry.host_down(host);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_unsupported_version(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::SetupRequestError {
            error: RequestAttemptError::DbError(DbError::ProtocolError, _),
            ..
        }
    )
}
