//! Specially treated single connection used to discover the cluster
//! and receive events from it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use cassandra_cql::frame::response::event::{
    Event, SchemaChangeEvent, StatusChangeEvent, TopologyChangeEvent,
};
use cassandra_cql::frame::response::result::Rows;
use cassandra_cql::value::Row;
use cassandra_cql::CqlValue;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use super::host::{Host, HostInfo};
use super::registry::Registry;
use super::schema_events::{SchemaEventCoalescer, SchemaRefresh, SchemaRefresher};
use crate::errors::{ControlConnectionError, MetadataError, NewSessionError};
use crate::network::{Connection, Connector};
use crate::policies::address_resolution::AddressResolutionPolicy;
use crate::policies::host_listener::{HostEvent, HostListener};
use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy, RoutingInfo};
use crate::policies::reconnection::{ReconnectionPolicy, ReconnectionSchedule};

const SELECT_LOCAL: &str = "SELECT data_center, rack, host_id, release_version, tokens FROM system.local WHERE key='local'";
const SELECT_PEERS: &str =
    "SELECT peer, rpc_address, data_center, rack, host_id, release_version, tokens FROM system.peers";

// Events are handled one at a time; the rest wait in the channel.
const EVENT_CHANNEL_SIZE: usize = 128;

/// Settings of the control connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ControlConnectionConfig {
    /// Schema changes are refreshed once no new change arrived for this long...
    pub schema_event_debounce: Duration,
    /// ...or once the oldest buffered change has waited this long.
    pub schema_event_window: Duration,
    /// Whether to read the schema tables at all. When disabled, schema
    /// change events are only passed to the [`SchemaListener`]s.
    pub schema_metadata: bool,
}

impl Default for ControlConnectionConfig {
    fn default() -> Self {
        Self {
            schema_event_debounce: Duration::from_secs(1),
            schema_event_window: Duration::from_secs(10),
            schema_metadata: true,
        }
    }
}

/// Rows read from one system schema table.
#[derive(Debug, Clone)]
pub struct SchemaTable {
    pub name: &'static str,
    pub rows: Rows,
}

/// Receives schema changes seen by the control connection.
///
/// Both callbacks run on the control connection's tasks and should return quickly.
pub trait SchemaListener: Send + Sync {
    /// Called for every SCHEMA_CHANGE event pushed by the cluster.
    fn on_schema_change(&self, _change: &SchemaChangeEvent) {}

    /// Called with the contents of the schema tables after each refresh.
    fn on_schema_refreshed(&self, _refresh: &SchemaRefresh, _tables: &[SchemaTable]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Closed,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

struct State {
    status: Status,
    // Hosts whose reachability is being checked, with the generation of the check.
    refreshing_statuses: HashMap<SocketAddr, u64>,
    next_generation: u64,
    // Peers being refreshed after an event.
    refreshing_hosts: HashSet<SocketAddr>,
}

/// The connection used to learn about the cluster.
///
/// It fills the [`Registry`] from `system.local` and `system.peers`, follows
/// topology and status events, checks the reachability of hosts that went
/// down and keeps the schema refreshed. When the connection breaks, it is
/// reopened to the first available host of a load balancing plan, on the
/// reconnection schedule.
pub(crate) struct ControlConnection {
    inner: Arc<Inner>,
    _schema_worker: RemoteHandle<()>,
}

struct Inner {
    registry: Arc<Registry>,
    connector: Arc<Connector>,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    reconnection: Arc<dyn ReconnectionPolicy>,
    address_resolution: Arc<dyn AddressResolutionPolicy>,
    config: ControlConnectionConfig,
    schema_listeners: Vec<Arc<dyn SchemaListener>>,

    connection: ArcSwapOption<Connection>,
    state: Mutex<State>,
    // Wakes the reconnection loop when a host comes back up.
    host_up: Notify,
    schema_requests: Mutex<Option<mpsc::UnboundedSender<SchemaRefresh>>>,
    self_ref: Weak<Inner>,
}

impl ControlConnection {
    pub(crate) fn new(
        registry: Arc<Registry>,
        connector: Arc<Connector>,
        load_balancing: Arc<dyn LoadBalancingPolicy>,
        reconnection: Arc<dyn ReconnectionPolicy>,
        address_resolution: Arc<dyn AddressResolutionPolicy>,
        config: ControlConnectionConfig,
        schema_listeners: Vec<Arc<dyn SchemaListener>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|self_ref| Inner {
            registry,
            connector,
            load_balancing,
            reconnection,
            address_resolution,
            config,
            schema_listeners,
            connection: ArcSwapOption::empty(),
            state: Mutex::new(State {
                status: Status::Closed,
                refreshing_statuses: HashMap::new(),
                next_generation: 0,
                refreshing_hosts: HashSet::new(),
            }),
            host_up: Notify::new(),
            schema_requests: Mutex::new(None),
            self_ref: Weak::clone(self_ref),
        });

        let (sender, coalescer) = SchemaEventCoalescer::new(
            inner.config.schema_event_debounce,
            inner.config.schema_event_window,
            Arc::clone(&inner) as Arc<dyn SchemaRefresher>,
        );
        *inner
            .schema_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sender);
        let (worker, handle) = coalescer.run().remote_handle();
        tokio::spawn(worker);

        ControlConnection {
            inner,
            _schema_worker: handle,
        }
    }

    /// The listener to register in the registry, right after the load balancing policy.
    pub(crate) fn host_listener(&self) -> Arc<dyn HostListener> {
        Arc::clone(&self.inner) as Arc<dyn HostListener>
    }

    /// Connects to the first available host of a load balancing plan and
    /// reads the cluster topology.
    pub(crate) async fn connect(&self) -> Result<(), NewSessionError> {
        {
            let mut state = self.inner.lock_state();
            match state.status {
                Status::Connecting | Status::Connected | Status::Reconnecting => return Ok(()),
                Status::Closed | Status::Closing => state.status = Status::Connecting,
            }
        }

        let result = self.inner.connect_to_first_available().await;
        if result.is_err() {
            self.inner.lock_state().status = Status::Closed;
        }
        result
    }

    pub(crate) async fn close(&self) {
        {
            let mut state = self.inner.lock_state();
            if matches!(state.status, Status::Closing | Status::Closed) {
                return;
            }
            state.status = Status::Closing;
            state.refreshing_statuses.clear();
        }
        if let Some(connection) = self.inner.connection.swap(None) {
            connection.close().await;
        }
        self.inner.lock_state().status = Status::Closed;
        // Stops the schema worker once it is done with the current batch.
        self.inner
            .schema_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Address of the host the control connection is open to.
    pub(crate) fn connected_address(&self) -> Option<SocketAddr> {
        self.inner
            .connection
            .load()
            .as_ref()
            .filter(|connection| !connection.is_closed())
            .map(|connection| connection.get_connect_address())
    }

    /// Reads `system.local` and `system.peers` again.
    pub(crate) async fn refresh_hosts(&self) -> Result<(), MetadataError> {
        self.inner.refresh_hosts().await
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> Status {
        self.lock_state().status
    }

    fn is_closing(&self) -> bool {
        matches!(self.status(), Status::Closing | Status::Closed)
    }

    fn request_schema_refresh(&self, refresh: SchemaRefresh) {
        if !self.config.schema_metadata {
            return;
        }
        if let Some(sender) = self
            .schema_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = sender.send(refresh);
        }
    }

    async fn connect_to_first_available(&self) -> Result<(), NewSessionError> {
        let plan = self.load_balancing.plan(&RoutingInfo::default());
        let mut errors = HashMap::new();

        for host in plan {
            let address = host.address();
            debug!(%address, "Opening control connection");
            match self.connect_to(address).await {
                Ok(()) => {
                    info!(%address, "Control connection established");
                    return Ok(());
                }
                Err(err) => {
                    debug!(%address, "Control connection failed: {}", err);
                    errors.insert(address, err);
                }
            }
        }

        if errors.is_empty() && self.lock_state().refreshing_statuses.is_empty() {
            error!(
                "Control connection failed and is unlikely to recover. This usually means \
                 that all hosts are ignored by the load balancing policy, most likely because \
                 they changed datacenters. Reconnection attempts will keep repeating this message."
            );
        }
        Err(NewSessionError::ControlConnection { errors })
    }

    async fn connect_to(&self, address: SocketAddr) -> Result<(), ControlConnectionError> {
        let (event_sender, event_receiver) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let connection = self
            .connector
            .connect_with_events(address, event_sender)
            .await?;

        self.connection.store(Some(Arc::clone(&connection)));
        self.watch_closing(&connection);
        self.spawn_event_loop(event_receiver);

        self.with_retry("hosts", || self.refresh_hosts()).await?;

        let closing = {
            let mut state = self.lock_state();
            if connection.is_closed() {
                return Err(MetadataError::NotConnected.into());
            }
            match state.status {
                Status::Closing | Status::Closed => true,
                _ => {
                    state.status = Status::Connected;
                    false
                }
            }
        };
        if closing {
            connection.close().await;
            return Err(MetadataError::NotConnected.into());
        }

        self.request_schema_refresh(SchemaRefresh::Full);
        Ok(())
    }

    fn watch_closing(&self, connection: &Arc<Connection>) {
        let closed = connection.closed();
        let watched = Arc::downgrade(connection);
        let inner = Weak::clone(&self.self_ref);
        tokio::spawn(async move {
            let cause = closed.await;
            let Some(inner) = inner.upgrade() else {
                return;
            };

            let reconnect = {
                let mut state = inner.lock_state();
                let current = inner.connection.load();
                let is_current = current
                    .as_ref()
                    .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), watched.as_ptr()));
                if !is_current {
                    return;
                }
                inner.connection.store(None);
                info!("Control connection closed: {}", cause);

                match state.status {
                    Status::Closing => {
                        state.status = Status::Closed;
                        false
                    }
                    Status::Connected => {
                        state.status = Status::Reconnecting;
                        true
                    }
                    // The connecting flow notices the closed connection itself.
                    _ => false,
                }
            };
            if reconnect {
                tokio::spawn(async move { inner.reconnect().await });
            }
        });
    }

    async fn reconnect(&self) {
        let mut schedule = self.reconnection.schedule();
        loop {
            let Some(delay) = schedule.next() else {
                error!("Reconnection schedule ended; the control connection stays closed");
                self.lock_state().status = Status::Closed;
                return;
            };
            debug!("Reestablishing control connection in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.host_up.notified() => {}
            }
            if self.status() != Status::Reconnecting {
                return;
            }
            match self.connect_to_first_available().await {
                Ok(()) => return,
                Err(err) => error!("Control connection failed: {}", err),
            }
        }
    }

    fn spawn_event_loop(&self, mut events: mpsc::Receiver<Event>) {
        let inner = Weak::clone(&self.self_ref);
        // Ends when the connection drops its sender, that is when it closes.
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.handle_event(event).await;
            }
        });
    }

    async fn handle_event(&self, event: Event) {
        debug!("Event received: {:?}", event);
        match event {
            Event::SchemaChange(change) => {
                for listener in &self.schema_listeners {
                    listener.on_schema_change(&change);
                }
                self.request_schema_refresh(SchemaRefresh::for_event(&change));
            }
            Event::StatusChange(StatusChangeEvent::Up(address)) => {
                let address = self.event_address(address).await;
                if self.registry.has_host(address) {
                    self.spawn_host_refresh(address);
                }
            }
            Event::StatusChange(StatusChangeEvent::Down(address)) => {
                let address = self.event_address(address).await;
                self.registry.host_down(address);
            }
            Event::TopologyChange(TopologyChangeEvent::NewNode(address)) => {
                let address = self.event_address(address).await;
                if !self.registry.has_host(address) {
                    self.spawn_host_refresh(address);
                    self.request_schema_refresh(SchemaRefresh::Full);
                }
            }
            Event::TopologyChange(TopologyChangeEvent::RemovedNode(address)) => {
                let address = self.event_address(address).await;
                self.registry.host_lost(address);
                self.request_schema_refresh(SchemaRefresh::Full);
            }
            Event::TopologyChange(TopologyChangeEvent::MovedNode(address)) => {
                let address = self.event_address(address).await;
                self.spawn_host_refresh(address);
            }
        }
    }

    // Events carry the rpc address of the host; hosts are known by their
    // resolved address and the port of the cluster.
    async fn event_address(&self, address: SocketAddr) -> SocketAddr {
        let ip = self.address_resolution.resolve(address.ip()).await;
        SocketAddr::new(ip, self.port().unwrap_or(address.port()))
    }

    fn port(&self) -> Option<u16> {
        self.connection
            .load()
            .as_ref()
            .map(|connection| connection.get_connect_address().port())
    }

    fn spawn_host_refresh(&self, address: SocketAddr) {
        if !self.lock_state().refreshing_hosts.insert(address) {
            return;
        }
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let result = inner
                .with_retry("host", || inner.refresh_host(address))
                .await;
            if let Err(err) = result {
                warn!(%address, "Failed to refresh host: {}", err);
            }
            inner.lock_state().refreshing_hosts.remove(&address);
        });
    }

    /// Runs `operation` until it succeeds. Transient errors are retried on the
    /// reconnection schedule; any other error closes the connection.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, MetadataError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MetadataError>>,
    {
        let mut schedule: Option<ReconnectionSchedule> = None;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transient() {
                if let Some(connection) = self.connection.load_full() {
                    connection.close().await;
                }
                return Err(err);
            }
            if self.is_closing() {
                return Err(err);
            }
            let Some(delay) = schedule
                .get_or_insert_with(|| self.reconnection.schedule())
                .next()
            else {
                return Err(err);
            };
            info!("Failed to refresh {} ({}), retrying in {:?}", what, err, delay);
            tokio::time::sleep(delay).await;
        }
    }

    fn current_connection(&self) -> Result<Arc<Connection>, MetadataError> {
        self.connection
            .load_full()
            .filter(|connection| !connection.is_closed())
            .ok_or(MetadataError::NotConnected)
    }

    async fn refresh_hosts(&self) -> Result<(), MetadataError> {
        let connection = self.current_connection()?;
        let connect_address = connection.get_connect_address();

        let (local, peers) =
            futures::try_join!(connection.select(SELECT_LOCAL), connection.select(SELECT_PEERS))?;
        debug!("{} peer(s) found", peers.rows.len());

        let mut found = Vec::new();
        if let Some(row) = local.rows.first() {
            found.push((connect_address, host_info(&local, row, "system.local")?));
        }
        for row in &peers.rows {
            let Some(address) =
                peer_address(&peers, row, &*self.address_resolution, connect_address.port()).await
            else {
                warn!("Ignoring a peer row without an address");
                continue;
            };
            found.push((address, host_info(&peers, row, "system.peers")?));
        }

        let addresses: HashSet<SocketAddr> = found.iter().map(|(address, _)| *address).collect();
        for (address, info) in found {
            self.registry.host_found(address, info);
        }
        for address in self.registry.each_host().keys() {
            if !addresses.contains(address) {
                self.registry.host_lost(*address);
            }
        }
        Ok(())
    }

    async fn refresh_host(&self, address: SocketAddr) -> Result<(), MetadataError> {
        let connection = self.current_connection()?;
        let connect_address = connection.get_connect_address();

        if address == connect_address {
            let local = connection.select(SELECT_LOCAL).await?;
            if let Some(row) = local.rows.first() {
                self.registry
                    .host_found(address, host_info(&local, row, "system.local")?);
            }
            return Ok(());
        }

        let query = format!("{} WHERE peer = '{}'", SELECT_PEERS, address.ip());
        let peers = connection.select(&query).await?;
        for row in &peers.rows {
            let peer =
                peer_address(&peers, row, &*self.address_resolution, connect_address.port()).await;
            if peer == Some(address) {
                self.registry
                    .host_found(address, host_info(&peers, row, "system.peers")?);
            }
        }
        Ok(())
    }

    fn on_host_down(&self, host: &Host) {
        if self.is_closing() || self.load_balancing.distance(host) == HostDistance::Ignore {
            return;
        }
        let address = host.address();
        let generation = {
            let mut state = self.lock_state();
            if state.refreshing_statuses.contains_key(&address) {
                return;
            }
            let generation = state.next_generation;
            state.next_generation += 1;
            state.refreshing_statuses.insert(address, generation);
            generation
        };
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move { inner.refresh_status(address, generation).await });
    }

    // Tries to reach a down host on the reconnection schedule until it is
    // reachable again or no longer of interest.
    async fn refresh_status(&self, address: SocketAddr, generation: u64) {
        let mut schedule = self.reconnection.schedule();
        while let Some(delay) = schedule.next() {
            debug!(%address, "Checking host status in {:?}", delay);
            tokio::time::sleep(delay).await;
            if self.lock_state().refreshing_statuses.get(&address) != Some(&generation) {
                return;
            }
            match self.connector.refresh_status(address).await {
                Ok(()) => break,
                Err(err) => debug!(%address, "Host is still unreachable: {}", err),
            }
        }
        let mut state = self.lock_state();
        if state.refreshing_statuses.get(&address) == Some(&generation) {
            state.refreshing_statuses.remove(&address);
        }
    }
}

impl HostListener for Inner {
    fn on_event(&self, host: &Host, event: HostEvent) {
        match event {
            HostEvent::Found => {}
            HostEvent::Up => {
                self.lock_state().refreshing_statuses.remove(&host.address());
                if self.status() == Status::Reconnecting
                    && self.load_balancing.distance(host) != HostDistance::Ignore
                {
                    self.host_up.notify_one();
                }
            }
            HostEvent::Down => self.on_host_down(host),
            HostEvent::Lost => {
                self.lock_state().refreshing_statuses.remove(&host.address());
            }
        }
    }
}

#[async_trait]
impl SchemaRefresher for Inner {
    async fn refresh_schema(&self, refresh: &SchemaRefresh) {
        let result = self
            .with_retry("schema", || self.read_schema(refresh))
            .await;
        match result {
            Ok(tables) => {
                for listener in &self.schema_listeners {
                    listener.on_schema_refreshed(refresh, &tables);
                }
            }
            Err(err) => warn!("Failed to refresh schema ({:?}): {}", refresh, err),
        }
    }
}

impl Inner {
    async fn read_schema(&self, refresh: &SchemaRefresh) -> Result<Vec<SchemaTable>, MetadataError> {
        let connection = self.current_connection()?;
        let queries = schema_queries(refresh);
        let results = futures::future::try_join_all(
            queries
                .iter()
                .map(|(_, query)| connection.select(query.as_str())),
        )
        .await?;
        Ok(queries
            .into_iter()
            .zip(results)
            .map(|((name, _), rows)| SchemaTable { name, rows })
            .collect())
    }
}

fn quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// The system tables holding the part of the schema to refresh, with the query reading it.
fn schema_queries(refresh: &SchemaRefresh) -> Vec<(&'static str, String)> {
    let select = |table: &'static str, filter: String| {
        (table, format!("SELECT * FROM system.{}{}", table, filter))
    };
    match refresh {
        SchemaRefresh::Full => ["schema_keyspaces", "schema_columnfamilies", "schema_columns", "schema_usertypes"]
            .into_iter()
            .map(|table| select(table, String::new()))
            .collect(),
        SchemaRefresh::Keyspace { keyspace } => {
            let filter = format!(" WHERE keyspace_name = {}", quoted(keyspace));
            ["schema_keyspaces", "schema_columnfamilies", "schema_columns", "schema_usertypes"]
                .into_iter()
                .map(|table| select(table, filter.clone()))
                .collect()
        }
        SchemaRefresh::Table { keyspace, table } => {
            let filter = format!(
                " WHERE keyspace_name = {} AND columnfamily_name = {}",
                quoted(keyspace),
                quoted(table)
            );
            vec![
                select("schema_columnfamilies", filter.clone()),
                select("schema_columns", filter),
            ]
        }
        SchemaRefresh::Type {
            keyspace,
            type_name,
        } => vec![select(
            "schema_usertypes",
            format!(
                " WHERE keyspace_name = {} AND type_name = {}",
                quoted(keyspace),
                quoted(type_name)
            ),
        )],
        SchemaRefresh::Function {
            keyspace,
            function_name,
            ..
        } => vec![select(
            "schema_functions",
            format!(
                " WHERE keyspace_name = {} AND function_name = {}",
                quoted(keyspace),
                quoted(function_name)
            ),
        )],
        SchemaRefresh::Aggregate {
            keyspace,
            aggregate_name,
            ..
        } => vec![select(
            "schema_aggregates",
            format!(
                " WHERE keyspace_name = {} AND aggregate_name = {}",
                quoted(keyspace),
                quoted(aggregate_name)
            ),
        )],
    }
}

/// The value of the named column of `row`.
pub(crate) fn column<'a>(rows: &Rows, row: &'a Row, name: &str) -> Option<&'a CqlValue> {
    let index = rows
        .metadata
        .col_specs
        .iter()
        .position(|spec| spec.name == name)?;
    row.get(index)
}

/// Connect address of a `system.peers` row: the `rpc_address`, or the
/// `peer` column when the host listens on all interfaces, as resolved by
/// the address resolution policy.
pub(crate) async fn peer_address(
    rows: &Rows,
    row: &Row,
    resolver: &dyn AddressResolutionPolicy,
    port: u16,
) -> Option<SocketAddr> {
    let rpc_address = column(rows, row, "rpc_address").and_then(CqlValue::as_inet);
    let ip: IpAddr = match rpc_address {
        Some(ip) if !ip.is_unspecified() => ip,
        _ => column(rows, row, "peer").and_then(CqlValue::as_inet)?,
    };
    Some(SocketAddr::new(resolver.resolve(ip).await, port))
}

fn host_info(rows: &Rows, row: &Row, table: &'static str) -> Result<HostInfo, MetadataError> {
    let text = |name: &str| -> Result<Option<String>, MetadataError> {
        match column(rows, row, name) {
            None => Ok(None),
            Some(value) => value
                .as_text()
                .map(|text| Some(text.to_owned()))
                .ok_or_else(|| MetadataError::BadRow {
                    table,
                    reason: format!("{} is a {}, not text", name, value.kind_name()),
                }),
        }
    };

    let id = match column(rows, row, "host_id") {
        None => None,
        Some(value) => Some(value.as_uuid().ok_or_else(|| MetadataError::BadRow {
            table,
            reason: format!("host_id is a {}, not a uuid", value.kind_name()),
        })?),
    };
    let tokens = match column(rows, row, "tokens") {
        None => Vec::new(),
        Some(value) => value
            .as_list()
            .ok_or_else(|| MetadataError::BadRow {
                table,
                reason: format!("tokens is a {}, not a set", value.kind_name()),
            })?
            .iter()
            .filter_map(|token| token.as_text().map(str::to_owned))
            .collect(),
    };

    Ok(HostInfo {
        id,
        rack: text("rack")?,
        datacenter: text("data_center")?,
        release_version: text("release_version")?,
        tokens,
    })
}
