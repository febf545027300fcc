//! The request pipeline: takes a logical operation, walks a load balancing
//! plan and carries the operation out on the hosts of the plan.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use cassandra_cql::frame::frame_errors::RowsParseError;
use cassandra_cql::frame::request::{self, batch::BatchStatement as RequestBatchStatement};
use cassandra_cql::frame::request::query::QueryParameters;
use cassandra_cql::frame::request::SerializableRequest;
use cassandra_cql::frame::response::event::{SchemaChangeEvent, SchemaChangeType};
use cassandra_cql::frame::response::result::{self, Prepared, ResultMetadata};
use cassandra_cql::frame::response::NonErrorResponse;
use cassandra_cql::{Consistency, SerialConsistency};
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, trace, trace_span, warn, Instrument};
use uuid::Uuid;

use crate::cluster::control_connection::peer_address;
use crate::cluster::{Host, Registry, SchemaListener};
use crate::errors::{
    ClientError, ConnectionError, DbError, ExecutionError, NewSessionError, RequestAttemptError,
    SchemaAgreementError, UseKeyspaceError,
};
use crate::network::{Connection, ConnectionPool, Connector, PoolConfig, VerifiedKeyspaceName};
use crate::policies::address_resolution::AddressResolutionPolicy;
use crate::policies::host_listener::{HostEvent, HostListener};
use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy, RoutingInfo};
use crate::policies::reconnection::ReconnectionPolicy;
use crate::policies::retry::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
use crate::policies::timestamp_generator::TimestampGenerator;
use crate::response::{ExecutionInfo, NonErrorQueryResponse, PagingOrigin, QueryResult};
use crate::statement::batch::{Batch, BatchStatement};
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;
use crate::statement::{StatementConfig, Values};

const SELECT_SCHEMA_PEERS: &str = "SELECT peer, rpc_address, schema_version FROM system.peers";

/// Defaults applied to statements that do not set the option themselves.
#[derive(Clone)]
#[non_exhaustive]
pub struct ExecutionConfig {
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    /// Rows per page. `None` asks the server for all rows at once.
    pub page_size: Option<i32>,
    /// Whether statements are idempotent unless marked otherwise.
    /// Only idempotent statements are sent to another host after a client-side timeout.
    pub is_idempotent: bool,
    /// Overrides the request timeout of the connections.
    pub request_timeout: Option<Duration>,
    /// How often schema versions are compared after a schema change.
    pub schema_agreement_interval: Duration,
    /// How long to wait for the hosts to agree on the schema after a change.
    pub max_schema_agreement_wait: Duration,
    /// Generates the default timestamp of statements without one (protocol v3+).
    pub timestamp_generator: Option<Arc<dyn TimestampGenerator>>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            consistency: Consistency::default(),
            serial_consistency: None,
            page_size: Some(5000),
            is_idempotent: false,
            request_timeout: None,
            schema_agreement_interval: Duration::from_millis(200),
            max_schema_agreement_wait: Duration::from_secs(10),
            timestamp_generator: None,
        }
    }
}

impl fmt::Debug for ExecutionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionConfig")
            .field("consistency", &self.consistency)
            .field("serial_consistency", &self.serial_consistency)
            .field("page_size", &self.page_size)
            .field("is_idempotent", &self.is_idempotent)
            .field("request_timeout", &self.request_timeout)
            .field("schema_agreement_interval", &self.schema_agreement_interval)
            .field("max_schema_agreement_wait", &self.max_schema_agreement_wait)
            .field(
                "timestamp_generator",
                &self.timestamp_generator.as_ref().map(|_| "..."),
            )
            .finish()
    }
}

type PrepareFuture = Shared<BoxFuture<'static, Result<Prepared, RequestAttemptError>>>;

/// Executes queries, prepared statements and batches on the cluster.
///
/// Keeps a connection pool for every up host that is not ignored by the load
/// balancing policy; pools follow the registry through [`HostListener`] events.
pub(crate) struct ExecutionClient {
    registry: Arc<Registry>,
    connector: Arc<Connector>,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    reconnection: Arc<dyn ReconnectionPolicy>,
    address_resolution: Arc<dyn AddressResolutionPolicy>,
    pool_config: PoolConfig,
    config: ExecutionConfig,

    pools: ArcSwap<HashMap<SocketAddr, Arc<ConnectionPool>>>,
    // Guards writes of `pools` and the set of hosts being connected to.
    connecting: Mutex<HashSet<SocketAddr>>,
    keyspace: ArcSwapOption<VerifiedKeyspaceName>,

    // CQL text -> prepared id, shared by all hosts.
    prepared_statements: DashMap<String, Bytes>,
    // PREPAREs in flight, per host and CQL text.
    preparing_statements: DashMap<(SocketAddr, String), PrepareFuture>,

    closed: AtomicBool,
    self_ref: Weak<ExecutionClient>,
}

/// How an attempt on one host failed.
enum AttemptError {
    /// Classified by the retry rules: may lead to another attempt.
    Request(RequestAttemptError),
    /// Ends the operation at once.
    Fatal(ExecutionError),
}

impl From<RequestAttemptError> for AttemptError {
    fn from(error: RequestAttemptError) -> Self {
        AttemptError::Request(error)
    }
}

impl From<ClientError> for AttemptError {
    fn from(error: ClientError) -> Self {
        AttemptError::Fatal(ExecutionError::Client(error))
    }
}

enum RunResult<T> {
    Completed(T),
    /// The retry policy decided to ignore the error.
    Ignored,
}

/// A decoded RESULT together with the connection it came from.
struct Answer {
    result: result::Result,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
    custom_payload: Option<HashMap<String, Bytes>>,
    connection: Arc<Connection>,
}

impl Answer {
    /// Checks that `response` is a RESULT and decodes deferred rows with
    /// `result_metadata`, so that a host answering garbage fails its attempt.
    fn decode(
        response: NonErrorQueryResponse,
        connection: Arc<Connection>,
        result_metadata: Option<&ResultMetadata>,
    ) -> Result<Answer, RequestAttemptError> {
        let result = match response.response {
            NonErrorResponse::Result(result::Result::RawRows(raw)) => {
                let metadata = result_metadata.ok_or(RowsParseError::MissingResultMetadata)?;
                result::Result::Rows(raw.materialize(metadata, connection.codec())?)
            }
            NonErrorResponse::Result(result) => result,
            other => return Err(RequestAttemptError::UnexpectedResponse(other.kind())),
        };
        Ok(Answer {
            result,
            tracing_id: response.tracing_id,
            warnings: response.warnings,
            custom_payload: response.custom_payload,
            connection,
        })
    }
}

/// Per-operation state threaded through the attempts.
struct RequestContext {
    is_idempotent: bool,
    consistency: Consistency,
    retry_session: Box<dyn RetrySession>,
    errors: HashMap<SocketAddr, RequestAttemptError>,
    info: ExecutionInfo,
    attempts: usize,
}

impl ExecutionClient {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<Registry>,
        connector: Arc<Connector>,
        load_balancing: Arc<dyn LoadBalancingPolicy>,
        retry_policy: Arc<dyn RetryPolicy>,
        reconnection: Arc<dyn ReconnectionPolicy>,
        address_resolution: Arc<dyn AddressResolutionPolicy>,
        pool_config: PoolConfig,
        config: ExecutionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| ExecutionClient {
            registry,
            connector,
            load_balancing,
            retry_policy,
            reconnection,
            address_resolution,
            pool_config,
            config,
            pools: ArcSwap::from_pointee(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            keyspace: ArcSwapOption::empty(),
            prepared_statements: DashMap::new(),
            preparing_statements: DashMap::new(),
            closed: AtomicBool::new(false),
            self_ref: Weak::clone(self_ref),
        })
    }

    pub(crate) fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Opens the pools of all up hosts that are not ignored.
    ///
    /// Succeeds if at least one host could be connected to. Hosts that could
    /// not be reached are retried in the background on the reconnection schedule.
    pub(crate) async fn connect(&self) -> Result<(), NewSessionError> {
        let hosts: Vec<(SocketAddr, HostDistance)> = self
            .registry
            .each_host()
            .values()
            .filter(|host| host.is_up())
            .map(|host| (host.address(), self.load_balancing.distance(host)))
            .filter(|(_, distance)| *distance != HostDistance::Ignore)
            .collect();

        let results = futures::future::join_all(
            hosts
                .iter()
                .map(|(address, distance)| self.connect_to_host(*address, *distance)),
        )
        .await;

        let mut errors = HashMap::new();
        let mut connected = false;
        for ((address, _), result) in hosts.into_iter().zip(results) {
            match result {
                Ok(()) => connected = true,
                Err(err) => {
                    self.spawn_reconnect(address);
                    errors.insert(address, err);
                }
            }
        }

        if connected {
            info!("Connected to {} host(s)", self.pools.load().len());
            Ok(())
        } else {
            Err(NewSessionError::NoConnections { errors })
        }
    }

    /// Closes every pool. Further operations fail with [`ClientError::Closed`].
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pools = {
            let _guard = self.lock_connecting();
            self.pools.swap(Arc::new(HashMap::new()))
        };
        futures::future::join_all(pools.values().map(|pool| pool.close())).await;
        self.preparing_statements.clear();
        info!("Execution client closed");
    }

    /// The keyspace set by the last `USE` statement.
    pub(crate) fn keyspace(&self) -> Option<Arc<VerifiedKeyspaceName>> {
        self.keyspace.load_full()
    }

    fn lock_connecting(&self) -> std::sync::MutexGuard<'_, HashSet<SocketAddr>> {
        self.connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn pool(&self, address: SocketAddr) -> Option<Arc<ConnectionPool>> {
        self.pools.load().get(&address).cloned()
    }

    async fn connect_to_host(
        &self,
        address: SocketAddr,
        distance: HostDistance,
    ) -> Result<(), ConnectionError> {
        let Some(size) = self.pool_config.size_for(distance) else {
            return Ok(());
        };
        if !self.lock_connecting().insert(address) {
            return Ok(());
        }

        let missing = size
            .get()
            .saturating_sub(self.pool(address).map_or(0, |pool| pool.size()));
        let results = futures::future::join_all(
            (0..missing).map(|_| self.connector.connect(address)),
        )
        .await;

        let mut connections = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(connection) => connections.push(connection),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        let keep = {
            let mut connecting = self.lock_connecting();
            connecting.remove(&address);
            let host_usable = self.registry.host(address).is_some_and(|host| host.is_up());
            if self.closed.load(Ordering::SeqCst) || !host_usable {
                false
            } else if connections.is_empty() {
                // Connections that were already pooled keep the host usable.
                return match (self.pool(address), first_error) {
                    (Some(_), _) | (None, None) => Ok(()),
                    (None, Some(err)) => Err(err),
                };
            } else {
                let pool = match self.pool(address) {
                    Some(pool) => pool,
                    None => {
                        let pool = ConnectionPool::new(address);
                        let mut pools = HashMap::clone(&self.pools.load());
                        pools.insert(address, Arc::clone(&pool));
                        self.pools.store(Arc::new(pools));
                        pool
                    }
                };
                for connection in &connections {
                    pool.add(Arc::clone(connection));
                }
                true
            }
        };

        if !keep {
            futures::future::join_all(connections.iter().map(|c| c.close())).await;
            return Ok(());
        }
        debug!(%address, "Opened {} connection(s)", connections.len());
        Ok(())
    }

    fn spawn_reconnect(&self, address: SocketAddr) {
        let Some(client) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut schedule = client.reconnection.schedule();
            while let Some(delay) = schedule.next() {
                debug!(%address, "Reconnecting in {:?}", delay);
                tokio::time::sleep(delay).await;
                if client.closed.load(Ordering::SeqCst) || client.pool(address).is_some() {
                    return;
                }
                let distance = match client.registry.host(address) {
                    Some(host) if host.is_up() => client.load_balancing.distance(&host),
                    _ => return,
                };
                if distance == HostDistance::Ignore {
                    return;
                }
                match client.connect_to_host(address, distance).await {
                    Ok(()) => return,
                    Err(err) => debug!(%address, "Failed to reconnect: {}", err),
                }
            }
        });
    }

    fn remove_pool(&self, address: SocketAddr) {
        let pool = {
            let _guard = self.lock_connecting();
            let pools = self.pools.load();
            if !pools.contains_key(&address) {
                return;
            }
            let mut pools = HashMap::clone(&pools);
            let pool = pools.remove(&address);
            self.pools.store(Arc::new(pools));
            pool
        };
        self.preparing_statements
            .retain(|(host, _), _| *host != address);
        if let Some(pool) = pool {
            debug!(%address, "Closing the pool");
            tokio::spawn(async move { pool.close().await });
        }
    }

    fn keyspace_dropped(&self, keyspace: &str) {
        let current = self.keyspace.load();
        if current
            .as_ref()
            .is_some_and(|current| current.as_str() == keyspace)
        {
            info!("Keyspace {} was dropped", keyspace);
            self.keyspace.store(None);
        }
    }

    fn context(&self, config: &StatementConfig) -> RequestContext {
        let consistency = config.determine_consistency(self.config.consistency);
        RequestContext {
            is_idempotent: config.is_idempotent.unwrap_or(self.config.is_idempotent),
            consistency,
            retry_session: self.retry_policy.new_session(),
            errors: HashMap::new(),
            info: ExecutionInfo::new(consistency),
            attempts: 0,
        }
    }

    fn timeout(&self, config: &StatementConfig) -> Option<Duration> {
        config.request_timeout.or(self.config.request_timeout)
    }

    fn parameters(
        &self,
        config: &StatementConfig,
        connection: &Connection,
        consistency: Consistency,
        values: request::SerializedValues,
        skip_metadata: bool,
    ) -> QueryParameters {
        let timestamp = config.timestamp.or_else(|| {
            self.config
                .timestamp_generator
                .as_ref()
                .filter(|_| connection.version().supports_query_flags())
                .map(|generator| generator.next_timestamp())
        });
        QueryParameters {
            consistency,
            serial_consistency: config
                .serial_consistency
                .or(self.config.serial_consistency),
            timestamp,
            page_size: config.page_size.or(self.config.page_size),
            paging_state: config.paging_state.clone(),
            skip_metadata,
            values,
        }
    }

    /// Walks the plan until an attempt succeeds or the operation fails.
    async fn run<T, F, Fut>(
        &self,
        config: &StatementConfig,
        context: &mut RequestContext,
        mut attempt: F,
    ) -> Result<RunResult<T>, ExecutionError>
    where
        F: FnMut(Arc<Connection>, Consistency) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed.into());
        }
        let keyspace = self.keyspace.load_full();
        let plan = self.load_balancing.plan(&RoutingInfo {
            keyspace: keyspace.as_deref().map(VerifiedKeyspaceName::as_str),
            consistency: context.consistency,
        });
        let timeout = self.timeout(config);

        'plan: for host in plan {
            let address = host.address();
            let span = trace_span!("Executing request", host = %address);
            'same_host: loop {
                let connection = match self.pool(address).map(|pool| pool.random_connection()) {
                    Some(Ok(connection)) => connection,
                    _ => {
                        trace!(parent: &span, "Host is not connected");
                        context.errors.insert(address, RequestAttemptError::NotConnected);
                        continue 'plan;
                    }
                };

                if let Some(keyspace) = &keyspace {
                    match connection
                        .use_keyspace(keyspace, timeout.or(connection.request_timeout()))
                        .instrument(span.clone())
                        .await
                    {
                        Ok(()) => {}
                        Err(UseKeyspaceError::RequestError(err))
                            if err.is_host_error()
                                || (err.is_timeout() && context.is_idempotent) =>
                        {
                            trace!(parent: &span, error = %err, "Keyspace switch failed");
                            context.errors.insert(address, err);
                            continue 'plan;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }

                if context.attempts > 0 {
                    context.info.retries += 1;
                }
                context.attempts += 1;
                context.info.hosts.push(address);
                context.info.consistency = context.consistency;

                trace!(parent: &span, "Sending");
                let error = match attempt(connection, context.consistency)
                    .instrument(span.clone())
                    .await
                {
                    Ok(value) => {
                        trace!(parent: &span, "Request succeeded");
                        return Ok(RunResult::Completed(value));
                    }
                    Err(AttemptError::Fatal(err)) => return Err(err),
                    Err(AttemptError::Request(err)) => err,
                };

                let decision = match &error {
                    RequestAttemptError::DbError(
                        DbError::Unavailable { .. }
                        | DbError::ReadTimeout { .. }
                        | DbError::WriteTimeout { .. },
                        _,
                    ) => context.retry_session.decide_should_retry(RequestInfo {
                        error: &error,
                        is_idempotent: context.is_idempotent,
                        consistency: context.consistency,
                    }),
                    err if err.is_host_error() || (err.is_timeout() && context.is_idempotent) => {
                        RetryDecision::RetryNextHost(None)
                    }
                    // A host answering with something it should not is skipped.
                    RequestAttemptError::UnexpectedResponse(_)
                    | RequestAttemptError::RowsParseError(_) => RetryDecision::RetryNextHost(None),
                    _ => RetryDecision::DontRetry,
                };
                trace!(parent: &span, error = %error, ?decision, "Request failed");

                match decision {
                    RetryDecision::RetrySameHost(consistency) => {
                        context.consistency = consistency.unwrap_or(context.consistency);
                        continue 'same_host;
                    }
                    RetryDecision::RetryNextHost(consistency) => {
                        context.consistency = consistency.unwrap_or(context.consistency);
                        context.errors.insert(address, error);
                        continue 'plan;
                    }
                    RetryDecision::DontRetry => {
                        return Err(ExecutionError::from_attempt(
                            error,
                            &context.info.hosts,
                            context.info.retries,
                        ))
                    }
                    RetryDecision::Ignore => return Ok(RunResult::Ignored),
                }
            }
        }

        Err(ExecutionError::NoHostsAvailable {
            errors: std::mem::take(&mut context.errors),
        })
    }

    async fn send(
        &self,
        connection: &Arc<Connection>,
        request: &impl SerializableRequest,
        config: &StatementConfig,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        let timeout = self.timeout(config).or(connection.request_timeout());
        connection
            .send_request(request, config.tracing, config.custom_payload.as_ref(), timeout)
            .await?
            .into_non_error_query_response()
    }

    /// Prepares `contents` on the host of `connection`, sharing the PREPARE
    /// with concurrent callers preparing the same text on the same host.
    async fn prepare_on(
        &self,
        connection: &Arc<Connection>,
        contents: &str,
        timeout: Option<Duration>,
    ) -> Result<Prepared, RequestAttemptError> {
        let key = (connection.get_connect_address(), contents.to_owned());
        let preparation = self
            .preparing_statements
            .entry(key.clone())
            .or_insert_with(|| {
                let connection = Arc::clone(connection);
                let contents = contents.to_owned();
                async move {
                    let timeout = timeout.or(connection.request_timeout());
                    connection.prepare(&contents, timeout).await
                }
                .boxed()
                .shared()
            })
            .clone();

        let result = preparation.clone().await;
        self.preparing_statements
            .remove_if(&key, |_, pending| pending.ptr_eq(&preparation));
        if let Ok(prepared) = &result {
            self.prepared_statements
                .insert(contents.to_owned(), prepared.id.clone());
        }
        result
    }

    /// The id to execute `contents` with on the host of `connection`.
    async fn statement_id(
        &self,
        connection: &Arc<Connection>,
        contents: &str,
        known_id: Option<&Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Bytes, RequestAttemptError> {
        let key = (connection.get_connect_address(), contents.to_owned());
        let in_flight = self.preparing_statements.contains_key(&key);
        if !in_flight {
            let cached = self
                .prepared_statements
                .get(contents)
                .map(|id| id.value().clone())
                .or_else(|| known_id.cloned());
            if let Some(id) = cached {
                return Ok(id);
            }
        }
        Ok(self.prepare_on(connection, contents, timeout).await?.id)
    }

    pub(crate) async fn query(
        &self,
        statement: &Statement,
        values: &Values,
    ) -> Result<QueryResult, ExecutionError> {
        let mut context = self.context(&statement.config);
        let result = self
            .run(&statement.config, &mut context, |connection, consistency| async move {
                let values = values.serialize(connection.codec(), None)?;
                let query = request::Query {
                    contents: statement.contents.clone(),
                    parameters: self.parameters(
                        &statement.config,
                        &connection,
                        consistency,
                        values,
                        false,
                    ),
                };
                let response = self.send(&connection, &query, &statement.config).await?;
                Ok(Answer::decode(response, connection, None)?)
            })
            .await?;

        let origin = PagingOrigin::Statement(statement.clone(), values.clone());
        self.finish(result, context.info, Some(origin)).await
    }

    pub(crate) async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: &Values,
    ) -> Result<QueryResult, ExecutionError> {
        let config = &prepared.config;
        let mut context = self.context(config);
        let timeout = self.timeout(config);
        let result = self
            .run(config, &mut context, |connection, consistency| async move {
                let serialized = values
                    .serialize(connection.codec(), Some(prepared.get_variable_col_specs()))?;
                let mut execute = request::Execute {
                    id: self
                        .statement_id(
                            &connection,
                            prepared.get_statement(),
                            Some(prepared.get_id()),
                            timeout,
                        )
                        .await?,
                    parameters: self.parameters(
                        config,
                        &connection,
                        consistency,
                        serialized,
                        prepared.can_skip_metadata(),
                    ),
                };

                let mut reprepared = false;
                loop {
                    match self.send(&connection, &execute, config).await {
                        Err(RequestAttemptError::DbError(DbError::Unprepared { statement_id }, _))
                            if !reprepared =>
                        {
                            debug!(
                                id = ?statement_id,
                                "Statement is not prepared on {}, preparing it again",
                                connection.get_connect_address()
                            );
                            execute.id = self
                                .prepare_on(&connection, prepared.get_statement(), timeout)
                                .await?
                                .id;
                            reprepared = true;
                        }
                        result => {
                            return Ok(Answer::decode(
                                result?,
                                connection,
                                Some(prepared.get_result_metadata()),
                            )?)
                        }
                    }
                }
            })
            .await?;

        let origin = PagingOrigin::Prepared(prepared.clone(), values.clone());
        self.finish(result, context.info, Some(origin)).await
    }

    pub(crate) async fn batch(
        &self,
        batch: &Batch,
        values: &[Values],
    ) -> Result<QueryResult, ExecutionError> {
        if values.len() != batch.statements.len() {
            return Err(ClientError::ValueCountMismatch {
                expected: batch.statements.len(),
                received: values.len(),
            }
            .into());
        }
        let config = &batch.config;
        let mut context = self.context(config);
        let timeout = self.timeout(config);
        let result = self
            .run(config, &mut context, |connection, consistency| async move {
                if !connection.version().supports_query_flags() {
                    return Err(ClientError::NotSupportedByVersion {
                        what: "BATCH",
                        version: connection.version(),
                    }
                    .into());
                }

                let mut serialized = Vec::with_capacity(values.len());
                for (statement, values) in batch.statements.iter().zip(values) {
                    let col_specs = match statement {
                        BatchStatement::PreparedStatement(prepared) => {
                            Some(prepared.get_variable_col_specs())
                        }
                        _ => None,
                    };
                    serialized.push(values.serialize(connection.codec(), col_specs)?);
                }

                // Only children missing on this host get prepared; the rest reuse their ids.
                let statements = futures::future::try_join_all(batch.statements.iter().map(
                    |statement| {
                        let connection = &connection;
                        async move {
                            Ok::<_, RequestAttemptError>(match statement {
                                BatchStatement::Query(query) => RequestBatchStatement::Query {
                                    text: query.contents.clone(),
                                },
                                BatchStatement::PreparedStatement(prepared) => {
                                    RequestBatchStatement::Prepared {
                                        id: self
                                            .statement_id(
                                                connection,
                                                prepared.get_statement(),
                                                Some(prepared.get_id()),
                                                timeout,
                                            )
                                            .await?,
                                    }
                                }
                            })
                        }
                    },
                ))
                .await?;

                let parameters =
                    self.parameters(config, &connection, consistency, Default::default(), false);
                let mut request = request::Batch {
                    statements,
                    batch_type: batch.get_type(),
                    consistency: parameters.consistency,
                    serial_consistency: parameters.serial_consistency,
                    timestamp: parameters.timestamp,
                    values: serialized,
                };

                let mut reprepared = false;
                loop {
                    match self.send(&connection, &request, config).await {
                        Err(RequestAttemptError::DbError(DbError::Unprepared { statement_id }, _))
                            if !reprepared =>
                        {
                            let child = request.statements.iter().position(|statement| {
                                matches!(statement, RequestBatchStatement::Prepared { id } if *id == statement_id)
                            });
                            let Some(index) = child else {
                                return Err(AttemptError::Fatal(ExecutionError::Internal(format!(
                                    "Server reported unprepared statement {:?}, which is not part of the batch",
                                    statement_id
                                ))));
                            };
                            let contents = batch.statements[index].contents();
                            debug!(
                                id = ?statement_id,
                                "Batch statement is not prepared on {}, preparing it again",
                                connection.get_connect_address()
                            );
                            let id = self.prepare_on(&connection, contents, timeout).await?.id;
                            request.statements[index] = RequestBatchStatement::Prepared { id };
                            reprepared = true;
                        }
                        result => return Ok(Answer::decode(result?, connection, None)?),
                    }
                }
            })
            .await?;

        self.finish(result, context.info, None).await
    }

    pub(crate) async fn prepare(
        &self,
        statement: &Statement,
    ) -> Result<PreparedStatement, ExecutionError> {
        let config = &statement.config;
        let mut context = self.context(config);
        // Preparing twice has no other effect.
        context.is_idempotent = true;
        let timeout = self.timeout(config);
        let result = self
            .run(config, &mut context, |connection, _| async move {
                Ok(self
                    .prepare_on(&connection, &statement.contents, timeout)
                    .await?)
            })
            .await?;

        match result {
            RunResult::Completed(prepared) => Ok(PreparedStatement::new(
                prepared.id,
                statement.contents.clone(),
                prepared.prepared_metadata,
                prepared.result_metadata,
                statement.config.clone(),
            )),
            RunResult::Ignored => Err(ExecutionError::Internal(
                "Preparing a statement cannot be ignored".to_owned(),
            )),
        }
    }

    /// Fetches the page following `page`, or `None` if it was the last one.
    pub(crate) async fn next_page(
        &self,
        page: &QueryResult,
    ) -> Result<Option<QueryResult>, ExecutionError> {
        match page.next_page_origin() {
            None => Ok(None),
            Some(PagingOrigin::Statement(statement, values)) => {
                self.query(&statement, &values).await.map(Some)
            }
            Some(PagingOrigin::Prepared(prepared, values)) => {
                self.execute(&prepared, &values).await.map(Some)
            }
        }
    }

    /// Turns the answer of the successful attempt into the caller's result.
    async fn finish(
        &self,
        result: RunResult<Answer>,
        mut info: ExecutionInfo,
        origin: Option<PagingOrigin>,
    ) -> Result<QueryResult, ExecutionError> {
        let Answer {
            result,
            tracing_id,
            warnings,
            custom_payload,
            connection,
        } = match result {
            RunResult::Completed(answer) => answer,
            RunResult::Ignored => return Ok(QueryResult::void(info)),
        };
        info.tracing_id = tracing_id;
        info.warnings = warnings;
        info.custom_payload = custom_payload;
        for warning in &info.warnings {
            warn!("Server warning: {}", warning);
        }

        match result {
            result::Result::Void => Ok(QueryResult::void(info)),
            result::Result::Rows(rows) => {
                let mut page = QueryResult::new(Some(rows), None, info);
                page.paging = origin;
                Ok(page)
            }
            result::Result::SetKeyspace(set_keyspace) => {
                let keyspace = VerifiedKeyspaceName::from_server(&set_keyspace.keyspace_name)
                    .map_err(ClientError::from)?;
                debug!("Keyspace set to {}", keyspace.as_str());
                self.keyspace.store(Some(Arc::new(keyspace)));
                Ok(QueryResult::void(info))
            }
            result::Result::SchemaChange(change) => {
                if let SchemaChangeEvent::KeyspaceChange {
                    change_type: SchemaChangeType::Dropped,
                    keyspace_name,
                } = &change.event
                {
                    self.keyspace_dropped(keyspace_name);
                }
                info.schema_in_agreement = Some(self.wait_for_schema_agreement(&connection).await);
                Ok(QueryResult::new(None, Some(change.event), info))
            }
            result::Result::RawRows(_) | result::Result::Prepared(_) => {
                Err(ExecutionError::Internal(
                    "Received an undecoded or PREPARED result for a request that is not PREPARE"
                        .to_owned(),
                ))
            }
        }
    }

    /// Polls schema versions on `connection` until all live, non-ignored hosts
    /// agree, or the maximum wait elapses.
    async fn wait_for_schema_agreement(&self, connection: &Connection) -> bool {
        let deadline = Instant::now() + self.config.max_schema_agreement_wait;
        loop {
            match self.check_schema_agreement(connection).await {
                Ok(true) => {
                    debug!("All hosts have the same schema");
                    return true;
                }
                Ok(false) => {}
                Err(err) => debug!("Failed to check schema agreement: {}", err),
            }
            let interval = self.config.schema_agreement_interval;
            if Instant::now() + interval > deadline {
                let err = SchemaAgreementError::Timeout(self.config.max_schema_agreement_wait);
                warn!("Schema agreement failed: {}", err);
                return false;
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn check_schema_agreement(
        &self,
        connection: &Connection,
    ) -> Result<bool, SchemaAgreementError> {
        let (local_version, peers) = futures::try_join!(connection.fetch_schema_version(), async {
            Ok::<_, SchemaAgreementError>(connection.select(SELECT_SCHEMA_PEERS).await?)
        })?;

        let counts = |host: Option<Arc<Host>>| {
            host.is_some_and(|host| {
                host.is_up() && self.load_balancing.distance(&host) != HostDistance::Ignore
            })
        };

        let mut versions: HashSet<Uuid> = HashSet::new();
        let address = connection.get_connect_address();
        if counts(self.registry.host(address)) {
            versions.insert(local_version);
        }
        for row in &peers.rows {
            let Some(peer) =
                peer_address(&peers, row, &*self.address_resolution, address.port()).await
            else {
                continue;
            };
            if !counts(self.registry.host(peer)) {
                continue;
            }
            let version = crate::cluster::control_connection::column(&peers, row, "schema_version")
                .and_then(|value| value.as_uuid())
                .ok_or_else(|| SchemaAgreementError::BadRow {
                    table: "system.peers",
                    reason: format!("missing schema_version of {}", peer),
                })?;
            versions.insert(version);
        }

        if versions.len() > 1 {
            debug!("Hosts have different schema versions: {:?}", versions);
        }
        Ok(versions.len() <= 1)
    }
}

impl HostListener for ExecutionClient {
    fn on_event(&self, host: &Host, event: HostEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let address = host.address();
        match event {
            HostEvent::Found => {}
            HostEvent::Up => {
                let distance = self.load_balancing.distance(host);
                if distance == HostDistance::Ignore || self.pool(address).is_some() {
                    return;
                }
                let Some(client) = self.self_ref.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(err) = client.connect_to_host(address, distance).await {
                        debug!(%address, "Failed to connect: {}", err);
                        client.spawn_reconnect(address);
                    }
                });
            }
            HostEvent::Down | HostEvent::Lost => self.remove_pool(address),
        }
    }
}

impl SchemaListener for ExecutionClient {
    fn on_schema_change(&self, change: &SchemaChangeEvent) {
        if let SchemaChangeEvent::KeyspaceChange {
            change_type: SchemaChangeType::Dropped,
            keyspace_name,
        } = change
        {
            self.keyspace_dropped(keyspace_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::HostInfo;
    use crate::network::ConnectionConfig;
    use crate::policies::address_resolution::NoAddressResolution;
    use crate::policies::reconnection::ConstantReconnectionPolicy;
    use crate::policies::retry::DefaultRetryPolicy;
    use crate::errors::CqlResponseKind;
    use crate::test_utils::{
        prepared_with_result, setup_tracing, FixedOrderPolicy, MockNode, MockResponse,
    };
    use assert_matches::assert_matches;
    use cassandra_cql::frame::request::{Request, RequestOpcode};
    use cassandra_cql::frame::response::result::{ColumnType, RawRows};
    use cassandra_cql::frame::response::Response;
    use cassandra_cql::CqlValue;
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_millis(200);

    async fn client_for(nodes: &[&MockNode], config: ExecutionConfig) -> Arc<ExecutionClient> {
        let registry = Arc::new(Registry::new());
        let order: Vec<SocketAddr> = nodes.iter().map(|node| node.addr()).collect();
        let policy = Arc::new(FixedOrderPolicy::new(Arc::clone(&registry), order.clone()));
        registry.add_listener(Arc::clone(&policy) as Arc<dyn HostListener>);
        for address in order {
            registry.host_found(address, HostInfo::default());
        }

        let connector = Connector::new(
            ConnectionConfig {
                heartbeat_interval: None,
                idle_timeout: None,
                request_timeout: Some(TIMEOUT),
                ..Default::default()
            },
            Arc::clone(&registry),
        );
        let client = ExecutionClient::new(
            Arc::clone(&registry),
            connector,
            policy,
            Arc::new(DefaultRetryPolicy::new()),
            Arc::new(ConstantReconnectionPolicy::new(Duration::from_millis(50))),
            Arc::new(NoAddressResolution),
            PoolConfig::default(),
            config,
        );
        client.connect().await.unwrap();
        registry.add_listener(Arc::clone(&client) as Arc<dyn HostListener>);
        client
    }

    fn is_query(request: &Request, contents: &str) -> bool {
        matches!(request, Request::Query(query) if query.contents == contents)
    }

    async fn node_timing_out_on(contents: &'static str) -> MockNode {
        MockNode::builder()
            .handler(move |request| {
                if is_query(request, contents) {
                    MockResponse::NoResponse
                } else {
                    MockNode::default_response(request)
                }
            })
            .start()
            .await
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn idempotent_statement_moves_on_after_a_timeout() {
        setup_tracing();
        let slow = node_timing_out_on("SELECT * FROM ks.t").await;
        let fast = MockNode::start().await;
        let client = client_for(&[&slow, &fast], ExecutionConfig::default()).await;

        let mut statement = Statement::new("SELECT * FROM ks.t");
        statement.set_is_idempotent(true);
        let result = client.query(&statement, &Values::Empty).await.unwrap();

        assert_eq!(result.info().hosts, vec![slow.addr(), fast.addr()]);
        assert_eq!(result.info().retries, 1);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn non_idempotent_statement_fails_on_a_timeout() {
        setup_tracing();
        let slow = node_timing_out_on("INSERT INTO ks.t (a) VALUES (1)").await;
        let fast = MockNode::start().await;
        let client = client_for(&[&slow, &fast], ExecutionConfig::default()).await;

        let statement = Statement::new("INSERT INTO ks.t (a) VALUES (1)");
        let err = client.query(&statement, &Values::Empty).await.unwrap_err();

        assert_matches!(
            err,
            ExecutionError::RequestTimeout { timeout, hosts, retries: 0 }
                if timeout == TIMEOUT && hosts == vec![slow.addr()]
        );
        assert_eq!(fast.count_received(RequestOpcode::Query), 0);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn exhausted_plan_reports_every_host() {
        setup_tracing();
        let overloaded = || {
            MockNode::builder().handler(|request| match request {
                Request::Query(_) => MockResponse::error(DbError::Overloaded, "overloaded"),
                other => MockNode::default_response(other),
            })
        };
        let first = overloaded().start().await;
        let second = overloaded().start().await;
        let client = client_for(&[&first, &second], ExecutionConfig::default()).await;

        let err = client
            .query(&Statement::new("SELECT * FROM ks.t"), &Values::Empty)
            .await
            .unwrap_err();

        let errors = assert_matches!(err, ExecutionError::NoHostsAvailable { errors } => errors);
        assert_eq!(errors.len(), 2);
        for node in [&first, &second] {
            assert_matches!(
                errors.get(&node.addr()),
                Some(RequestAttemptError::DbError(DbError::Overloaded, _))
            );
        }
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn hosts_without_a_pool_are_skipped() {
        setup_tracing();
        let node = MockNode::start().await;
        let client = client_for(&[&node], ExecutionConfig::default()).await;
        client.remove_pool(node.addr());

        let err = client
            .query(&Statement::new("SELECT * FROM ks.t"), &Values::Empty)
            .await
            .unwrap_err();
        let errors = assert_matches!(err, ExecutionError::NoHostsAvailable { errors } => errors);
        assert_matches!(errors.get(&node.addr()), Some(RequestAttemptError::NotConnected));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn concurrent_prepares_share_one_request() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|request| match request {
                Request::Prepare(_) => MockResponse::Delayed(
                    Duration::from_millis(50),
                    MockNode::default_response(request).into_response(),
                ),
                other => MockNode::default_response(other),
            })
            .start()
            .await;
        let client = client_for(&[&node], ExecutionConfig::default()).await;

        let statement = Statement::new("SELECT * FROM ks.t WHERE a = ?");
        let prepared = futures::future::join_all((0..10).map(|_| client.prepare(&statement))).await;

        assert_eq!(node.count_received(RequestOpcode::Prepare), 1);
        let ids: HashSet<Bytes> = prepared
            .into_iter()
            .map(|prepared| prepared.unwrap().get_id().clone())
            .collect();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn unprepared_statement_is_prepared_again() {
        setup_tracing();
        let forgotten = Arc::new(AtomicBool::new(true));
        let node = {
            let forgotten = Arc::clone(&forgotten);
            MockNode::builder()
                .handler(move |request| match request {
                    Request::Execute(execute) if forgotten.swap(false, Ordering::SeqCst) => {
                        MockResponse::error(
                            DbError::Unprepared {
                                statement_id: execute.id.clone(),
                            },
                            "unknown id",
                        )
                    }
                    other => MockNode::default_response(other),
                })
                .start()
                .await
        };
        let client = client_for(&[&node], ExecutionConfig::default()).await;

        let prepared = client
            .prepare(&Statement::new("INSERT INTO ks.t (a) VALUES (1)"))
            .await
            .unwrap();
        let result = client.execute(&prepared, &Values::Empty).await.unwrap();

        assert_eq!(result.info().retries, 0);
        assert_eq!(node.count_received(RequestOpcode::Prepare), 2);
        assert_eq!(node.count_received(RequestOpcode::Execute), 2);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn unprepared_id_outside_the_batch_is_an_internal_error() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|request| match request {
                Request::Batch(_) => MockResponse::error(
                    DbError::Unprepared {
                        statement_id: Bytes::from_static(b"unknown"),
                    },
                    "unknown id",
                ),
                other => MockNode::default_response(other),
            })
            .start()
            .await;
        let client = client_for(&[&node], ExecutionConfig::default()).await;

        let prepared = client
            .prepare(&Statement::new("INSERT INTO ks.t (a) VALUES (1)"))
            .await
            .unwrap();
        let mut batch = Batch::default();
        batch.append_statement(prepared);
        batch.append_statement("INSERT INTO ks.t (a) VALUES (2)");
        let values = [Values::Empty, Values::Empty];

        let err = client.batch(&batch, &values).await.unwrap_err();
        assert_matches!(err, ExecutionError::Internal(_));
        assert_eq!(node.count_received(RequestOpcode::Batch), 1);
    }

    fn raw_rows(cells: &'static [u8]) -> MockResponse {
        MockResponse::Respond(Response::Result(result::Result::RawRows(RawRows::new(
            1,
            1,
            None,
            Bytes::from_static(cells),
        ))))
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn undecodable_rows_move_on_to_the_next_host() {
        setup_tracing();
        const SELECT: &str = "SELECT a FROM ks.t";
        let node = |cells: &'static [u8]| {
            MockNode::builder().handler(move |request| match request {
                Request::Prepare(_) => MockResponse::Respond(prepared_with_result(
                    SELECT,
                    vec![("a", ColumnType::Int)],
                )),
                Request::Execute(_) => raw_rows(cells),
                other => MockNode::default_response(other),
            })
        };
        // An int cell two bytes long.
        let broken = node(&[0, 0, 0, 2, 0, 1]).start().await;
        let healthy = node(&[0, 0, 0, 4, 0, 0, 0, 7]).start().await;
        let client = client_for(&[&broken, &healthy], ExecutionConfig::default()).await;

        let prepared = client.prepare(&Statement::new(SELECT)).await.unwrap();
        let result = client.execute(&prepared, &Values::Empty).await.unwrap();

        assert_eq!(result.info().hosts, vec![broken.addr(), healthy.addr()]);
        assert_eq!(result.info().retries, 1);
        assert_eq!(result.rows()[0].columns[0], Some(CqlValue::Int(7)));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn undecodable_rows_on_every_host_are_reported_per_host() {
        setup_tracing();
        const SELECT: &str = "SELECT a FROM ks.t";
        let node = MockNode::builder()
            .handler(|request| match request {
                Request::Prepare(_) => MockResponse::Respond(prepared_with_result(
                    SELECT,
                    vec![("a", ColumnType::Int)],
                )),
                Request::Execute(_) => raw_rows(&[0, 0, 0, 2, 0, 1]),
                other => MockNode::default_response(other),
            })
            .start()
            .await;
        let client = client_for(&[&node], ExecutionConfig::default()).await;

        let prepared = client.prepare(&Statement::new(SELECT)).await.unwrap();
        let err = client.execute(&prepared, &Values::Empty).await.unwrap_err();

        let errors = assert_matches!(err, ExecutionError::NoHostsAvailable { errors } => errors);
        assert_matches!(
            errors.get(&node.addr()),
            Some(RequestAttemptError::RowsParseError(
                RowsParseError::ColumnDeserializationError { row: 0, .. }
            ))
        );
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn unexpected_response_moves_on_to_the_next_host() {
        setup_tracing();
        let confused = MockNode::builder()
            .handler(|request| match request {
                Request::Execute(_) => MockResponse::Respond(Response::Ready),
                other => MockNode::default_response(other),
            })
            .start()
            .await;
        let healthy = MockNode::start().await;
        let client = client_for(&[&confused, &healthy], ExecutionConfig::default()).await;

        let prepared = client
            .prepare(&Statement::new("INSERT INTO ks.t (a) VALUES (1)"))
            .await
            .unwrap();
        let result = client.execute(&prepared, &Values::Empty).await.unwrap();

        assert_eq!(result.info().hosts, vec![confused.addr(), healthy.addr()]);
        assert_eq!(healthy.count_received(RequestOpcode::Execute), 1);

        let lone = client_for(&[&confused], ExecutionConfig::default()).await;
        let prepared = lone
            .prepare(&Statement::new("INSERT INTO ks.t (a) VALUES (1)"))
            .await
            .unwrap();
        let err = lone.execute(&prepared, &Values::Empty).await.unwrap_err();
        let errors = assert_matches!(err, ExecutionError::NoHostsAvailable { errors } => errors);
        assert_matches!(
            errors.get(&confused.addr()),
            Some(RequestAttemptError::UnexpectedResponse(CqlResponseKind::Ready))
        );
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn read_timeout_is_offered_to_the_retry_policy() {
        setup_tracing();
        let first_attempt = Arc::new(AtomicBool::new(true));
        let node = {
            let first_attempt = Arc::clone(&first_attempt);
            MockNode::builder()
                .handler(move |request| match request {
                    Request::Query(_) if first_attempt.swap(false, Ordering::SeqCst) => {
                        MockResponse::error(
                            DbError::ReadTimeout {
                                consistency: Consistency::Quorum,
                                received: 2,
                                required: 2,
                                data_present: false,
                            },
                            "read timeout",
                        )
                    }
                    other => MockNode::default_response(other),
                })
                .start()
                .await
        };
        let client = client_for(&[&node], ExecutionConfig::default()).await;

        let result = client
            .query(&Statement::new("SELECT * FROM ks.t"), &Values::Empty)
            .await
            .unwrap();
        assert_eq!(result.info().hosts, vec![node.addr(), node.addr()]);
        assert_eq!(result.info().retries, 1);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn syntax_errors_are_surfaced() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|request| match request {
                Request::Query(_) => MockResponse::error(DbError::SyntaxError, "line 1"),
                other => MockNode::default_response(other),
            })
            .start()
            .await;
        let client = client_for(&[&node], ExecutionConfig::default()).await;

        let err = client
            .query(&Statement::new("SELEC"), &Values::Empty)
            .await
            .unwrap_err();
        assert_matches!(err, ExecutionError::DbError(DbError::SyntaxError, reason) if reason == "line 1");
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn use_result_switches_the_keyspace_of_later_requests() {
        setup_tracing();
        let node = MockNode::start().await;
        let client = client_for(&[&node], ExecutionConfig::default()).await;

        client
            .query(&Statement::new("USE ks"), &Values::Empty)
            .await
            .unwrap();
        assert_eq!(client.keyspace().unwrap().as_str(), "ks");

        client
            .query(&Statement::new("SELECT * FROM t"), &Values::Empty)
            .await
            .unwrap();
        let received = node.received();
        assert!(received.iter().any(|r| is_query(r, "USE ks")));
        assert!(is_query(received.last().unwrap(), "SELECT * FROM t"));

        client.on_schema_change(&SchemaChangeEvent::KeyspaceChange {
            change_type: SchemaChangeType::Dropped,
            keyspace_name: "ks".to_owned(),
        });
        assert!(client.keyspace().is_none());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn schema_changes_wait_for_agreement() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|request| match request {
                Request::Query(query) if query.contents.starts_with("CREATE") => {
                    MockResponse::Respond(Response::Result(result::Result::SchemaChange(
                        result::SchemaChange {
                            event: SchemaChangeEvent::KeyspaceChange {
                                change_type: SchemaChangeType::Created,
                                keyspace_name: "ks".to_owned(),
                            },
                        },
                    )))
                }
                other => MockNode::default_response(other),
            })
            .start()
            .await;
        let client = client_for(&[&node], ExecutionConfig::default()).await;

        let result = client
            .query(
                &Statement::new("CREATE KEYSPACE ks WITH replication = {}"),
                &Values::Empty,
            )
            .await
            .unwrap();
        assert_eq!(result.info().schema_in_agreement, Some(true));
        assert_matches!(
            result.schema_change(),
            Some(SchemaChangeEvent::KeyspaceChange { keyspace_name, .. }) if keyspace_name == "ks"
        );
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn disagreeing_schema_does_not_fail_the_change() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|request| match request {
                Request::Query(query) if query.contents.starts_with("DROP") => {
                    MockResponse::Respond(Response::Result(result::Result::SchemaChange(
                        result::SchemaChange {
                            event: SchemaChangeEvent::TableChange {
                                change_type: SchemaChangeType::Dropped,
                                keyspace_name: "ks".to_owned(),
                                object_name: "t".to_owned(),
                            },
                        },
                    )))
                }
                other => MockNode::default_response(other),
            })
            .start()
            .await;
        let mut peer = crate::test_utils::peer_row("127.0.0.1", "127.0.0.1", "dc1");
        for column in peer.iter_mut() {
            if column.0 == "schema_version" {
                column.2 = Some(CqlValue::Uuid(Uuid::new_v4()));
            }
        }
        // A peer on the node's own address, so that it is known and up.
        node.set_peers(vec![peer]);
        let config = ExecutionConfig {
            schema_agreement_interval: Duration::from_millis(20),
            max_schema_agreement_wait: Duration::from_millis(100),
            ..Default::default()
        };
        let client = client_for(&[&node], config).await;

        let result = client
            .query(&Statement::new("DROP TABLE ks.t"), &Values::Empty)
            .await
            .unwrap();
        assert_eq!(result.info().schema_in_agreement, Some(false));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn pages_are_fetched_with_the_paging_state() {
        setup_tracing();
        let pages = Arc::new(AtomicUsize::new(0));
        let node = {
            let pages = Arc::clone(&pages);
            MockNode::builder()
                .handler(move |request| match request {
                    Request::Query(query) if query.contents.starts_with("SELECT") => {
                        let page = pages.fetch_add(1, Ordering::SeqCst);
                        let mut rows = MockResponse::rows(
                            vec![("a", ColumnType::Int)],
                            vec![vec![Some(CqlValue::Int(page as i32))]],
                        )
                        .into_response();
                        if page == 0 {
                            assert!(query.parameters.paging_state.is_none());
                            if let Response::Result(result::Result::Rows(rows)) = &mut rows {
                                rows.metadata.paging_state = Some(Bytes::from_static(b"next"));
                            }
                        } else {
                            assert_eq!(
                                query.parameters.paging_state.as_deref(),
                                Some(&b"next"[..])
                            );
                        }
                        MockResponse::Respond(rows)
                    }
                    other => MockNode::default_response(other),
                })
                .start()
                .await
        };
        let client = client_for(&[&node], ExecutionConfig::default()).await;

        let first = client
            .query(&Statement::new("SELECT a FROM ks.t"), &Values::Empty)
            .await
            .unwrap();
        assert!(first.has_more_pages());
        let second = client.next_page(&first).await.unwrap().unwrap();
        assert!(!second.has_more_pages());
        assert_eq!(second.rows()[0].columns[0], Some(CqlValue::Int(1)));
        assert!(client.next_page(&second).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn closed_client_rejects_requests() {
        setup_tracing();
        let node = MockNode::start().await;
        let client = client_for(&[&node], ExecutionConfig::default()).await;

        client.close().await;
        let err = client
            .query(&Statement::new("SELECT * FROM ks.t"), &Values::Empty)
            .await
            .unwrap_err();
        assert_matches!(err, ExecutionError::Client(ClientError::Closed));
        node.wait_for_disconnects(1).await;
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn down_hosts_lose_their_pool_and_get_it_back_when_up() {
        setup_tracing();
        let node = MockNode::start().await;
        let client = client_for(&[&node], ExecutionConfig::default()).await;
        let registry = Arc::clone(&client.registry);
        assert!(client.pool(node.addr()).is_some());

        registry.host_down(node.addr());
        assert!(client.pool(node.addr()).is_none());

        registry.host_up(node.addr());
        while client.pool(node.addr()).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        client
            .query(&Statement::new("SELECT * FROM ks.t"), &Values::Empty)
            .await
            .unwrap();
    }
}
