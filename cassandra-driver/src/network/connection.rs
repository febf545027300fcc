use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    RequestAttemptError, ResponseParseError, SchemaAgreementError, UseKeyspaceError,
};
use crate::response::QueryResponse;
use bytes::Bytes;
use cassandra_cql::frame::frame_errors::FrameError;
use cassandra_cql::frame::request::options::Options;
use cassandra_cql::frame::request::{
    AuthResponse, Credentials, Prepare, Query, Register, RequestOpcode, SerializableRequest,
    Startup,
};
use cassandra_cql::frame::response::authenticate::Authenticate;
use cassandra_cql::frame::response::event::{Event, EventType};
use cassandra_cql::frame::response::result::{self, Prepared, Rows};
use cassandra_cql::frame::response::{NonErrorResponse, Response, ResponseOpcode, Supported};
use cassandra_cql::frame::value_codec::{CustomTypeRegistry, TypeCodec};
use cassandra_cql::frame::{
    self, Compression, FrameDecoder, FrameDirection, RawFrame, SerializedRequest,
};
use cassandra_cql::{Consistency, ProtocolVersion};
use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, RemoteHandle, Shared};
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, trace, warn};
use uuid::Uuid;

// Queries for schema agreement
const LOCAL_VERSION: &str = "SELECT schema_version FROM system.local WHERE key='local'";

/// Settings of a single connection and of its handshake.
#[derive(Clone)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// The highest protocol version to try.
    pub protocol_version: ProtocolVersion,
    /// Whether a lower version is tried when the server rejects `protocol_version`.
    pub allow_protocol_downgrade: bool,
    pub compression: Option<Compression>,
    /// Bounds TCP connect and the whole handshake.
    pub connect_timeout: Duration,
    /// Default per-request timeout. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Interval of OPTIONS heartbeats. `None` disables them.
    pub heartbeat_interval: Option<Duration>,
    /// The connection is closed when nothing is received for this long. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Upper bound of in-flight requests. Capped by the stream id space of the protocol.
    pub requests_per_connection: usize,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    pub custom_types: Arc<CustomTypeRegistry>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            allow_protocol_downgrade: true,
            compression: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(12)),
            heartbeat_interval: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(60)),
            requests_per_connection: 1024,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            authenticator: None,
            custom_types: Arc::new(CustomTypeRegistry::default()),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("protocol_version", &self.protocol_version)
            .field("allow_protocol_downgrade", &self.allow_protocol_downgrade)
            .field("compression", &self.compression)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("idle_timeout", &self.idle_timeout)
            .field("requests_per_connection", &self.requests_per_connection)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("authenticator", &self.authenticator.is_some())
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    /// Number of stream ids a connection of the given version may use.
    pub(crate) fn effective_requests_per_connection(&self, version: ProtocolVersion) -> usize {
        self.requests_per_connection
            .clamp(1, version.max_stream_ids())
    }
}

pub(crate) type ErrorReceiver = watch::Receiver<Option<BrokenConnectionError>>;

type UseKeyspaceFuture = Shared<BoxFuture<'static, Result<(), UseKeyspaceError>>>;

pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    version: ProtocolVersion,
    codec: TypeCodec,
    compression: Option<Compression>,
    request_timeout: Option<Duration>,
    router_handle: Arc<RouterHandle>,

    error_receiver: ErrorReceiver,
    close_sender: StdMutex<Option<oneshot::Sender<()>>>,

    // Keyspace last confirmed by a SET_KEYSPACE result on this connection.
    keyspace: ArcSwapOption<String>,
    pending_use: StdMutex<Option<(String, UseKeyspaceFuture)>>,
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
    version: ProtocolVersion,

    // Each request send by `Connection::send_request` needs a unique request id.
    request_id_generator: AtomicU64,
    // If a `Connection::send_request` is cancelled or times out, it sends
    // notification about orphaning via the sender below.
    // Unbounded, because only unbounded channels allow pushing from `Drop`.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
        tracing: bool,
        custom_payload: Option<&HashMap<String, Bytes>>,
        timeout: Option<Duration>,
    ) -> Result<RawFrame, RequestAttemptError> {
        let serialized_request =
            SerializedRequest::make(request, self.version, compression, tracing, custom_payload)?;
        let request_id = self.allocate_request_id();

        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        // Dropping `notifier` (before calling `notifier.disable()`) tells the router
        // that nobody waits for this request anymore. Its stream id, if any, stays
        // reserved until the late response arrives.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        let exchange = async {
            self.submit_channel
                .send(Task {
                    serialized_request,
                    response_handler,
                })
                .await
                .map_err(|_| RequestAttemptError::ConnectionClosed)?;

            receiver
                .await
                .map_err(|_| RequestAttemptError::ConnectionClosed)?
        };

        let response = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| RequestAttemptError::RequestTimeout(timeout))??,
            None => exchange.await?,
        };

        notifier.disable();

        Ok(response)
    }
}

type RequestId = u64;

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<RawFrame, RequestAttemptError>>,
    request_id: RequestId,
}

// Used to notify `Connection::orphaner` about `Connection::send_request`
// future being dropped before receiving response.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

// Everything the router futures share. Each of them only holds the lock
// between await points, so it is never contended.
struct RouterState {
    handlers: ResponseHandlerMap,
    // Tasks waiting for a free stream id, in submission order.
    queue: VecDeque<Task>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .field("version", &self.version)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens a TCP connection and spawns its router, but does not send any
    /// frames yet (no OPTIONS/STARTUP handshake nor REGISTER requests).
    pub(crate) async fn new(
        connect_address: SocketAddr,
        version: ProtocolVersion,
        config: &ConnectionConfig,
        event_sender: Option<mpsc::Sender<Event>>,
    ) -> Result<Self, ConnectionError> {
        let stream = match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(connect_address),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout),
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = watch::channel(None);
        let (close_sender, close_receiver) = oneshot::channel();
        // Unbounded because it allows for synchronous pushes
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            version,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
        });

        let codec = TypeCodec::new(version, Arc::clone(&config.custom_types));

        let router_config = RouterConfig {
            codec: codec.clone(),
            compression: config.compression,
            requests_per_connection: config.effective_requests_per_connection(version),
            heartbeat_interval: config.heartbeat_interval,
            idle_timeout: config.idle_timeout,
            event_sender,
            address: connect_address,
        };

        let (task, _worker_handle) = Self::router(
            router_config,
            stream,
            receiver,
            error_sender,
            close_receiver,
            orphan_notification_receiver,
            Arc::clone(&router_handle),
        )
        .remote_handle();
        tokio::task::spawn(task);

        Ok(Connection {
            _worker_handle,
            connect_address,
            version,
            codec,
            compression: None,
            request_timeout: config.request_timeout,
            router_handle,
            error_receiver,
            close_sender: StdMutex::new(Some(close_sender)),
            keyspace: ArcSwapOption::empty(),
            pending_use: StdMutex::new(None),
        })
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is the idle time before keepalives begin to be sent,
        // which socket2 calls "time". Their interval is the time between probes.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // These cfg values are taken from socket2 library, which uses the same constraints.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub(crate) fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub(crate) fn codec(&self) -> &TypeCodec {
        &self.codec
    }

    pub(crate) fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub(crate) fn set_compression(&mut self, compression: Option<Compression>) {
        self.compression = compression;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.error_receiver.borrow().is_some()
    }

    /// Resolves once the connection is closed, with the cause of closing.
    pub(crate) fn closed(&self) -> impl Future<Output = BrokenConnectionError> + Send + 'static {
        let mut error_receiver = self.error_receiver.clone();
        async move {
            let cause = match error_receiver.wait_for(Option::is_some).await {
                Ok(cause) => cause.clone(),
                // The router is gone without reporting, so the connection was dropped.
                Err(_) => None,
            };
            cause.unwrap_or_else(|| BrokenConnectionErrorKind::ClosedByClient.into())
        }
    }

    /// Closes the socket. Requests in flight fail with a broken connection error.
    pub(crate) async fn close(&self) {
        let sender = self
            .close_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
        self.closed().await;
    }

    pub(crate) fn keyspace(&self) -> Option<Arc<String>> {
        self.keyspace.load_full()
    }

    /// Records a keyspace switch confirmed by the server on this connection.
    pub(crate) fn set_keyspace(&self, keyspace_name: &str) {
        self.keyspace.store(Some(Arc::new(keyspace_name.to_owned())));
    }

    pub(crate) async fn send_request(
        &self,
        request: &impl SerializableRequest,
        tracing: bool,
        custom_payload: Option<&HashMap<String, Bytes>>,
        timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        if self.is_closed() {
            return Err(RequestAttemptError::ConnectionClosed);
        }

        let frame = self
            .router_handle
            .send_request(request, self.compression, tracing, custom_payload, timeout)
            .await?;

        Ok(Self::parse_response(frame, self.compression, &self.codec)?)
    }

    fn parse_response(
        frame: RawFrame,
        compression: Option<Compression>,
        codec: &TypeCodec,
    ) -> Result<QueryResponse, ResponseParseError> {
        let opcode = ResponseOpcode::try_from(frame.opcode).map_err(FrameError::from)?;
        let body_with_ext =
            frame::parse_response_body_extensions(frame.params.flags, compression, frame.body)?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(codec, opcode, &mut &body_with_ext.body[..])?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
            custom_payload: body_with_ext.custom_payload,
        })
    }

    pub(crate) async fn get_options(&self) -> Result<Supported, ConnectionError> {
        let response = self
            .send_request(&Options, false, None, self.request_timeout)
            .await
            .map_err(|e| ConnectionError::setup(RequestOpcode::Options, e))?;
        match response.into_non_error_response() {
            Ok(NonErrorResponse::Supported(supported)) => Ok(supported),
            Ok(other) => Err(ConnectionError::setup(
                RequestOpcode::Options,
                RequestAttemptError::UnexpectedResponse(other.kind()),
            )),
            Err(e) => Err(ConnectionError::setup(RequestOpcode::Options, e)),
        }
    }

    /// Sends STARTUP. Returns the AUTHENTICATE challenge if the server asked for one.
    pub(crate) async fn startup(
        &self,
        options: HashMap<String, String>,
    ) -> Result<Option<Authenticate>, ConnectionError> {
        let err = |e| ConnectionError::setup(RequestOpcode::Startup, e);
        let response = self
            .send_request(&Startup { options }, false, None, self.request_timeout)
            .await
            .map_err(err)?;
        match response.into_non_error_response().map_err(err)? {
            NonErrorResponse::Ready => Ok(None),
            NonErrorResponse::Authenticate(authenticate) => Ok(Some(authenticate)),
            other => Err(err(RequestAttemptError::UnexpectedResponse(other.kind()))),
        }
    }

    pub(crate) async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
        authenticator: Option<&Arc<dyn AuthenticatorProvider>>,
    ) -> Result<(), ConnectionError> {
        let authenticator_name = authenticate.authenticator_name.as_str();
        let Some(authenticator) = authenticator else {
            return Err(ConnectionError::AuthenticationError(format!(
                "Server requires authentication with {}, but no authenticator is configured",
                authenticator_name
            )));
        };
        debug!(
            "[{}] Authenticating with {}",
            self.connect_address, authenticator_name
        );

        if !self.version.supports_sasl_auth() {
            let credentials = authenticator.credentials().ok_or_else(|| {
                ConnectionError::AuthenticationError(format!(
                    "Authenticator does not provide credentials required by protocol {}",
                    self.version
                ))
            })?;
            let err = |e| ConnectionError::setup(RequestOpcode::Credentials, e);
            let response = self
                .send_request(&Credentials { credentials }, false, None, self.request_timeout)
                .await
                .map_err(err)?;
            return match response.into_non_error_response().map_err(err)? {
                NonErrorResponse::Ready => Ok(()),
                other => Err(err(RequestAttemptError::UnexpectedResponse(other.kind()))),
            };
        }

        let (mut response, mut auth_session) = authenticator
            .start_authentication_session(authenticator_name)
            .await
            .map_err(ConnectionError::AuthenticationError)?;

        let err = |e| ConnectionError::setup(RequestOpcode::AuthResponse, e);
        loop {
            let reply = self
                .send_request(&AuthResponse { response }, false, None, self.request_timeout)
                .await
                .map_err(err)?;
            match reply.into_non_error_response().map_err(err)? {
                NonErrorResponse::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationError)?;
                }
                NonErrorResponse::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationError)?;
                    return Ok(());
                }
                other => return Err(err(RequestAttemptError::UnexpectedResponse(other.kind()))),
            }
        }
    }

    pub(crate) async fn register(
        &self,
        event_types_to_register_for: Vec<EventType>,
    ) -> Result<(), ConnectionError> {
        let err = |e| ConnectionError::setup(RequestOpcode::Register, e);
        let register_frame = Register {
            event_types_to_register_for,
        };
        let response = self
            .send_request(&register_frame, false, None, self.request_timeout)
            .await
            .map_err(err)?;
        match response.into_non_error_response().map_err(err)? {
            NonErrorResponse::Ready => Ok(()),
            other => Err(err(RequestAttemptError::UnexpectedResponse(other.kind()))),
        }
    }

    /// Runs a simple statement at consistency ONE, with the default timeout.
    pub(crate) async fn query_unpaged(
        &self,
        contents: &str,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query = Query {
            contents: contents.to_owned(),
            parameters: cassandra_cql::frame::request::query::QueryParameters {
                consistency: Consistency::One,
                ..Default::default()
            },
        };
        self.send_request(&query, false, None, self.request_timeout)
            .await
    }

    /// Runs a SELECT and returns its rows.
    pub(crate) async fn select(&self, contents: &str) -> Result<Rows, RequestAttemptError> {
        match self
            .query_unpaged(contents)
            .await?
            .into_non_error_response()?
        {
            NonErrorResponse::Result(result::Result::Rows(rows)) => Ok(rows),
            other => Err(RequestAttemptError::UnexpectedResponse(other.kind())),
        }
    }

    pub(crate) async fn prepare(
        &self,
        contents: &str,
        timeout: Option<Duration>,
    ) -> Result<Prepared, RequestAttemptError> {
        let request = Prepare {
            query: contents.to_owned(),
        };
        match self
            .send_request(&request, false, None, timeout)
            .await?
            .into_non_error_response()?
        {
            NonErrorResponse::Result(result::Result::Prepared(prepared)) => Ok(prepared),
            other => Err(RequestAttemptError::UnexpectedResponse(other.kind())),
        }
    }

    /// Switches the keyspace of this connection. Concurrent switches to the same
    /// keyspace share one USE request.
    pub(crate) async fn use_keyspace(
        self: &Arc<Self>,
        keyspace_name: &VerifiedKeyspaceName,
        timeout: Option<Duration>,
    ) -> Result<(), UseKeyspaceError> {
        let already_set = self.keyspace().is_some_and(|current| {
            if keyspace_name.is_case_sensitive {
                current.as_str() == keyspace_name.as_str()
            } else {
                current.eq_ignore_ascii_case(keyspace_name.as_str())
            }
        });
        if already_set {
            return Ok(());
        }

        let switch = {
            let mut pending = self
                .pending_use
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match pending.as_ref() {
                Some((name, switch)) if name == keyspace_name.as_str() => switch.clone(),
                _ => {
                    let connection = Arc::downgrade(self);
                    let name = keyspace_name.clone();
                    let switch = async move {
                        Self::switch_keyspace(connection, name, timeout).await
                    }
                    .boxed()
                    .shared();
                    *pending = Some((keyspace_name.as_str().to_owned(), switch.clone()));
                    switch
                }
            }
        };

        let result = switch.await;

        let mut pending = self
            .pending_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending
            .as_ref()
            .is_some_and(|(name, _)| name == keyspace_name.as_str())
        {
            *pending = None;
        }

        result
    }

    async fn switch_keyspace(
        connection: Weak<Connection>,
        keyspace_name: VerifiedKeyspaceName,
        timeout: Option<Duration>,
    ) -> Result<(), UseKeyspaceError> {
        let connection = connection
            .upgrade()
            .ok_or(RequestAttemptError::ConnectionClosed)?;

        // Keyspace names cannot be bound, so the name goes into the statement text.
        let query = Query {
            contents: keyspace_name.use_statement(),
            parameters: Default::default(),
        };
        let response = connection
            .send_request(&query, false, None, timeout)
            .await?;
        let set_keyspace = match response.into_non_error_response()? {
            NonErrorResponse::Result(result::Result::SetKeyspace(set_keyspace)) => {
                set_keyspace
            }
            other => {
                return Err(RequestAttemptError::UnexpectedResponse(other.kind()).into());
            }
        };

        if !set_keyspace
            .keyspace_name
            .eq_ignore_ascii_case(keyspace_name.as_str())
        {
            return Err(UseKeyspaceError::KeyspaceNameMismatch {
                expected_keyspace_name_lowercase: keyspace_name.as_str().to_lowercase(),
                result_keyspace_name_lowercase: set_keyspace.keyspace_name.to_lowercase(),
            });
        }

        connection.set_keyspace(&set_keyspace.keyspace_name);
        Ok(())
    }

    pub(crate) async fn fetch_schema_version(&self) -> Result<Uuid, SchemaAgreementError> {
        let rows = self.select(LOCAL_VERSION).await?;
        rows.rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(|value| value.as_uuid())
            .ok_or_else(|| SchemaAgreementError::BadRow {
                table: "system.local",
                reason: "missing schema_version".to_owned(),
            })
    }

    async fn router(
        config: RouterConfig,
        stream: impl AsyncRead + AsyncWrite,
        mut receiver: mpsc::Receiver<Task>,
        error_sender: watch::Sender<Option<BrokenConnectionError>>,
        close_receiver: oneshot::Receiver<()>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        router_handle: Arc<RouterHandle>,
    ) {
        let (read_half, write_half) = split(stream);
        // The state is shared between reader, writer and orphaner futures, which
        // all run on this task and never hold the lock across an .await point.
        // A RefCell would make the whole future !Sync, hence the mutex.
        let state = StdMutex::new(RouterState {
            handlers: ResponseHandlerMap::new(config.requests_per_connection),
            queue: VecDeque::new(),
        });
        let stream_id_freed = Notify::new();

        let k = Self::heartbeater(router_handle, config.heartbeat_interval, config.address);
        let r = Self::reader(read_half, &state, &stream_id_freed, &config);
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &state,
            &stream_id_freed,
            &mut receiver,
        );
        let o = Self::orphaner(&state, orphan_notification_receiver);
        let c = Self::closer(close_receiver);

        let result = futures::try_join!(r, w, o, k, c);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };
        debug!("[{}] Connection closed: {}", config.address, error);

        // From now on new requests fail fast.
        error_sender.send_replace(Some(error.clone()));

        // Respond to all pending requests with the error
        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        let queued = state.queue.into_iter().map(|task| task.response_handler);
        receiver.close();
        let mut submitted = Vec::new();
        while let Ok(task) = receiver.try_recv() {
            submitted.push(task.response_handler);
        }
        for handler in state
            .handlers
            .into_handlers()
            .into_values()
            .chain(queued)
            .chain(submitted)
        {
            // Ignore sending error, request was dropped
            let _ = handler.response_sender.send(Err(error.clone().into()));
        }
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        state: &StdMutex<RouterState>,
        stream_id_freed: &Notify,
        config: &RouterConfig,
    ) -> Result<(), BrokenConnectionError> {
        let mut decoder = FrameDecoder::new(FrameDirection::Response);
        loop {
            let read = read_half.read_buf(decoder.buffer_mut());
            let n = match config.idle_timeout {
                Some(timeout) => tokio::time::timeout(timeout, read).await.map_err(|_| {
                    BrokenConnectionErrorKind::IdleTimeout {
                        addr: config.address,
                        timeout,
                    }
                })?,
                None => read.await,
            }
            .map_err(BrokenConnectionErrorKind::ReadError)?;
            if n == 0 {
                return Err(BrokenConnectionErrorKind::ClosedByServer.into());
            }

            while let Some(frame) = decoder
                .next_frame()
                .map_err(BrokenConnectionErrorKind::FrameError)?
            {
                let stream = frame.params.stream;
                if frame.params.is_event() {
                    Self::handle_event(frame, config).await;
                    continue;
                }
                if stream < 0 {
                    // Negative streams other than -1 are reserved for the server and unused.
                    continue;
                }

                let handler_lookup_res = state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .handlers
                    .lookup(stream);
                stream_id_freed.notify_one();

                match handler_lookup_res {
                    HandlerLookupResult::Handler(handler) => {
                        // The receiver may have given up waiting already.
                        let _ = handler.response_sender.send(Ok(frame));
                    }
                    HandlerLookupResult::Missing => {
                        debug!(
                            "[{}] Received response with unexpected stream id {}",
                            config.address, stream
                        );
                    }
                    HandlerLookupResult::Orphaned => {
                        trace!(
                            "[{}] Late response on orphaned stream id {}",
                            config.address,
                            stream
                        );
                    }
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        state: &StdMutex<RouterState>,
        stream_id_freed: &Notify,
        task_receiver: &mut mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let mut ready = Vec::new();
            {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                let RouterState { handlers, queue } = &mut *guard;
                while let Some(task) = queue.pop_front() {
                    if task.response_handler.response_sender.is_closed() {
                        // Timed out or cancelled while queued.
                        continue;
                    }
                    match handlers.allocate(task.response_handler) {
                        Ok(stream_id) => {
                            let mut request = task.serialized_request;
                            request.set_stream(stream_id);
                            ready.push(request);
                        }
                        Err(response_handler) => {
                            queue.push_front(Task {
                                serialized_request: task.serialized_request,
                                response_handler,
                            });
                            break;
                        }
                    }
                }
            }

            if !ready.is_empty() {
                let mut total_sent = 0;
                for request in &ready {
                    let data = request.get_data();
                    total_sent += data.len();
                    write_half
                        .write_all(data)
                        .await
                        .map_err(BrokenConnectionErrorKind::WriteError)?;
                }
                trace!("Sending {} requests; {} bytes", ready.len(), total_sent);
                write_half
                    .flush()
                    .await
                    .map_err(BrokenConnectionErrorKind::WriteError)?;
            }

            let queue_is_empty = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .queue
                .is_empty();

            tokio::select! {
                task = task_receiver.recv() => match task {
                    Some(task) => {
                        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                        guard.queue.push_back(task);
                        // Pick up everything that is already submitted, to write it in one flush.
                        while let Ok(task) = task_receiver.try_recv() {
                            guard.queue.push_back(task);
                        }
                    }
                    // When the Connection object is dropped, the sender half
                    // of the channel will be dropped and the whole worker stops.
                    None => return Ok(()),
                },
                _ = stream_id_freed.notified(), if !queue_is_empty => {}
            }
        }
    }

    // Receives notifications from `OrphanhoodNotifier`s and marks the streams
    // as orphaned. An orphaned stream id stays reserved until its response arrives.
    async fn orphaner(
        state: &StdMutex<RouterState>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        while let Some(request_id) = orphan_receiver.recv().await {
            trace!(
                "Trying to orphan stream id associated with request_id = {}",
                request_id,
            );
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .handlers
                .orphan(request_id);
        }
        Ok(())
    }

    async fn closer(close_receiver: oneshot::Receiver<()>) -> Result<(), BrokenConnectionError> {
        match close_receiver.await {
            Ok(()) => Err(BrokenConnectionErrorKind::ClosedByClient.into()),
            // The connection is being dropped, which stops the router anyway.
            Err(_) => futures::future::pending().await,
        }
    }

    async fn heartbeater(
        router_handle: Arc<RouterHandle>,
        heartbeat_interval: Option<Duration>,
        addr: SocketAddr, // Only used to enrich the log messages
    ) -> Result<(), BrokenConnectionError> {
        let Some(heartbeat_interval) = heartbeat_interval else {
            // No heartbeats are to be sent.
            return Ok(());
        };

        let mut interval = tokio::time::interval(heartbeat_interval);
        interval.tick().await; // Use up the first, instant tick.

        // Default behaviour (Burst) is not suitable for sending heartbeats.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(error) = router_handle
                .send_request(&Options, None, false, None, None)
                .await
            {
                warn!(
                    "Failed to execute heartbeat request on connection to node {} - {}",
                    addr, error
                );
                return Err(BrokenConnectionErrorKind::HeartbeatError { addr, error }.into());
            }

            trace!("Heartbeat request successful on connection to node {}", addr);
        }
    }

    // A malformed event is dropped; the requests in flight are not affected.
    async fn handle_event(frame: RawFrame, config: &RouterConfig) {
        let Some(event_sender) = config.event_sender.as_ref() else {
            return;
        };

        let response = match Self::parse_response(frame, config.compression, &config.codec) {
            Ok(response) => response,
            Err(err) => {
                warn!("[{}] Dropping malformed event: {}", config.address, err);
                return;
            }
        };
        match response.response {
            Response::Event(event) => {
                debug!("[{}] Received event: {:?}", config.address, event);
                if event_sender.send(event).await.is_err() {
                    debug!("[{}] Event receiver is gone, dropping event", config.address);
                }
            }
            other => {
                warn!(
                    "[{}] Expected to receive Event response, got {:?}",
                    config.address,
                    other.opcode()
                );
            }
        }
    }
}

struct RouterConfig {
    codec: TypeCodec,
    compression: Option<Compression>,
    requests_per_connection: usize,
    heartbeat_interval: Option<Duration>,
    idle_timeout: Option<Duration>,
    event_sender: Option<mpsc::Sender<Event>>,
    address: SocketAddr,
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,

    request_to_stream: HashMap<RequestId, i16>,
    orphans: HashSet<i16>,
}

enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new(capacity: usize) -> Self {
        Self {
            stream_set: StreamIdSet::new(capacity),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphans: HashSet::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        match self.stream_set.allocate() {
            Some(stream_id) => {
                self.request_to_stream
                    .insert(response_handler.request_id, stream_id);
                self.handlers.insert(stream_id, response_handler);
                Ok(stream_id)
            }
            None => Err(response_handler),
        }
    }

    // Orphan stream_id (associated with this request_id) and free its handler.
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphans.insert(stream_id);
            self.handlers.remove(&stream_id);
        }
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        if self.orphans.remove(&stream_id) {
            self.stream_set.free(stream_id);
            return HandlerLookupResult::Orphaned;
        }

        if let Some(handler) = self.handlers.remove(&stream_id) {
            // A mapping `request_id` -> `stream_id` must be removed, to
            // prevent marking this `stream_id` as orphaned by some late
            // orphan notification.
            self.request_to_stream.remove(&handler.request_id);
            self.stream_set.free(stream_id);
            HandlerLookupResult::Handler(handler)
        } else {
            HandlerLookupResult::Missing
        }
    }

    // Retrieves the map of handlers, used after connection breaks
    // and we have to respond to all of them with an error
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

struct StreamIdSet {
    used_bitmap: Box<[u64]>,
    capacity: usize,
}

impl StreamIdSet {
    fn new(capacity: usize) -> Self {
        Self {
            used_bitmap: vec![0; capacity.div_ceil(64)].into_boxed_slice(),
            capacity,
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                let stream_id = block_id * 64 + off;
                if stream_id >= self.capacity {
                    return None;
                }
                *block |= 1u64 << off;
                return Some(stream_id as i16);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        if let Some(block) = self.used_bitmap.get_mut(block_id) {
            *block &= !(1 << off);
        }
    }
}

/// This type can only hold a valid keyspace name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    /// Parses a name the way CQL does: a name in double quotes keeps its
    /// case, any other name is case insensitive.
    pub(crate) fn parse(keyspace_name: &str) -> Result<Self, BadKeyspaceName> {
        match keyspace_name
            .strip_prefix('"')
            .and_then(|name| name.strip_suffix('"'))
        {
            Some(quoted) => Self::new(quoted.to_owned(), true),
            None => Self::new(keyspace_name.to_owned(), false),
        }
    }

    /// A name reported by the server, in its exact case.
    pub(crate) fn from_server(keyspace_name: &str) -> Result<Self, BadKeyspaceName> {
        let case_sensitive = keyspace_name.chars().any(|c| c.is_ascii_uppercase());
        Self::new(keyspace_name.to_owned(), case_sensitive)
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    pub(crate) fn use_statement(&self) -> String {
        match self.is_case_sensitive {
            true => format!("USE \"{}\"", self.as_str()),
            false => format!("USE {}", self.as_str()),
        }
    }

    // "Keyspace names can have up to 48 alphanumeric characters and contain underscores;
    // only letters and numbers are supported as the first character."
    // Cassandra accepts underscore as first character anyway, so we do too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        // Verify that length <= 48
        let keyspace_name_len: usize = keyspace_name.chars().count(); // Only ascii allowed so it's equal to .len()
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        // Verify all chars are alphanumeric or underscore
        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ));
                }
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{setup_tracing, MockNode, MockResponse, SCHEMA_VERSION};
    use assert_matches::assert_matches;
    use cassandra_cql::frame::request::Request;
    use cassandra_cql::frame::response::event::StatusChangeEvent;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: None,
            idle_timeout: None,
            ..Default::default()
        }
    }

    async fn open(node: &MockNode, config: &ConnectionConfig) -> Arc<Connection> {
        Arc::new(
            Connection::new(node.addr(), ProtocolVersion::V4, config, None)
                .await
                .unwrap(),
        )
    }

    fn query(contents: &str) -> Query {
        Query {
            contents: contents.to_owned(),
            parameters: Default::default(),
        }
    }

    fn query_texts(node: &MockNode) -> Vec<String> {
        node.received()
            .into_iter()
            .filter_map(|request| match request {
                Request::Query(query) => Some(query.contents),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn stream_ids_are_reused_after_free() {
        let mut set = StreamIdSet::new(70);
        for expected in 0..70 {
            assert_eq!(set.allocate(), Some(expected));
        }
        assert_eq!(set.allocate(), None);

        set.free(3);
        set.free(65);
        assert_eq!(set.allocate(), Some(3));
        assert_eq!(set.allocate(), Some(65));
        assert_eq!(set.allocate(), None);
    }

    #[test]
    fn stream_ids_are_capped_by_protocol_version() {
        let config = ConnectionConfig {
            requests_per_connection: 100_000,
            ..Default::default()
        };
        assert_eq!(
            config.effective_requests_per_connection(ProtocolVersion::V1),
            ProtocolVersion::V1.max_stream_ids()
        );
        assert_eq!(
            config.effective_requests_per_connection(ProtocolVersion::V4),
            ProtocolVersion::V4.max_stream_ids()
        );
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn requests_wait_in_order_for_a_free_stream_id() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|_| {
                MockResponse::Delayed(
                    Duration::from_millis(20),
                    Response::Result(result::Result::Void),
                )
            })
            .start()
            .await;
        let config = ConnectionConfig {
            requests_per_connection: 1,
            ..config()
        };
        let connection = open(&node, &config).await;

        let requests = ["q0", "q1", "q2", "q3"].map(query);
        let responses = futures::future::join_all(
            requests
                .iter()
                .map(|q| connection.send_request(q, false, None, None)),
        )
        .await;

        for response in responses {
            assert_matches!(
                response.unwrap().response,
                Response::Result(result::Result::Void)
            );
        }
        assert_eq!(query_texts(&node), vec!["q0", "q1", "q2", "q3"]);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn late_response_after_timeout_is_dropped() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|request| match request {
                Request::Query(q) if q.contents == "slow" => MockResponse::Delayed(
                    Duration::from_millis(200),
                    Response::Result(result::Result::Void),
                ),
                other => MockNode::default_response(other),
            })
            .start()
            .await;
        let config = ConnectionConfig {
            requests_per_connection: 1,
            ..config()
        };
        let connection = open(&node, &config).await;

        let timeout = Duration::from_millis(20);
        let result = connection
            .send_request(&query("slow"), false, None, Some(timeout))
            .await;
        assert_matches!(result, Err(RequestAttemptError::RequestTimeout(t)) if t == timeout);

        // The only stream id is held until the late response arrives,
        // then the next request goes through on the same connection.
        let response = connection
            .send_request(&query("fast"), false, None, None)
            .await
            .unwrap();
        assert_matches!(response.response, Response::Result(result::Result::Void));
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn close_fails_pending_requests() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|_| MockResponse::NoResponse)
            .start()
            .await;
        let connection = open(&node, &config()).await;

        let pending = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move {
                connection
                    .send_request(&query("SELECT 1"), false, None, None)
                    .await
            }
        });
        while query_texts(&node).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        connection.close().await;
        let error = pending.await.unwrap().unwrap_err();
        assert_matches!(
            error,
            RequestAttemptError::BrokenConnection(e)
                if matches!(e.kind(), BrokenConnectionErrorKind::ClosedByClient)
        );
        assert!(connection.is_closed());
        assert_matches!(
            connection.query_unpaged("SELECT 1").await,
            Err(RequestAttemptError::ConnectionClosed)
        );
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn server_disconnect_breaks_the_connection() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|_| MockResponse::Disconnect)
            .start()
            .await;
        let connection = open(&node, &config()).await;

        let error = connection.query_unpaged("SELECT 1").await.unwrap_err();
        assert_matches!(error, RequestAttemptError::BrokenConnection(_));
        let cause = connection.closed().await;
        assert_matches!(cause.kind(), BrokenConnectionErrorKind::ClosedByServer);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn idle_connection_is_closed() {
        setup_tracing();
        let node = MockNode::start().await;
        let config = ConnectionConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            ..config()
        };
        let connection = open(&node, &config).await;

        let cause = connection.closed().await;
        assert_matches!(
            cause.kind(),
            BrokenConnectionErrorKind::IdleTimeout { timeout, .. }
                if *timeout == Duration::from_millis(100)
        );
        node.wait_for_disconnects(1).await;
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn heartbeats_keep_the_connection_alive() {
        setup_tracing();
        let node = MockNode::start().await;
        let config = ConnectionConfig {
            heartbeat_interval: Some(Duration::from_millis(30)),
            idle_timeout: Some(Duration::from_millis(150)),
            ..config()
        };
        let connection = open(&node, &config).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!connection.is_closed());
        assert!(node.count_received(RequestOpcode::Options) >= 2);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn events_are_forwarded() {
        setup_tracing();
        let node = MockNode::start().await;
        let (sender, mut receiver) = mpsc::channel(8);
        let connection = Connection::new(node.addr(), ProtocolVersion::V4, &config(), Some(sender))
            .await
            .unwrap();
        // Make sure the node has seen the connection before pushing.
        connection.query_unpaged("SELECT 1").await.unwrap();

        let addr: SocketAddr = "10.0.0.2:9042".parse().unwrap();
        node.push_event(Event::StatusChange(StatusChangeEvent::Down(addr)));
        assert_eq!(
            receiver.recv().await,
            Some(Event::StatusChange(StatusChangeEvent::Down(addr)))
        );
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn malformed_events_are_dropped() {
        setup_tracing();
        let node = MockNode::start().await;
        let (sender, mut receiver) = mpsc::channel(8);
        let connection = Connection::new(node.addr(), ProtocolVersion::V4, &config(), Some(sender))
            .await
            .unwrap();
        connection.query_unpaged("SELECT 1").await.unwrap();

        // An event type string that claims more bytes than the body holds.
        node.push_raw_event(&[0x00, 0x20, b'S']);
        let addr: SocketAddr = "10.0.0.2:9042".parse().unwrap();
        node.push_event(Event::StatusChange(StatusChangeEvent::Up(addr)));

        assert_eq!(
            receiver.recv().await,
            Some(Event::StatusChange(StatusChangeEvent::Up(addr)))
        );
        assert!(!connection.is_closed());
        connection.query_unpaged("SELECT 1").await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn concurrent_keyspace_switches_share_one_request() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|request| match request {
                Request::Query(q) if q.contents.starts_with("USE ") => MockResponse::Delayed(
                    Duration::from_millis(50),
                    Response::Result(result::Result::SetKeyspace(result::SetKeyspace {
                        keyspace_name: "ks".to_owned(),
                    })),
                ),
                other => MockNode::default_response(other),
            })
            .start()
            .await;
        let connection = open(&node, &config()).await;
        let keyspace = VerifiedKeyspaceName::parse("ks").unwrap();

        let switches =
            futures::future::join_all((0..5).map(|_| connection.use_keyspace(&keyspace, None)))
                .await;
        assert!(switches.iter().all(Result::is_ok));
        assert_eq!(connection.keyspace().as_deref().map(String::as_str), Some("ks"));
        assert_eq!(query_texts(&node), vec!["USE ks"]);

        // Already in the keyspace, nothing is sent.
        connection.use_keyspace(&keyspace, None).await.unwrap();
        assert_eq!(query_texts(&node).len(), 1);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn keyspace_mismatch_is_an_error() {
        setup_tracing();
        let node = MockNode::builder()
            .handler(|_| {
                MockResponse::Respond(Response::Result(result::Result::SetKeyspace(
                    result::SetKeyspace {
                        keyspace_name: "other".to_owned(),
                    },
                )))
            })
            .start()
            .await;
        let connection = open(&node, &config()).await;
        let keyspace = VerifiedKeyspaceName::parse("ks").unwrap();

        assert_matches!(
            connection.use_keyspace(&keyspace, None).await,
            Err(UseKeyspaceError::KeyspaceNameMismatch { .. })
        );
        assert!(connection.keyspace().is_none());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn reads_local_schema_version() {
        setup_tracing();
        let node = MockNode::start().await;
        let connection = open(&node, &config()).await;
        assert_eq!(connection.fetch_schema_version().await.unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn keyspace_names_are_validated() {
        assert_matches!(VerifiedKeyspaceName::parse(""), Err(BadKeyspaceName::Empty));
        assert_matches!(
            VerifiedKeyspaceName::parse(&"a".repeat(49)),
            Err(BadKeyspaceName::TooLong(_, 49))
        );
        assert_matches!(
            VerifiedKeyspaceName::parse("ks-1"),
            Err(BadKeyspaceName::IllegalCharacter(_, '-'))
        );
        assert!(VerifiedKeyspaceName::parse(&"a".repeat(48)).is_ok());
        assert!(VerifiedKeyspaceName::parse("_ks").is_ok());
    }

    #[test]
    fn quoted_keyspace_names_keep_their_case() {
        let quoted = VerifiedKeyspaceName::parse("\"MyKs\"").unwrap();
        assert!(quoted.is_case_sensitive);
        assert_eq!(quoted.as_str(), "MyKs");
        assert_eq!(quoted.use_statement(), "USE \"MyKs\"");

        let plain = VerifiedKeyspaceName::parse("MyKs").unwrap();
        assert!(!plain.is_case_sensitive);
        assert_eq!(plain.use_statement(), "USE MyKs");

        assert!(VerifiedKeyspaceName::from_server("MyKs").unwrap().is_case_sensitive);
        assert!(!VerifiedKeyspaceName::from_server("myks").unwrap().is_case_sensitive);
    }
}
