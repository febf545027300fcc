//! Helpers shared by the unit tests: log setup and an in-process CQL node.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cassandra_cql::errors::DbError;
use cassandra_cql::frame::request::{Request, RequestOpcode};
use cassandra_cql::frame::response::authenticate::AuthSuccess;
use cassandra_cql::frame::response::event::Event;
use cassandra_cql::frame::response::result::{
    self, ColumnSpec, ColumnType, Prepared, PreparedMetadata, ResultMetadata, Rows, SetKeyspace,
    TableSpec,
};
use cassandra_cql::frame::response::{Error, Response, ResponseOpcode, Supported};
use cassandra_cql::frame::value_codec::TypeCodec;
use cassandra_cql::frame::{types, FrameDecoder, FrameDirection, FLAG_CUSTOM_PAYLOAD};
use cassandra_cql::value::Row;
use cassandra_cql::{CqlValue, ProtocolVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cluster::{Host, Registry};
use crate::policies::host_listener::{HostEvent, HostListener};
use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy, Plan, RoutingInfo};

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Schema version every mock node reports unless told otherwise.
pub(crate) const SCHEMA_VERSION: Uuid = Uuid::from_u128(0x5c4e_3a00_0000_4000_8000_0000_0000_0001);

/// What a [`MockNode`] does with a request.
#[derive(Debug, Clone)]
pub(crate) enum MockResponse {
    Respond(Response),
    /// Answers after the given time.
    Delayed(Duration, Response),
    /// Never answers.
    NoResponse,
    /// Closes the connection instead of answering.
    Disconnect,
}

impl MockResponse {
    pub(crate) fn error(error: DbError, reason: &str) -> Self {
        MockResponse::Respond(Response::Error(Error::new(error, reason)))
    }

    /// The response this answer eventually sends.
    pub(crate) fn into_response(self) -> Response {
        match self {
            MockResponse::Respond(response) | MockResponse::Delayed(_, response) => response,
            other => panic!("{:?} sends no response", other),
        }
    }

    pub(crate) fn rows(columns: Vec<(&str, ColumnType)>, rows: Vec<Vec<Option<CqlValue>>>) -> Self {
        let col_specs = columns
            .into_iter()
            .map(|(name, typ)| column_spec("ks", "t", name, typ))
            .collect();
        MockResponse::Respond(Response::Result(result::Result::Rows(Rows {
            metadata: ResultMetadata::new(col_specs),
            rows_count: rows.len(),
            rows: rows.into_iter().map(|columns| Row { columns }).collect(),
        })))
    }
}

/// A PREPARED answer whose result has the given columns of table `ks.t`.
pub(crate) fn prepared_with_result(statement: &str, columns: Vec<(&str, ColumnType)>) -> Response {
    let col_specs = columns
        .into_iter()
        .map(|(name, typ)| column_spec("ks", "t", name, typ))
        .collect();
    Response::Result(result::Result::Prepared(Prepared {
        id: prepared_id(statement),
        prepared_metadata: PreparedMetadata::default(),
        result_metadata: ResultMetadata::new(col_specs),
    }))
}

/// Id a mock node gives to a prepared statement: the same text always gets the same id.
pub(crate) fn prepared_id(statement: &str) -> Bytes {
    let mut hasher = DefaultHasher::new();
    statement.hash(&mut hasher);
    Bytes::copy_from_slice(&hasher.finish().to_be_bytes())
}

fn column_spec(ks: &str, table: &str, name: &str, typ: ColumnType) -> ColumnSpec {
    ColumnSpec {
        table_spec: TableSpec {
            ks_name: ks.to_owned(),
            table_name: table.to_owned(),
        },
        name: name.to_owned(),
        typ,
    }
}

type Handler = Arc<dyn Fn(&Request) -> MockResponse + Send + Sync>;

/// A row of a system table: column name, type and value.
pub(crate) type SystemRow = Vec<(String, ColumnType, Option<CqlValue>)>;

/// Builds a `system.peers` row for a peer at `peer` with the given rpc address.
pub(crate) fn peer_row(peer: &str, rpc_address: &str, datacenter: &str) -> SystemRow {
    vec![
        (
            "peer".to_owned(),
            ColumnType::Inet,
            Some(CqlValue::Inet(peer.parse().unwrap())),
        ),
        (
            "rpc_address".to_owned(),
            ColumnType::Inet,
            Some(CqlValue::Inet(rpc_address.parse().unwrap())),
        ),
        (
            "data_center".to_owned(),
            ColumnType::Text,
            Some(CqlValue::Text(datacenter.to_owned())),
        ),
        (
            "rack".to_owned(),
            ColumnType::Text,
            Some(CqlValue::Text("rack1".to_owned())),
        ),
        (
            "host_id".to_owned(),
            ColumnType::Uuid,
            Some(CqlValue::Uuid(Uuid::new_v4())),
        ),
        (
            "release_version".to_owned(),
            ColumnType::Text,
            Some(CqlValue::Text("3.11.4".to_owned())),
        ),
        (
            "tokens".to_owned(),
            ColumnType::Set(Box::new(ColumnType::Text)),
            Some(CqlValue::Set(vec![CqlValue::Text("100".to_owned())])),
        ),
        (
            "schema_version".to_owned(),
            ColumnType::Uuid,
            Some(CqlValue::Uuid(SCHEMA_VERSION)),
        ),
    ]
}

fn default_local_row() -> SystemRow {
    vec![
        (
            "key".to_owned(),
            ColumnType::Text,
            Some(CqlValue::Text("local".to_owned())),
        ),
        (
            "data_center".to_owned(),
            ColumnType::Text,
            Some(CqlValue::Text("dc1".to_owned())),
        ),
        (
            "rack".to_owned(),
            ColumnType::Text,
            Some(CqlValue::Text("rack1".to_owned())),
        ),
        (
            "host_id".to_owned(),
            ColumnType::Uuid,
            Some(CqlValue::Uuid(Uuid::new_v4())),
        ),
        (
            "release_version".to_owned(),
            ColumnType::Text,
            Some(CqlValue::Text("3.11.4".to_owned())),
        ),
        (
            "tokens".to_owned(),
            ColumnType::Set(Box::new(ColumnType::Text)),
            Some(CqlValue::Set(vec![CqlValue::Text("0".to_owned())])),
        ),
        (
            "schema_version".to_owned(),
            ColumnType::Uuid,
            Some(CqlValue::Uuid(SCHEMA_VERSION)),
        ),
    ]
}

// Answers `SELECT a, b FROM system.<table>` with the requested columns of `rows`.
fn select_system_rows(query: &str, table: &str, rows: &[SystemRow]) -> Response {
    let selected: Vec<String> = query
        .trim_start()
        .strip_prefix("SELECT")
        .and_then(|rest| rest.split(" FROM").next())
        .map(|columns| columns.split(',').map(|c| c.trim().to_owned()).collect())
        .unwrap_or_default();
    let template = rows.first().cloned().unwrap_or_else(default_local_row);
    let selected: Vec<String> = if selected.iter().any(|c| c == "*") {
        template.iter().map(|(name, _, _)| name.clone()).collect()
    } else {
        selected
    };

    let col_specs = selected
        .iter()
        .map(|name| {
            let typ = template
                .iter()
                .find(|(column, _, _)| column == name)
                .map_or(ColumnType::Text, |(_, typ, _)| typ.clone());
            column_spec("system", table, name, typ)
        })
        .collect();
    let rows: Vec<Row> = rows
        .iter()
        .map(|row| Row {
            columns: selected
                .iter()
                .map(|name| {
                    row.iter()
                        .find(|(column, _, _)| column == name)
                        .and_then(|(_, _, value)| value.clone())
                })
                .collect(),
        })
        .collect();

    Response::Result(result::Result::Rows(Rows {
        metadata: ResultMetadata::new(col_specs),
        rows_count: rows.len(),
        rows,
    }))
}

struct MockState {
    handler: Handler,
    max_version: ProtocolVersion,
    local: Mutex<SystemRow>,
    peers: Mutex<Vec<SystemRow>>,
    received: Mutex<Vec<Request>>,
    connections: Mutex<Vec<ConnectionHandle>>,
    accepted: AtomicUsize,
    open: AtomicUsize,
    closed: watch::Sender<usize>,
}

#[derive(Clone)]
struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Outgoing>,
    version: Arc<AtomicU8>,
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

pub(crate) struct MockNodeBuilder {
    handler: Option<Handler>,
    max_version: ProtocolVersion,
    local: SystemRow,
    peers: Vec<SystemRow>,
}

impl MockNodeBuilder {
    /// Decides the response to each request. Requests the handler does not
    /// care about can be passed to [`MockNode::default_response`].
    pub(crate) fn handler(
        mut self,
        handler: impl Fn(&Request) -> MockResponse + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Requests in a newer version are rejected with a protocol error.
    pub(crate) fn max_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.max_version = version;
        self
    }

    pub(crate) fn peers(mut self, peers: Vec<SystemRow>) -> Self {
        self.peers = peers;
        self
    }

    pub(crate) async fn start(self) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed, _) = watch::channel(0);
        let state = Arc::new(MockState {
            handler: self
                .handler
                .unwrap_or_else(|| Arc::new(MockNode::default_response)),
            max_version: self.max_version,
            local: Mutex::new(self.local),
            peers: Mutex::new(self.peers),
            received: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            closed,
        });

        let accept_state = Arc::clone(&state);
        let acceptor = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                accept_state.open.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        MockNode {
            addr,
            state,
            acceptor,
        }
    }
}

/// A CQL node on `127.0.0.1` answering requests from a handler.
///
/// Without a handler it behaves like an idle single-node cluster: the
/// handshake succeeds, `USE` switches keyspaces, system tables can be read,
/// statements can be prepared and everything else returns a void result.
pub(crate) struct MockNode {
    addr: SocketAddr,
    state: Arc<MockState>,
    acceptor: JoinHandle<()>,
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.disconnect_all();
    }
}

impl MockNode {
    pub(crate) fn builder() -> MockNodeBuilder {
        MockNodeBuilder {
            handler: None,
            max_version: ProtocolVersion::LATEST,
            local: default_local_row(),
            peers: Vec::new(),
        }
    }

    pub(crate) async fn start() -> MockNode {
        Self::builder().start().await
    }

    /// An address nothing listens on.
    pub(crate) async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn default_response(request: &Request) -> MockResponse {
        let response = match request {
            Request::Options => Response::Supported(Supported {
                options: HashMap::from([("CQL_VERSION".to_owned(), vec!["3.0.0".to_owned()])]),
            }),
            Request::Startup(_) | Request::Register(_) | Request::Credentials(_) => Response::Ready,
            Request::AuthResponse(_) => Response::AuthSuccess(AuthSuccess {
                success_message: None,
            }),
            Request::Query(query) => match query.contents.strip_prefix("USE ") {
                Some(keyspace) => Response::Result(result::Result::SetKeyspace(SetKeyspace {
                    keyspace_name: keyspace.trim().trim_matches('"').to_owned(),
                })),
                None => Response::Result(result::Result::Void),
            },
            Request::Prepare(prepare) => Response::Result(result::Result::Prepared(Prepared {
                id: prepared_id(&prepare.query),
                prepared_metadata: PreparedMetadata::default(),
                result_metadata: ResultMetadata::default(),
            })),
            Request::Execute(_) | Request::Batch(_) => Response::Result(result::Result::Void),
        };
        MockResponse::Respond(response)
    }

    /// Every request received so far, in order.
    pub(crate) fn received(&self) -> Vec<Request> {
        self.state.received.lock().unwrap().clone()
    }

    pub(crate) fn received_opcodes(&self) -> Vec<RequestOpcode> {
        self.received().iter().map(Request::opcode).collect()
    }

    pub(crate) fn count_received(&self, opcode: RequestOpcode) -> usize {
        self.received()
            .iter()
            .filter(|r| r.opcode() == opcode)
            .count()
    }

    pub(crate) fn connections_accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Waits until `count` connections have been closed in total.
    pub(crate) async fn wait_for_disconnects(&self, count: usize) {
        let mut closed = self.state.closed.subscribe();
        closed.wait_for(|closed| *closed >= count).await.unwrap();
    }

    pub(crate) fn set_peers(&self, peers: Vec<SystemRow>) {
        *self.state.peers.lock().unwrap() = peers;
    }

    /// Sends an event to every open connection.
    pub(crate) fn push_event(&self, event: Event) {
        for connection in self.state.connections.lock().unwrap().iter() {
            let version = ProtocolVersion::try_from(connection.version.load(Ordering::SeqCst))
                .unwrap_or(ProtocolVersion::LATEST);
            let frame = encode_frame(version, -1, &Response::Event(event.clone()));
            let _ = connection.sender.send(Outgoing::Frame(frame));
        }
    }

    /// Pushes an EVENT frame with an arbitrary body to every open connection.
    pub(crate) fn push_raw_event(&self, body: &[u8]) {
        for connection in self.state.connections.lock().unwrap().iter() {
            let version = ProtocolVersion::try_from(connection.version.load(Ordering::SeqCst))
                .unwrap_or(ProtocolVersion::LATEST);
            let frame = encode_raw_frame(version, -1, ResponseOpcode::Event, body);
            let _ = connection.sender.send(Outgoing::Frame(frame));
        }
    }

    /// Closes every open connection from the server side.
    pub(crate) fn disconnect_all(&self) {
        for connection in self.state.connections.lock().unwrap().drain(..) {
            let _ = connection.sender.send(Outgoing::Close);
        }
    }
}

fn encode_frame(version: ProtocolVersion, stream: i16, response: &Response) -> Vec<u8> {
    let codec = TypeCodec::for_version(version);
    let mut body = Vec::new();
    response.serialize(&mut body, &codec).unwrap();
    encode_raw_frame(version, stream, response.opcode(), &body)
}

fn encode_raw_frame(
    version: ProtocolVersion,
    stream: i16,
    opcode: ResponseOpcode,
    body: &[u8],
) -> Vec<u8> {
    let mut frame = vec![version.as_byte() | 0x80, 0];
    match version {
        ProtocolVersion::V1 => frame.push(stream as i8 as u8),
        ProtocolVersion::V3 | ProtocolVersion::V4 => frame.extend_from_slice(&stream.to_be_bytes()),
    }
    frame.push(opcode as u8);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

async fn serve(stream: TcpStream, state: Arc<MockState>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let version = Arc::new(AtomicU8::new(ProtocolVersion::LATEST.as_byte()));
    state.connections.lock().unwrap().push(ConnectionHandle {
        sender: sender.clone(),
        version: Arc::clone(&version),
    });

    let writer = tokio::spawn(async move {
        while let Some(outgoing) = receiver.recv().await {
            match outgoing {
                Outgoing::Frame(frame) => {
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut decoder = FrameDecoder::new(FrameDirection::Request);
    'connection: loop {
        match read_half.read_buf(decoder.buffer_mut()).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => break 'connection,
            };
            let Ok(request_version) = ProtocolVersion::try_from(frame.params.version & 0x7f) else {
                break 'connection;
            };
            version.store(request_version.as_byte(), Ordering::SeqCst);
            let stream = frame.params.stream;

            if request_version > state.max_version {
                let error = Response::Error(Error::new(
                    DbError::ProtocolError,
                    "Invalid or unsupported protocol version",
                ));
                let _ = sender.send(Outgoing::Frame(encode_frame(request_version, stream, &error)));
                continue;
            }

            let mut body = &frame.body[..];
            if frame.params.flags & FLAG_CUSTOM_PAYLOAD != 0 {
                let _ = types::read_bytes_map(&mut body);
            }
            let Ok(opcode) = RequestOpcode::try_from(frame.opcode) else {
                break 'connection;
            };
            let Ok(request) = Request::deserialize(&mut body, opcode, request_version) else {
                break 'connection;
            };
            state.received.lock().unwrap().push(request.clone());

            let mock_response = match &request {
                Request::Query(query) if query.contents.contains("FROM system.local") => {
                    let local = state.local.lock().unwrap().clone();
                    MockResponse::Respond(select_system_rows(&query.contents, "local", &[local]))
                }
                Request::Query(query) if query.contents.contains("FROM system.peers") => {
                    let peers = state.peers.lock().unwrap().clone();
                    MockResponse::Respond(select_system_rows(&query.contents, "peers", &peers))
                }
                // Schema tables of an empty cluster.
                Request::Query(query) if query.contents.contains("FROM system.schema_") => {
                    MockResponse::Respond(Response::Result(result::Result::Rows(Rows {
                        metadata: ResultMetadata::default(),
                        rows_count: 0,
                        rows: Vec::new(),
                    })))
                }
                _ => (state.handler)(&request),
            };

            match mock_response {
                MockResponse::Respond(response) => {
                    let _ = sender.send(Outgoing::Frame(encode_frame(
                        request_version,
                        stream,
                        &response,
                    )));
                }
                MockResponse::Delayed(delay, response) => {
                    let sender = sender.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = sender.send(Outgoing::Frame(encode_frame(
                            request_version,
                            stream,
                            &response,
                        )));
                    });
                }
                MockResponse::NoResponse => {}
                MockResponse::Disconnect => {
                    let _ = sender.send(Outgoing::Close);
                }
            }
        }
    }

    let _ = sender.send(Outgoing::Close);
    let _ = writer.await;
    state
        .connections
        .lock()
        .unwrap()
        .retain(|c| !c.sender.same_channel(&sender));
    state.open.fetch_sub(1, Ordering::SeqCst);
    state.closed.send_modify(|closed| *closed += 1);
}

/// Plans the hosts in a fixed order, skipping the ones the registry does not know.
#[derive(Debug)]
pub(crate) struct FixedOrderPolicy {
    registry: Arc<Registry>,
    order: Vec<SocketAddr>,
}

impl FixedOrderPolicy {
    pub(crate) fn new(registry: Arc<Registry>, order: Vec<SocketAddr>) -> Self {
        Self { registry, order }
    }
}

impl HostListener for FixedOrderPolicy {
    fn on_event(&self, _host: &Host, _event: HostEvent) {}
}

impl LoadBalancingPolicy for FixedOrderPolicy {
    fn plan(&self, _routing_info: &RoutingInfo) -> Plan {
        let hosts: Vec<Arc<Host>> = self
            .order
            .iter()
            .filter_map(|addr| self.registry.host(*addr))
            .collect();
        Box::new(hosts.into_iter())
    }

    fn distance(&self, host: &Host) -> HostDistance {
        if self.order.contains(&host.address()) {
            HostDistance::Local
        } else {
            HostDistance::Ignore
        }
    }

    fn name(&self) -> String {
        "FixedOrderPolicy".to_owned()
    }
}
