//! This module contains various errors which can be returned by the driver.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub use cassandra_cql::errors::{CqlResponseKind, DbError, WriteType};
use cassandra_cql::frame::frame_errors::{
    CqlRequestSerializationError, CqlResponseParseError, FrameError, RowsParseError,
    SerializationError,
};
use cassandra_cql::frame::request::RequestOpcode;
use cassandra_cql::frame::response::Error as CqlError;
use cassandra_cql::ProtocolVersion;
use itertools::Itertools;
use thiserror::Error;

/// Error that occurred during execution of a logical operation
/// (query, prepare, execute or batch), as seen by the caller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Every host of the plan was tried and none could serve the request.
    /// Carries the error encountered on each host.
    #[error("No host was able to serve the request: [{}]", DisplayErrors(.errors))]
    NoHostsAvailable {
        errors: HashMap<SocketAddr, RequestAttemptError>,
    },

    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Client gave up waiting for a response to a request that is not known
    /// to be idempotent, so it was not retried.
    #[error("Request timed out after {timeout:?} (hosts tried: {hosts:?}, retries: {retries})")]
    RequestTimeout {
        timeout: Duration,
        hosts: Vec<SocketAddr>,
        retries: usize,
    },

    /// A local precondition was not met.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Failed to switch the keyspace of a connection.
    #[error(transparent)]
    UseKeyspace(#[from] UseKeyspaceError),

    /// A response violated the protocol contract. Always a bug in the driver or the server.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    pub(crate) fn from_attempt(
        error: RequestAttemptError,
        hosts: &[SocketAddr],
        retries: usize,
    ) -> ExecutionError {
        match error {
            RequestAttemptError::DbError(db_error, reason) => {
                ExecutionError::DbError(db_error, reason)
            }
            RequestAttemptError::RequestTimeout(timeout) => ExecutionError::RequestTimeout {
                timeout,
                hosts: hosts.to_vec(),
                retries,
            },
            RequestAttemptError::SerializationError(err) => {
                ExecutionError::Client(ClientError::Serialization(err))
            }
            RequestAttemptError::UnexpectedResponse(kind) => {
                ExecutionError::Internal(format!("Received unexpected response: {}", kind))
            }
            other => ExecutionError::Internal(other.to_string()),
        }
    }
}

struct DisplayErrors<'a, E>(&'a HashMap<SocketAddr, E>);

impl<E: fmt::Display> fmt::Display for DisplayErrors<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.0
                .iter()
                .sorted_by_key(|(addr, _)| **addr)
                .map(|(addr, err)| format!("{}: {}", addr, err))
                .join(", ")
        )
    }
}

/// A local precondition violation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ClientError {
    #[error("Client not connected")]
    NotConnected,

    #[error("Client closed")]
    Closed,

    #[error("Failed to serialize the request: {0}")]
    Serialization(#[from] CqlRequestSerializationError),

    #[error("Failed to serialize bound values: {0}")]
    Values(#[from] SerializationError),

    #[error("Statement expects {expected} values, {received} were given")]
    ValueCountMismatch { expected: usize, received: usize },

    #[error("{what} is not supported by protocol {version}")]
    NotSupportedByVersion {
        what: &'static str,
        version: ProtocolVersion,
    },

    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),
}

/// An error of a single attempt to send a request to a single host.
///
/// These are stored per host in [`ExecutionError::NoHostsAvailable`]
/// and offered to the retry policy.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// The connection broke while the request was in flight.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The connection had already been closed when the request was submitted.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// There is no open connection to the host.
    #[error("Host is not connected")]
    NotConnected,

    /// No response arrived within the request timeout.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Failed to serialize the request.
    #[error("Failed to serialize the request: {0}")]
    SerializationError(#[from] CqlRequestSerializationError),

    /// Failed to parse the response.
    #[error(transparent)]
    ResponseParseError(#[from] ResponseParseError),

    /// The response is not one that may answer the request.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(CqlResponseKind),

    /// Rows could not be materialized against the statement's metadata.
    #[error("Failed to decode rows: {0}")]
    RowsParseError(#[from] RowsParseError),
}

impl RequestAttemptError {
    /// Whether the host could not service the request at all, so the request
    /// may be sent to another host regardless of its idempotency.
    pub fn is_host_error(&self) -> bool {
        match self {
            RequestAttemptError::DbError(db_error, _) => db_error.is_host_error(),
            RequestAttemptError::BrokenConnection(_)
            | RequestAttemptError::ConnectionClosed
            | RequestAttemptError::NotConnected
            | RequestAttemptError::ResponseParseError(_) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestAttemptError::RequestTimeout(_))
    }
}

impl From<CqlError> for RequestAttemptError {
    fn from(value: CqlError) -> Self {
        RequestAttemptError::DbError(value.error, value.reason)
    }
}

/// Failed to turn a received frame into a response.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResponseParseError {
    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),
    #[error("Failed to parse the response: {0}")]
    CqlResponseParseError(#[from] CqlResponseParseError),
}

/// An error that caused a connection to break.
/// Shared between all requests that were in flight on the connection.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// Failed to read a frame off the socket.
    #[error("Failed to read from the socket: {0}")]
    ReadError(std::io::Error),

    /// Failed to write a frame to the socket.
    #[error("Failed to write to the socket: {0}")]
    WriteError(std::io::Error),

    /// The server closed the socket.
    #[error("Connection closed by the server")]
    ClosedByServer,

    /// The connection was closed on the client side.
    #[error("Connection closed by the client")]
    ClosedByClient,

    /// The received bytes are not a valid frame.
    #[error("Malformed frame: {0}")]
    FrameError(#[from] FrameError),

    /// Nothing was received for longer than the idle timeout.
    #[error("No data received from {addr} for {timeout:?}")]
    IdleTimeout { addr: SocketAddr, timeout: Duration },

    /// A heartbeat request failed.
    #[error("Heartbeat request to {addr} failed: {error}")]
    HeartbeatError {
        addr: SocketAddr,
        error: RequestAttemptError,
    },

    /// The internal channel of the connection was closed.
    #[error("Internal channel of the connection was closed")]
    ChannelError,
}

/// Failed to create a session.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// None of the known nodes could be resolved to an address.
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// No contact point accepted the control connection.
    #[error("Could not establish the control connection: [{}]", DisplayErrors(.errors))]
    ControlConnection {
        errors: HashMap<SocketAddr, ControlConnectionError>,
    },

    /// The cluster is known, but no data connection could be opened.
    #[error("Could not connect to any host: [{}]", DisplayErrors(.errors))]
    NoConnections {
        errors: HashMap<SocketAddr, ConnectionError>,
    },
}

/// Why the control connection to one host could not be established.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ControlConnectionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// An error that occurred while opening a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Connect timeout elapsed.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Input/Output error has occurred.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// A request of the handshake failed.
    #[error("Failed to perform a connection setup request {request}: {error}")]
    SetupRequestError {
        request: RequestOpcode,
        error: RequestAttemptError,
    },

    /// The server rejected every protocol version that may be tried.
    #[error("Protocol version {0} is not supported by the server")]
    ProtocolVersionUnsupported(ProtocolVersion),

    /// The requested compression is not offered by the server.
    #[error("Compression {0} is not supported by the server")]
    CompressionNotSupported(cassandra_cql::frame::Compression),

    /// Authentication was required and failed.
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),
}

impl ConnectionError {
    pub(crate) fn setup(request: RequestOpcode, error: impl Into<RequestAttemptError>) -> Self {
        ConnectionError::SetupRequestError {
            request,
            error: error.into(),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

/// Invalid keyspace name given to `USE`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    /// Keyspace name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// Failed to switch the keyspace of a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),

    #[error("Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}")]
    KeyspaceNameMismatch {
        expected_keyspace_name_lowercase: String,
        result_keyspace_name_lowercase: String,
    },
}

/// A connection could not be taken from a pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    #[error("The pool of connections to {0} is empty")]
    Empty(SocketAddr),
}

/// Failed to read cluster metadata from the system tables.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    #[error("Control connection is not established")]
    NotConnected,

    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),

    #[error("Bad row in {table}: {reason}")]
    BadRow { table: &'static str, reason: String },

    #[error("{0} returned no rows")]
    NoRows(&'static str),
}

impl MetadataError {
    /// Transient errors are retried on the reconnection schedule.
    pub fn is_transient(&self) -> bool {
        match self {
            MetadataError::RequestError(err) => err.is_host_error() || err.is_timeout(),
            MetadataError::NotConnected => true,
            _ => false,
        }
    }
}

/// Schema versions could not be compared.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SchemaAgreementError {
    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),

    #[error("Bad row in {table}: {reason}")]
    BadRow { table: &'static str, reason: String },

    #[error("Schema versions did not converge within {0:?}")]
    Timeout(Duration),
}
