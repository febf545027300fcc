//! Errors that can occur while encoding or decoding frames.

use super::protocol_version::ProtocolVersion;
use super::response::ResponseOpcode;
use super::TryFromPrimitiveError;
use crate::errors::CqlResponseKind;
use std::sync::Arc;
use thiserror::Error;

/// An error that occurred on the frame level: header, compression or framing.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameError {
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received frame marked as coming from a server")]
    FrameFromServer,
    #[error("Received a frame from version {0}, which is not supported")]
    VersionNotSupported(u8),
    #[error("Frame body of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("Frame decompression failed.")]
    FrameDecompression,
    #[error("Frame compression failed.")]
    FrameCompression,
    #[error("Unrecognized response opcode {0}")]
    UnrecognizedOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Failed to parse frame body extensions: {0}")]
    BodyExtensions(#[from] LowLevelDeserializationError),
}

/// An error that occurred while building a request frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    #[error("Failed to serialize request body: {0}")]
    BodySerialization(#[from] SerializationError),
    #[error("Request custom payload is too big")]
    CustomPayloadTooBig,
    #[error("Failed to compress request body: {0}")]
    Compression(FrameError),
}

/// A low level deserialization error: a primitive could not be read from a buffer.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// An error type returned when deserialization of a response body fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResponseParseError {
    #[error("Failed to deserialize ERROR response: {0}")]
    CqlErrorParseError(#[from] CqlErrorParseError),
    #[error("Failed to deserialize RESULT response: {0}")]
    CqlResultParseError(#[from] CqlResultParseError),
    #[error("Failed to deserialize EVENT response: {0}")]
    CqlEventParseError(#[from] CqlEventParseError),
    #[error("Failed to deserialize {kind} response: {error}")]
    Malformed {
        kind: CqlResponseKind,
        error: LowLevelDeserializationError,
    },
    #[error("Response opcode {0:?} is not expected from a server")]
    UnexpectedOpcode(ResponseOpcode),
}

impl CqlResponseParseError {
    pub fn to_response_kind(&self) -> CqlResponseKind {
        match self {
            CqlResponseParseError::CqlErrorParseError(_) => CqlResponseKind::Error,
            CqlResponseParseError::CqlResultParseError(_) => CqlResponseKind::Result,
            CqlResponseParseError::CqlEventParseError(_) => CqlResponseKind::Event,
            CqlResponseParseError::Malformed { kind, .. } => *kind,
            CqlResponseParseError::UnexpectedOpcode(opcode) => opcode.kind(),
        }
    }
}

/// An error type returned when deserialization of ERROR response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlErrorParseError {
    #[error("Malformed error code: {0}")]
    ErrorCodeParseError(LowLevelDeserializationError),
    #[error("Malformed error reason: {0}")]
    ReasonParseError(LowLevelDeserializationError),
    #[error("Malformed error field {field} of DB error {db_error}: {err}")]
    MalformedErrorField {
        db_error: &'static str,
        field: &'static str,
        err: LowLevelDeserializationError,
    },
}

/// An error type returned when deserialization of RESULT response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResultParseError {
    #[error("Malformed RESULT response id: {0}")]
    ResultIdParseError(LowLevelDeserializationError),
    #[error("Unknown RESULT response id: {0}")]
    UnknownResultId(i32),
    #[error("RESULT:Set_keyspace response deserialization failed: {0}")]
    SetKeyspaceParseError(LowLevelDeserializationError),
    #[error("RESULT:Schema_change response deserialization failed: {0}")]
    SchemaChangeParseError(#[from] SchemaChangeEventParseError),
    #[error("RESULT:Prepared response deserialization failed: {0}")]
    PreparedParseError(#[from] PreparedParseError),
    #[error("RESULT:Rows response deserialization failed: {0}")]
    RawRowsParseError(#[from] RowsParseError),
}

/// An error type returned when deserialization of EVENT response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlEventParseError {
    #[error("Malformed event type string: {0}")]
    EventTypeParseError(LowLevelDeserializationError),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Failed to deserialize schema change event: {0}")]
    SchemaChangeEventParseError(#[from] SchemaChangeEventParseError),
    #[error("Failed to deserialize topology change event: {0}")]
    TopologyChangeEventParseError(ClusterChangeEventParseError),
    #[error("Failed to deserialize status change event: {0}")]
    StatusChangeEventParseError(ClusterChangeEventParseError),
}

/// An error type returned when deserialization of a
/// SCHEMA_CHANGE event or result fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SchemaChangeEventParseError {
    #[error("Malformed schema change type string: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),
    #[error("Unknown type of change: {0}")]
    UnknownTypeOfChange(String),
    #[error("Malformed schema change target string: {0}")]
    TargetTypeParseError(LowLevelDeserializationError),
    #[error("Unknown target of schema change: {0}")]
    UnknownTargetOfSchemaChange(String),
    #[error("Malformed name of keyspace affected by schema change: {0}")]
    AffectedKeyspaceParseError(LowLevelDeserializationError),
    #[error("Malformed name of target affected by schema change: {0}")]
    AffectedTargetNameParseError(LowLevelDeserializationError),
    #[error("Malformed arguments of function or aggregate: {0}")]
    ArgumentsParseError(LowLevelDeserializationError),
}

/// An error type returned when deserialization of
/// a TOPOLOGY_CHANGE or STATUS_CHANGE event fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ClusterChangeEventParseError {
    #[error("Malformed type of change: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),
    #[error("Unknown type of change: {0}")]
    UnknownTypeOfChange(String),
    #[error("Malformed node address: {0}")]
    NodeAddressParseError(LowLevelDeserializationError),
}

/// An error type returned when deserialization of RESULT::Prepared fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PreparedParseError {
    #[error("Malformed prepared statement's id length: {0}")]
    IdLengthParseError(LowLevelDeserializationError),
    #[error("Invalid result metadata: {0}")]
    ResultMetadataParseError(ResultMetadataParseError),
    #[error("Invalid prepared metadata: {0}")]
    PreparedMetadataParseError(ResultMetadataParseError),
}

/// An error type returned when deserialization of RESULT::Rows fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RowsParseError {
    #[error("Invalid result metadata: {0}")]
    ResultMetadataParseError(#[from] ResultMetadataParseError),
    #[error("Invalid result metadata, server claims {col_specs_count} columns, received {col_count} column specs.")]
    ColumnCountMismatch {
        col_count: usize,
        col_specs_count: usize,
    },
    #[error("Malformed rows count: {0}")]
    RowsCountParseError(LowLevelDeserializationError),
    #[error("Rows were sent without metadata, and the statement has no result metadata")]
    MissingResultMetadata,
    #[error("Failed to deserialize column {column_name} of row {row}: {err}")]
    ColumnDeserializationError {
        row: usize,
        column_name: String,
        err: DeserializationError,
    },
}

/// An error type returned when deserialization of `[Result/Prepared]Metadata` failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResultMetadataParseError {
    #[error("Malformed metadata flags: {0}")]
    FlagsParseError(LowLevelDeserializationError),
    #[error("Malformed column count: {0}")]
    ColumnCountParseError(LowLevelDeserializationError),
    #[error("Malformed partition key count: {0}")]
    PkCountParseError(LowLevelDeserializationError),
    #[error("Malformed partition key index: {0}")]
    PkIndexParseError(LowLevelDeserializationError),
    #[error("Malformed paging state: {0}")]
    PagingStateParseError(LowLevelDeserializationError),
    #[error("Invalid global table spec: {0}")]
    GlobalTableSpecParseError(LowLevelDeserializationError),
    #[error("Invalid column spec of column {column_index}: {err}")]
    ColumnSpecParseError {
        column_index: usize,
        err: LowLevelDeserializationError,
    },
    #[error("Invalid type of column {column_index}: {err}")]
    ColumnTypeParseError {
        column_index: usize,
        err: ColumnTypeParseError,
    },
}

/// An error type returned when deserialization of a column type fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ColumnTypeParseError {
    #[error("Malformed column type: {0}")]
    Malformed(#[from] LowLevelDeserializationError),
    #[error("Unknown column type id: {0:#x}")]
    UnknownTypeId(u16),
    #[error("Column type id {type_id:#x} is not supported by protocol {version}")]
    NotSupportedByVersion {
        type_id: u16,
        version: ProtocolVersion,
    },
}

/// An error raised while encoding a typed value or a request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SerializationError {
    #[error("Value is too big to be sent in a request - max 2GiB allowed")]
    ValueTooBig,
    #[error("Collection or string is too long for protocol {0}")]
    LengthOverflow(ProtocolVersion),
    #[error("Unset values are not supported by protocol {0}")]
    UnsetNotSupported(ProtocolVersion),
    #[error("{what} is not supported by protocol {version}")]
    NotSupportedByVersion {
        what: &'static str,
        version: ProtocolVersion,
    },
    #[error("Value of kind {value_kind} does not match column type {column_type}")]
    TypeMismatch {
        value_kind: &'static str,
        column_type: String,
    },
    #[error("Too many values bound to a single statement")]
    TooManyValues,
    #[error("Named and positional values cannot be mixed")]
    MixedNamedAndPositionalValues,
    #[error("Expected {expected} bound values, got {received}")]
    ValueCountMismatch { expected: usize, received: usize },
    #[error("No handler registered for custom type {0}")]
    MissingCustomHandler(String),
    #[error("Custom type handler failed: {0}")]
    CustomHandler(String),
}

impl From<std::num::TryFromIntError> for SerializationError {
    fn from(_: std::num::TryFromIntError) -> Self {
        SerializationError::ValueTooBig
    }
}

/// An error raised while decoding a typed value.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DeserializationError {
    #[error(transparent)]
    LowLevel(#[from] LowLevelDeserializationError),
    #[error("Expected {expected} bytes for {type_name}, got {received}")]
    BadLength {
        type_name: &'static str,
        expected: usize,
        received: usize,
    },
    #[error("Invalid value for {type_name}: {reason}")]
    InvalidValue {
        type_name: &'static str,
        reason: String,
    },
    #[error("{remaining} bytes left over after decoding {type_name}")]
    TrailingBytes {
        type_name: &'static str,
        remaining: usize,
    },
    #[error("No handler registered for custom type {0}")]
    MissingCustomHandler(String),
    #[error("Custom type handler failed: {0}")]
    CustomHandler(String),
}
