//! CQL requests sent by the client.

pub mod auth_response;
pub mod batch;
pub mod credentials;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;
pub mod values;

use thiserror::Error;

use crate::Consistency;

pub use auth_response::AuthResponse;
pub use batch::Batch;
pub use credentials::Credentials;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;
pub use values::SerializedValues;

use super::frame_errors::{LowLevelDeserializationError, SerializationError};
use super::protocol_version::ProtocolVersion;
use super::types::SerialConsistency;
use super::TryFromPrimitiveError;

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    /// Initialize the connection. Must be the first message of the connection,
    /// except for OPTIONS. Answered with READY or AUTHENTICATE.
    Startup = 0x01,
    /// Plain credentials answering AUTHENTICATE in protocol v1.
    Credentials = 0x04,
    /// Asks the server which STARTUP options are supported.
    Options = 0x05,
    /// Executes an unprepared statement.
    Query = 0x07,
    /// Prepares a statement for later execution through EXECUTE.
    Prepare = 0x09,
    /// Executes a prepared statement.
    Execute = 0x0A,
    /// Subscribes the connection to server events.
    Register = 0x0B,
    /// Executes a list of statements as one batch (v3+).
    Batch = 0x0D,
    /// Answers a SASL challenge (v3+).
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x04 => Ok(Self::Credentials),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

impl std::fmt::Display for RequestOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            RequestOpcode::Startup => "STARTUP",
            RequestOpcode::Credentials => "CREDENTIALS",
            RequestOpcode::Options => "OPTIONS",
            RequestOpcode::Query => "QUERY",
            RequestOpcode::Prepare => "PREPARE",
            RequestOpcode::Execute => "EXECUTE",
            RequestOpcode::Register => "REGISTER",
            RequestOpcode::Batch => "BATCH",
            RequestOpcode::AuthResponse => "AUTH_RESPONSE",
        };

        f.write_str(kind_str)
    }
}

/// Requests that can be serialized into a CQL frame.
pub trait SerializableRequest {
    /// Opcode of the request, used to identify the request type in the CQL frame.
    const OPCODE: RequestOpcode;

    /// Serializes the request body for the given protocol version.
    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        version: ProtocolVersion,
    ) -> Result<(), SerializationError>;

    /// Whether the body may be compressed. Requests sent before compression is
    /// agreed on must answer `false`.
    fn is_compressible(&self) -> bool {
        true
    }
}

/// Requests that can be deserialized from a CQL frame.
///
/// The driver never reads requests; this exists for servers and test doubles
/// that need to check what a client sent.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(
        buf: &mut &[u8],
        version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError>;
}

/// An error type returned by [`DeserializableRequest::deserialize`].
#[derive(Debug, Error)]
pub enum RequestDeserializationError {
    #[error("Low level deser error: {0}")]
    LowLevelDeserialization(#[from] LowLevelDeserializationError),
    #[error("Specified flags are not recognised: {:02x}", flags)]
    UnknownFlags { flags: u8 },
    #[error("Expected SerialConsistency, got regular Consistency: {0}")]
    ExpectedSerialConsistency(Consistency),
    #[error("Bad batch type: {0}")]
    UnknownBatchType(u8),
    #[error("Unexpected batch statement kind: {0}")]
    UnexpectedBatchStatementKind(u8),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Request {0} is not expected from a client")]
    UnexpectedOpcode(RequestOpcode),
}

/// Any request a client may send, as seen by the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Startup(Startup),
    Credentials(Credentials),
    Options,
    Query(Query),
    Prepare(Prepare),
    Execute(Execute),
    Register(Register),
    Batch(Batch),
    AuthResponse(AuthResponse),
}

impl Request {
    pub fn deserialize(
        buf: &mut &[u8],
        opcode: RequestOpcode,
        version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        Ok(match opcode {
            RequestOpcode::Startup => Self::Startup(Startup::deserialize(buf, version)?),
            RequestOpcode::Credentials => {
                Self::Credentials(Credentials::deserialize(buf, version)?)
            }
            RequestOpcode::Options => Self::Options,
            RequestOpcode::Query => Self::Query(Query::deserialize(buf, version)?),
            RequestOpcode::Prepare => Self::Prepare(Prepare::deserialize(buf, version)?),
            RequestOpcode::Execute => Self::Execute(Execute::deserialize(buf, version)?),
            RequestOpcode::Register => Self::Register(Register::deserialize(buf, version)?),
            RequestOpcode::Batch => Self::Batch(Batch::deserialize(buf, version)?),
            RequestOpcode::AuthResponse => {
                Self::AuthResponse(AuthResponse::deserialize(buf, version)?)
            }
        })
    }

    pub fn opcode(&self) -> RequestOpcode {
        match self {
            Request::Startup(_) => RequestOpcode::Startup,
            Request::Credentials(_) => RequestOpcode::Credentials,
            Request::Options => RequestOpcode::Options,
            Request::Query(_) => RequestOpcode::Query,
            Request::Prepare(_) => RequestOpcode::Prepare,
            Request::Execute(_) => RequestOpcode::Execute,
            Request::Register(_) => RequestOpcode::Register,
            Request::Batch(_) => RequestOpcode::Batch,
            Request::AuthResponse(_) => RequestOpcode::AuthResponse,
        }
    }

    /// Retrieves consistency from request frame, if present.
    pub fn get_consistency(&self) -> Option<Consistency> {
        match self {
            Request::Query(q) => Some(q.parameters.consistency),
            Request::Execute(e) => Some(e.parameters.consistency),
            Request::Batch(b) => Some(b.consistency),
            _ => None,
        }
    }

    /// Retrieves serial consistency from request frame.
    pub fn get_serial_consistency(&self) -> Option<Option<SerialConsistency>> {
        match self {
            Request::Query(q) => Some(q.parameters.serial_consistency),
            Request::Execute(e) => Some(e.parameters.serial_consistency),
            Request::Batch(b) => Some(b.serial_consistency),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::frame::value_codec::TypeCodec;
    use crate::value::{BoundValue, CqlValue};
    use crate::{
        frame::{
            protocol_version::ProtocolVersion,
            request::{
                batch::{Batch, BatchStatement, BatchType},
                execute::Execute,
                query::{Query, QueryParameters},
                DeserializableRequest, Request, RequestOpcode, SerializableRequest,
                SerializedValues,
            },
            types::{self, SerialConsistency},
        },
        Consistency,
    };

    fn int_values(codec: &TypeCodec, ints: &[i32]) -> SerializedValues {
        let mut vals = SerializedValues::new();
        for v in ints {
            vals.add_value(codec, &BoundValue::Set(CqlValue::Int(*v)), None)
                .unwrap();
        }
        vals
    }

    #[test]
    fn request_ser_de_identity() {
        let codec = TypeCodec::for_version(ProtocolVersion::V4);

        // Query
        let parameters = QueryParameters {
            consistency: Consistency::All,
            serial_consistency: Some(SerialConsistency::Serial),
            timestamp: None,
            page_size: Some(323),
            paging_state: Some(Bytes::from_static(&[2, 1, 3, 7])),
            skip_metadata: false,
            values: int_values(&codec, &[2137]),
        };
        let query = Query {
            contents: "SELECT host_id from system.peers".to_owned(),
            parameters,
        };

        {
            let mut buf = Vec::new();
            query.serialize(&mut buf, ProtocolVersion::V4).unwrap();

            let query_deserialized = Query::deserialize(&mut &buf[..], ProtocolVersion::V4).unwrap();
            assert_eq!(&query_deserialized, &query);
        }

        // Execute
        let id: Bytes = vec![2, 4, 5, 2, 6, 7, 3, 1].into();
        let parameters = QueryParameters {
            consistency: Consistency::Any,
            serial_consistency: None,
            timestamp: Some(3423434),
            page_size: None,
            paging_state: None,
            skip_metadata: true,
            values: int_values(&codec, &[42, 2137]),
        };
        let execute = Execute { id, parameters };
        {
            let mut buf = Vec::new();
            execute.serialize(&mut buf, ProtocolVersion::V4).unwrap();

            let execute_deserialized =
                Execute::deserialize(&mut &buf[..], ProtocolVersion::V4).unwrap();
            assert_eq!(&execute_deserialized, &execute);
        }

        // Batch
        let batch = Batch {
            statements: vec![
                BatchStatement::Query {
                    text: query.contents.clone(),
                },
                BatchStatement::Prepared {
                    id: execute.id.clone(),
                },
            ],
            batch_type: BatchType::Logged,
            consistency: Consistency::EachQuorum,
            serial_consistency: Some(SerialConsistency::LocalSerial),
            timestamp: Some(32432),
            values: vec![
                query.parameters.values.clone(),
                execute.parameters.values.clone(),
            ],
        };
        {
            let mut buf = Vec::new();
            batch.serialize(&mut buf, ProtocolVersion::V3).unwrap();

            let batch_deserialized = Batch::deserialize(&mut &buf[..], ProtocolVersion::V3).unwrap();
            assert_eq!(&batch_deserialized, &batch);

            let request =
                Request::deserialize(&mut &buf[..], RequestOpcode::Batch, ProtocolVersion::V3)
                    .unwrap();
            assert_eq!(request.get_consistency(), Some(Consistency::EachQuorum));
        }
    }

    #[test]
    fn v1_layouts() {
        let codec = TypeCodec::for_version(ProtocolVersion::V1);
        let query = Query {
            contents: "SELECT 1".to_owned(),
            parameters: QueryParameters {
                consistency: Consistency::Quorum,
                page_size: Some(100),
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        query.serialize(&mut buf, ProtocolVersion::V1).unwrap();
        // <long string><consistency>, nothing else.
        let mut expected = Vec::new();
        types::write_long_string("SELECT 1", &mut expected).unwrap();
        types::write_consistency(Consistency::Quorum, &mut expected);
        assert_eq!(buf, expected);

        let execute = Execute {
            id: Bytes::from_static(&[9, 9]),
            parameters: QueryParameters {
                consistency: Consistency::One,
                values: int_values(&codec, &[7]),
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        execute.serialize(&mut buf, ProtocolVersion::V1).unwrap();
        assert_eq!(buf, vec![0, 2, 9, 9, 0, 1, 0, 0, 0, 4, 0, 0, 0, 7, 0, 1]);
        assert_eq!(
            Execute::deserialize(&mut &buf[..], ProtocolVersion::V1).unwrap(),
            execute
        );

        let batch = Batch {
            statements: vec![],
            batch_type: BatchType::Unlogged,
            consistency: Consistency::One,
            serial_consistency: None,
            timestamp: None,
            values: vec![],
        };
        assert!(batch.serialize(&mut Vec::new(), ProtocolVersion::V1).is_err());
    }

    #[test]
    fn deser_rejects_unknown_flags() {
        let query = Query {
            contents: "SELECT host_id from system.peers".to_owned(),
            parameters: QueryParameters {
                serial_consistency: Some(SerialConsistency::LocalSerial),
                ..Default::default()
            },
        };

        let mut buf = Vec::new();
        query.serialize(&mut buf, ProtocolVersion::V4).unwrap();

        // Sanity check: query deserializes to the equivalent.
        let query_deserialized = Query::deserialize(&mut &buf[..], ProtocolVersion::V4).unwrap();
        assert_eq!(query_deserialized, query);

        // Find flags in buffer: they follow the statement and the consistency.
        let mut buf_ptr = buf.as_slice();
        types::read_long_string(&mut buf_ptr).unwrap();
        types::read_consistency(&mut buf_ptr).unwrap();
        let flags_idx = buf.len() - buf_ptr.len();
        buf[flags_idx] |= 0x80;

        // Unknown flags can be protocol extensions with different semantics.
        let _parse_error = Query::deserialize(&mut &buf[..], ProtocolVersion::V4).unwrap_err();
    }
}
