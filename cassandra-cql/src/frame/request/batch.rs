use bytes::{BufMut, Bytes};

use crate::frame::frame_errors::SerializationError;
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::{
    request::{RequestOpcode, SerializableRequest},
    types,
};

use super::query::read_serial_consistency;
use super::{DeserializableRequest, RequestDeserializationError, SerializedValues};

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;
const ALL_FLAGS: u8 = FLAG_WITH_SERIAL_CONSISTENCY | FLAG_WITH_DEFAULT_TIMESTAMP;

/// A BATCH request. Only available from protocol v3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub statements: Vec<BatchStatement>,
    pub batch_type: BatchType,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,
    pub timestamp: Option<i64>,
    /// One entry per statement.
    pub values: Vec<SerializedValues>,
}

/// The type of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

impl TryFrom<u8> for BatchType {
    type Error = RequestDeserializationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Logged),
            1 => Ok(Self::Unlogged),
            2 => Ok(Self::Counter),
            _ => Err(RequestDeserializationError::UnknownBatchType(value)),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum BatchStatement {
    Query { text: String },
    Prepared { id: Bytes },
}

impl SerializableRequest for Batch {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        version: ProtocolVersion,
    ) -> Result<(), SerializationError> {
        if !version.supports_query_flags() {
            return Err(SerializationError::NotSupportedByVersion {
                what: "BATCH",
                version,
            });
        }
        if self.values.len() != self.statements.len() {
            return Err(SerializationError::ValueCountMismatch {
                expected: self.statements.len(),
                received: self.values.len(),
            });
        }

        // Serializing type of batch
        buf.put_u8(self.batch_type as u8);

        // Serializing queries
        types::write_short(u16::try_from(self.statements.len())?, buf);
        for (statement, values) in self.statements.iter().zip(&self.values) {
            statement.serialize(buf)?;
            values.write_to_request(buf);
        }

        // Serializing consistency
        types::write_consistency(self.consistency, buf);

        // Serializing flags
        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

impl BatchStatement {
    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), SerializationError> {
        match self {
            Self::Query { text } => {
                buf.put_u8(0);
                types::write_long_string(text, buf)?;
            }
            Self::Prepared { id } => {
                buf.put_u8(1);
                types::write_short_bytes(id, buf)?;
            }
        }

        Ok(())
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        match types::read_byte(buf)? {
            0 => Ok(Self::Query {
                text: types::read_long_string(buf)?.to_owned(),
            }),
            1 => Ok(Self::Prepared {
                id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
            }),
            kind => Err(RequestDeserializationError::UnexpectedBatchStatementKind(kind)),
        }
    }
}

impl DeserializableRequest for Batch {
    fn deserialize(
        buf: &mut &[u8],
        _version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        let batch_type = BatchType::try_from(types::read_byte(buf)?)?;

        let count = types::read_short(buf)? as usize;
        let mut statements = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            statements.push(BatchStatement::deserialize(buf)?);
            values.push(SerializedValues::new_from_frame(buf, false)?);
        }

        let consistency = types::read_consistency(buf)?;

        let flags = types::read_byte(buf)?;
        let unknown_flags = flags & !ALL_FLAGS;
        if unknown_flags != 0 {
            return Err(RequestDeserializationError::UnknownFlags {
                flags: unknown_flags,
            });
        }

        let serial_consistency = if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
            Some(read_serial_consistency(buf)?)
        } else {
            None
        };
        let timestamp = if flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0 {
            Some(types::read_long(buf)?)
        } else {
            None
        };

        Ok(Self {
            statements,
            batch_type,
            consistency,
            serial_consistency,
            timestamp,
            values,
        })
    }
}
