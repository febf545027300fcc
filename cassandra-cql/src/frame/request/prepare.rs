//! CQL protocol-level representation of a `PREPARE` request.

use crate::frame::frame_errors::SerializationError;
use crate::frame::protocol_version::ProtocolVersion;
use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{DeserializableRequest, RequestDeserializationError};

/// CQL protocol-level representation of an `PREPARE` request,
/// used to prepare a single statement for further execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    /// CQL statement string to prepare.
    pub query: String,
}

impl SerializableRequest for Prepare {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        _version: ProtocolVersion,
    ) -> Result<(), SerializationError> {
        types::write_long_string(&self.query, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Prepare {
    fn deserialize(
        buf: &mut &[u8],
        _version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        Ok(Self {
            query: types::read_long_string(buf)?.to_owned(),
        })
    }
}
