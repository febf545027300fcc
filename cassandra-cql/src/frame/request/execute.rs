//! CQL protocol-level representation of a `EXECUTE` request.

use crate::frame::frame_errors::SerializationError;
use crate::frame::protocol_version::ProtocolVersion;
use bytes::Bytes;

use crate::{
    frame::request::{query, RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{
    query::QueryParameters, DeserializableRequest, RequestDeserializationError, SerializedValues,
};

/// CQL protocol-level representation of an `EXECUTE` request,
/// used to execute a single prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute {
    /// ID of the prepared statement to execute.
    pub id: Bytes,

    /// Various parameters controlling the execution of the statement.
    pub parameters: query::QueryParameters,
}

impl SerializableRequest for Execute {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        version: ProtocolVersion,
    ) -> Result<(), SerializationError> {
        types::write_short_bytes(&self.id[..], buf)?;

        match version {
            // v1: <id><n><value_1>...<value_n><consistency>
            ProtocolVersion::V1 => {
                self.parameters.values.write_to_request(buf);
                types::write_consistency(self.parameters.consistency, buf);
            }
            ProtocolVersion::V3 | ProtocolVersion::V4 => self.parameters.serialize(buf)?,
        }
        Ok(())
    }
}

impl DeserializableRequest for Execute {
    fn deserialize(
        buf: &mut &[u8],
        version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
        let parameters = match version {
            ProtocolVersion::V1 => {
                let values = SerializedValues::new_from_frame(buf, false)?;
                let consistency = types::read_consistency(buf)?;
                QueryParameters {
                    consistency,
                    values,
                    ..Default::default()
                }
            }
            ProtocolVersion::V3 | ProtocolVersion::V4 => QueryParameters::deserialize(buf)?,
        };

        Ok(Self { id, parameters })
    }
}
