//! CQL protocol-level representation of a `STARTUP` request.

use std::collections::HashMap;

use crate::frame::frame_errors::SerializationError;
use crate::frame::protocol_version::ProtocolVersion;
use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{DeserializableRequest, RequestDeserializationError};

/// The CQL protocol-level representation of an `STARTUP` request,
/// used to finalise connection negotiation phase and establish the CQL connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    /// The protocol options that were suggested by the server and accepted by the client.
    pub options: HashMap<String, String>,
}

impl SerializableRequest for Startup {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        _version: ProtocolVersion,
    ) -> Result<(), SerializationError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }

    // Compression is only in effect once the server accepted this request.
    fn is_compressible(&self) -> bool {
        false
    }
}

impl DeserializableRequest for Startup {
    fn deserialize(
        buf: &mut &[u8],
        _version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        let options = types::read_string_map(buf)?;
        Ok(Self { options })
    }
}
