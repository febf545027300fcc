//! `CREDENTIALS`, the authentication answer of protocol v1.

use std::collections::HashMap;

use crate::frame::frame_errors::SerializationError;
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

use super::{DeserializableRequest, RequestDeserializationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub credentials: HashMap<String, String>,
}

impl SerializableRequest for Credentials {
    const OPCODE: RequestOpcode = RequestOpcode::Credentials;

    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        version: ProtocolVersion,
    ) -> Result<(), SerializationError> {
        if version.supports_sasl_auth() {
            return Err(SerializationError::NotSupportedByVersion {
                what: "CREDENTIALS",
                version,
            });
        }
        types::write_string_map(&self.credentials, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Credentials {
    fn deserialize(
        buf: &mut &[u8],
        _version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        Ok(Self {
            credentials: types::read_string_map(buf)?,
        })
    }
}
