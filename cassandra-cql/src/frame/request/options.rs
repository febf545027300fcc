use crate::frame::frame_errors::SerializationError;
use crate::frame::protocol_version::ProtocolVersion;

use crate::frame::request::{RequestOpcode, SerializableRequest};

use super::{DeserializableRequest, RequestDeserializationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(
        &self,
        _buf: &mut Vec<u8>,
        _version: ProtocolVersion,
    ) -> Result<(), SerializationError> {
        Ok(())
    }

    fn is_compressible(&self) -> bool {
        false
    }
}

impl DeserializableRequest for Options {
    fn deserialize(
        _buf: &mut &[u8],
        _version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        Ok(Options)
    }
}

/* Key names for options in SUPPORTED/STARTUP */
pub const COMPRESSION: &str = "COMPRESSION";
pub const CQL_VERSION: &str = "CQL_VERSION";

/* Value names for options in SUPPORTED/STARTUP */
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";
