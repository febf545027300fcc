//! CQL protocol-level representation of a `SUPPORTED` response.

use crate::frame::frame_errors::LowLevelDeserializationError;
use crate::frame::types;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// The CQL protocol-level representation of an `SUPPORTED` response,
/// used to present the server's supported options.
pub struct Supported {
    /// A map of option names to their supported values.
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    /// Deserializes a `SUPPORTED` response from the provided byte buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let options = types::read_string_multimap(buf)?;

        Ok(Supported { options })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), std::num::TryFromIntError> {
        types::write_string_multimap(&self.options, buf)
    }

    /// Compression algorithms offered by the server.
    pub fn compression(&self) -> &[String] {
        self.options
            .get("COMPRESSION")
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
