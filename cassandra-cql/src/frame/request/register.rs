use crate::frame::frame_errors::SerializationError;
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::{
    request::{RequestOpcode, SerializableRequest},
    response::event::EventType,
    types,
};

use super::{DeserializableRequest, RequestDeserializationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub event_types_to_register_for: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        _version: ProtocolVersion,
    ) -> Result<(), SerializationError> {
        let event_types_list = self
            .event_types_to_register_for
            .iter()
            .map(|event| event.as_str())
            .collect::<Vec<_>>();

        types::write_string_list(&event_types_list, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Register {
    fn deserialize(
        buf: &mut &[u8],
        _version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        let event_types_to_register_for = types::read_string_list(buf)?
            .into_iter()
            .map(|name| {
                name.parse::<EventType>()
                    .map_err(|_| RequestDeserializationError::UnknownEventType(name))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            event_types_to_register_for,
        })
    }
}
