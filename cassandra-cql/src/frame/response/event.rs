//! CQL protocol-level representation of an `EVENT` response.

use crate::frame::frame_errors::{
    ClusterChangeEventParseError, CqlEventParseError, SchemaChangeEventParseError,
};
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::types;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Kinds of events a connection can REGISTER for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopologyChange => "TOPOLOGY_CHANGE",
            Self::StatusChange => "STATUS_CHANGE",
            Self::SchemaChange => "SCHEMA_CHANGE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CqlEventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(Self::TopologyChange),
            "STATUS_CHANGE" => Ok(Self::StatusChange),
            "SCHEMA_CHANGE" => Ok(Self::SchemaChange),
            _ => Err(CqlEventParseError::UnknownEventType(s.to_string())),
        }
    }
}

/// Event that the server notified the client about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Topology changed.
    TopologyChange(TopologyChangeEvent),
    /// Status of a node changed.
    StatusChange(StatusChangeEvent),
    /// Schema changed.
    SchemaChange(SchemaChangeEvent),
}

/// Event that notifies about changes in the cluster topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
    MovedNode(SocketAddr),
}

/// Event that notifies about changes in the nodes' status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

/// A schema element that was created, altered or dropped.
///
/// Also the payload of a RESULT of kind Schema_change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeEvent {
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

/// Type of change that was made to the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

impl SchemaChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaChangeType::Created => "CREATED",
            SchemaChangeType::Updated => "UPDATED",
            SchemaChangeType::Dropped => "DROPPED",
        }
    }
}

impl Event {
    /// Deserialize an event from the provided buffer.
    pub fn deserialize(
        buf: &mut &[u8],
        version: ProtocolVersion,
    ) -> Result<Self, CqlEventParseError> {
        let event_type: EventType = types::read_string(buf)
            .map_err(CqlEventParseError::EventTypeParseError)?
            .parse()?;
        match event_type {
            EventType::TopologyChange => Ok(Self::TopologyChange(
                TopologyChangeEvent::deserialize(buf)
                    .map_err(CqlEventParseError::TopologyChangeEventParseError)?,
            )),
            EventType::StatusChange => Ok(Self::StatusChange(
                StatusChangeEvent::deserialize(buf)
                    .map_err(CqlEventParseError::StatusChangeEventParseError)?,
            )),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(
                buf, version,
            )?)),
        }
    }

    pub fn serialize(
        &self,
        buf: &mut Vec<u8>,
        version: ProtocolVersion,
    ) -> Result<(), std::num::TryFromIntError> {
        match self {
            Event::TopologyChange(event) => {
                types::write_string(EventType::TopologyChange.as_str(), buf)?;
                let (change, addr) = match event {
                    TopologyChangeEvent::NewNode(addr) => ("NEW_NODE", addr),
                    TopologyChangeEvent::RemovedNode(addr) => ("REMOVED_NODE", addr),
                    TopologyChangeEvent::MovedNode(addr) => ("MOVED_NODE", addr),
                };
                types::write_string(change, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::StatusChange(event) => {
                types::write_string(EventType::StatusChange.as_str(), buf)?;
                let (change, addr) = match event {
                    StatusChangeEvent::Up(addr) => ("UP", addr),
                    StatusChangeEvent::Down(addr) => ("DOWN", addr),
                };
                types::write_string(change, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::SchemaChange(event) => {
                types::write_string(EventType::SchemaChange.as_str(), buf)?;
                event.serialize(buf, version)?;
            }
        }
        Ok(())
    }
}

fn parse_change_type(s: &str) -> Result<SchemaChangeType, SchemaChangeEventParseError> {
    match s {
        "CREATED" => Ok(SchemaChangeType::Created),
        "UPDATED" => Ok(SchemaChangeType::Updated),
        "DROPPED" => Ok(SchemaChangeType::Dropped),
        _ => Err(SchemaChangeEventParseError::UnknownTypeOfChange(s.to_owned())),
    }
}

impl SchemaChangeEvent {
    pub fn change_type(&self) -> SchemaChangeType {
        match self {
            Self::KeyspaceChange { change_type, .. }
            | Self::TableChange { change_type, .. }
            | Self::TypeChange { change_type, .. }
            | Self::FunctionChange { change_type, .. }
            | Self::AggregateChange { change_type, .. } => *change_type,
        }
    }

    pub fn keyspace_name(&self) -> &str {
        match self {
            Self::KeyspaceChange { keyspace_name, .. }
            | Self::TableChange { keyspace_name, .. }
            | Self::TypeChange { keyspace_name, .. }
            | Self::FunctionChange { keyspace_name, .. }
            | Self::AggregateChange { keyspace_name, .. } => keyspace_name,
        }
    }

    /// Deserialize a schema change from the provided buffer.
    ///
    /// v1 carries `<change><keyspace><table>` with an empty table for keyspace
    /// changes; later versions name the target explicitly.
    pub fn deserialize(
        buf: &mut &[u8],
        version: ProtocolVersion,
    ) -> Result<Self, SchemaChangeEventParseError> {
        let change_type = parse_change_type(
            types::read_string(buf).map_err(SchemaChangeEventParseError::TypeOfChangeParseError)?,
        )?;

        if version == ProtocolVersion::V1 {
            let keyspace_name = types::read_string(buf)
                .map_err(SchemaChangeEventParseError::AffectedKeyspaceParseError)?
                .to_owned();
            let table = types::read_string(buf)
                .map_err(SchemaChangeEventParseError::AffectedTargetNameParseError)?;
            return Ok(if table.is_empty() {
                Self::KeyspaceChange {
                    change_type,
                    keyspace_name,
                }
            } else {
                Self::TableChange {
                    change_type,
                    keyspace_name,
                    object_name: table.to_owned(),
                }
            });
        }

        let target =
            types::read_string(buf).map_err(SchemaChangeEventParseError::TargetTypeParseError)?;
        let keyspace_name = types::read_string(buf)
            .map_err(SchemaChangeEventParseError::AffectedKeyspaceParseError)?
            .to_owned();
        let read_name = |buf: &mut &[u8]| {
            types::read_string(buf)
                .map(str::to_owned)
                .map_err(SchemaChangeEventParseError::AffectedTargetNameParseError)
        };
        let read_arguments = |buf: &mut &[u8]| {
            types::read_string_list(buf).map_err(SchemaChangeEventParseError::ArgumentsParseError)
        };

        match target {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type,
                keyspace_name,
            }),
            "TABLE" => Ok(Self::TableChange {
                change_type,
                keyspace_name,
                object_name: read_name(buf)?,
            }),
            "TYPE" => Ok(Self::TypeChange {
                change_type,
                keyspace_name,
                type_name: read_name(buf)?,
            }),
            "FUNCTION" => Ok(Self::FunctionChange {
                change_type,
                keyspace_name,
                function_name: read_name(buf)?,
                arguments: read_arguments(buf)?,
            }),
            "AGGREGATE" => Ok(Self::AggregateChange {
                change_type,
                keyspace_name,
                aggregate_name: read_name(buf)?,
                arguments: read_arguments(buf)?,
            }),
            _ => Err(SchemaChangeEventParseError::UnknownTargetOfSchemaChange(
                target.to_string(),
            )),
        }
    }

    pub fn serialize(
        &self,
        buf: &mut Vec<u8>,
        version: ProtocolVersion,
    ) -> Result<(), std::num::TryFromIntError> {
        types::write_string(self.change_type().as_str(), buf)?;
        if version == ProtocolVersion::V1 {
            types::write_string(self.keyspace_name(), buf)?;
            let table = match self {
                Self::TableChange { object_name, .. } => object_name.as_str(),
                _ => "",
            };
            return types::write_string(table, buf);
        }

        let (target, name, arguments) = match self {
            Self::KeyspaceChange { .. } => ("KEYSPACE", None, None),
            Self::TableChange { object_name, .. } => ("TABLE", Some(object_name), None),
            Self::TypeChange { type_name, .. } => ("TYPE", Some(type_name), None),
            Self::FunctionChange {
                function_name,
                arguments,
                ..
            } => ("FUNCTION", Some(function_name), Some(arguments)),
            Self::AggregateChange {
                aggregate_name,
                arguments,
                ..
            } => ("AGGREGATE", Some(aggregate_name), Some(arguments)),
        };
        types::write_string(target, buf)?;
        types::write_string(self.keyspace_name(), buf)?;
        if let Some(name) = name {
            types::write_string(name, buf)?;
        }
        if let Some(arguments) = arguments {
            types::write_string_list(arguments, buf)?;
        }
        Ok(())
    }
}

impl TopologyChangeEvent {
    /// Deserialize a topology change event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ClusterChangeEventParseError> {
        let type_of_change = types::read_string(buf)
            .map_err(ClusterChangeEventParseError::TypeOfChangeParseError)?;
        let addr =
            types::read_inet(buf).map_err(ClusterChangeEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            "MOVED_NODE" => Ok(Self::MovedNode(addr)),
            _ => Err(ClusterChangeEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }
}

impl StatusChangeEvent {
    /// Deserialize a status change event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ClusterChangeEventParseError> {
        let type_of_change = types::read_string(buf)
            .map_err(ClusterChangeEventParseError::TypeOfChangeParseError)?;
        let addr =
            types::read_inet(buf).map_err(ClusterChangeEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ClusterChangeEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn schema_change_v1_and_v3_forms() {
        let table = SchemaChangeEvent::TableChange {
            change_type: SchemaChangeType::Updated,
            keyspace_name: "ks".to_owned(),
            object_name: "t".to_owned(),
        };
        let keyspace = SchemaChangeEvent::KeyspaceChange {
            change_type: SchemaChangeType::Dropped,
            keyspace_name: "ks".to_owned(),
        };

        let mut v1 = Vec::new();
        keyspace.serialize(&mut v1, ProtocolVersion::V1).unwrap();
        let mut expected = Vec::new();
        for s in ["DROPPED", "ks", ""] {
            types::write_string(s, &mut expected).unwrap();
        }
        assert_eq!(v1, expected);

        for version in [ProtocolVersion::V1, ProtocolVersion::V3, ProtocolVersion::V4] {
            for event in [&table, &keyspace] {
                let mut buf = Vec::new();
                event.serialize(&mut buf, version).unwrap();
                let parsed = SchemaChangeEvent::deserialize(&mut &buf[..], version).unwrap();
                assert_eq!(&parsed, event);
            }
        }
    }

    #[test]
    fn function_change_carries_arguments() {
        let mut buf = Vec::new();
        for s in ["CREATED", "FUNCTION", "ks", "f"] {
            types::write_string(s, &mut buf).unwrap();
        }
        types::write_string_list(&["int", "text"], &mut buf).unwrap();

        let parsed = SchemaChangeEvent::deserialize(&mut &buf[..], ProtocolVersion::V4).unwrap();
        assert_eq!(
            parsed,
            SchemaChangeEvent::FunctionChange {
                change_type: SchemaChangeType::Created,
                keyspace_name: "ks".to_owned(),
                function_name: "f".to_owned(),
                arguments: vec!["int".to_owned(), "text".to_owned()],
            }
        );
    }

    #[test]
    fn status_and_topology_events() {
        let addr: SocketAddr = "10.0.0.2:9042".parse().unwrap();
        for event in [
            Event::StatusChange(StatusChangeEvent::Down(addr)),
            Event::TopologyChange(TopologyChangeEvent::MovedNode(addr)),
        ] {
            let mut buf = Vec::new();
            event.serialize(&mut buf, ProtocolVersion::V4).unwrap();
            assert_eq!(
                Event::deserialize(&mut &buf[..], ProtocolVersion::V4).unwrap(),
                event
            );
        }

        let mut buf = Vec::new();
        types::write_string("SOMETHING_ELSE", &mut buf).unwrap();
        assert_matches!(
            Event::deserialize(&mut &buf[..], ProtocolVersion::V4),
            Err(CqlEventParseError::UnknownEventType(_))
        );
    }
}
