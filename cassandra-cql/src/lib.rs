//! CQL native protocol primitives for talking to Apache Cassandra™.
//!
//! This crate covers everything that happens between a typed request and the
//! bytes on the socket: the low-level read/write primitives
//! ([`frame::types`]), typed column value codecs ([`frame::value_codec`]),
//! frame headers, compression and the streaming frame decoder ([`frame`]),
//! and the request/response message types for protocol versions 1, 3 and 4.

pub mod errors;
pub mod frame;
pub mod value;

pub use crate::frame::protocol_version::ProtocolVersion;
pub use crate::frame::types::{Consistency, SerialConsistency};
pub use crate::value::CqlValue;
