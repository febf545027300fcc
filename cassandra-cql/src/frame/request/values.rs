//! Bound values, serialized once and embedded into QUERY, EXECUTE and BATCH.

use bytes::BufMut;

use super::RequestDeserializationError;
use crate::frame::frame_errors::SerializationError;
use crate::frame::response::result::ColumnType;
use crate::frame::types::{self, RawValue};
use crate::frame::value_codec::TypeCodec;
use crate::value::BoundValue;

/// Values of one statement, already in their `[value]` wire form.
///
/// Either all values carry names or none does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValues {
    serialized: Vec<u8>,
    element_count: u16,
    named: bool,
}

impl SerializedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.element_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn has_names(&self) -> bool {
        self.named
    }

    pub fn add_value(
        &mut self,
        codec: &TypeCodec,
        value: &BoundValue,
        typ: Option<&ColumnType>,
    ) -> Result<(), SerializationError> {
        if self.named {
            return Err(SerializationError::MixedNamedAndPositionalValues);
        }
        self.push(codec, None, value, typ)
    }

    /// Named values are only understood by QUERY requests from v3 on.
    pub fn add_named_value(
        &mut self,
        codec: &TypeCodec,
        name: &str,
        value: &BoundValue,
        typ: Option<&ColumnType>,
    ) -> Result<(), SerializationError> {
        if !self.named && !self.is_empty() {
            return Err(SerializationError::MixedNamedAndPositionalValues);
        }
        if !codec.version().supports_query_flags() {
            return Err(SerializationError::NotSupportedByVersion {
                what: "named values",
                version: codec.version(),
            });
        }
        self.named = true;
        self.push(codec, Some(name), value, typ)
    }

    fn push(
        &mut self,
        codec: &TypeCodec,
        name: Option<&str>,
        value: &BoundValue,
        typ: Option<&ColumnType>,
    ) -> Result<(), SerializationError> {
        let element_count = self
            .element_count
            .checked_add(1)
            .ok_or(SerializationError::TooManyValues)?;

        // Serialize into a scratch buffer so that a failure leaves `self` untouched.
        let mut scratch = Vec::new();
        if let Some(name) = name {
            types::write_string(name, &mut scratch)?;
        }
        codec.serialize_bound(value, typ, &mut scratch)?;

        self.serialized.extend_from_slice(&scratch);
        self.element_count = element_count;
        Ok(())
    }

    /// Writes `<n><value_1>...<value_n>`.
    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.element_count);
        buf.put_slice(&self.serialized);
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Option<&str>, RawValue<'_>)> {
        let mut buf = &self.serialized[..];
        let named = self.named;
        (0..self.element_count).map_while(move |_| {
            let name = if named {
                Some(types::read_string(&mut buf).ok()?)
            } else {
                None
            };
            let value = types::read_value(&mut buf).ok()?;
            Some((name, value))
        })
    }

    pub fn new_from_frame(
        buf: &mut &[u8],
        named: bool,
    ) -> Result<Self, RequestDeserializationError> {
        let element_count = types::read_short(buf)?;
        let start = *buf;
        for _ in 0..element_count {
            if named {
                types::read_string(buf)?;
            }
            types::read_value(buf)?;
        }
        let consumed = start.len() - buf.len();
        Ok(Self {
            serialized: start[..consumed].to_vec(),
            element_count,
            named,
        })
    }
}
