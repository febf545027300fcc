//! Encoding and decoding of typed column values.
//!
//! A [`TypeCodec`] is bound to one negotiated [`ProtocolVersion`]; every
//! version-dependent choice (collection length width, null collection
//! elements, unset markers, which column kinds exist) is a `match` on that
//! version rather than a runtime type inspection.

use super::frame_errors::{DeserializationError, SerializationError};
use super::protocol_version::ProtocolVersion;
use super::response::result::ColumnType;
use super::types::{self, RawValue};
use crate::value::{
    BoundValue, Counter, CqlDate, CqlDuration, CqlTime, CqlTimestamp, CqlValue,
};
use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Converts the bytes of a custom column type to and from [`CqlValue`].
pub trait CustomTypeHandler: Send + Sync + fmt::Debug {
    fn deserialize(&self, raw: &[u8]) -> Result<CqlValue, String>;

    fn serialize(&self, value: &CqlValue, buf: &mut Vec<u8>) -> Result<(), String>;
}

/// A handler that keeps custom values as opaque bytes in [`CqlValue::Custom`].
#[derive(Debug, Clone)]
pub struct OpaqueCustomType {
    class_name: String,
}

impl OpaqueCustomType {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
        }
    }
}

impl CustomTypeHandler for OpaqueCustomType {
    fn deserialize(&self, raw: &[u8]) -> Result<CqlValue, String> {
        Ok(CqlValue::Custom {
            class_name: self.class_name.clone(),
            raw: raw.to_vec(),
        })
    }

    fn serialize(&self, value: &CqlValue, buf: &mut Vec<u8>) -> Result<(), String> {
        match value {
            CqlValue::Custom { raw, .. } | CqlValue::Blob(raw) => {
                buf.extend_from_slice(raw);
                Ok(())
            }
            other => Err(format!(
                "{} cannot be written as {}",
                other.kind_name(),
                self.class_name
            )),
        }
    }
}

/// Handlers for custom column types, keyed by their fully qualified class name.
#[derive(Debug, Clone, Default)]
pub struct CustomTypeRegistry {
    handlers: HashMap<String, Arc<dyn CustomTypeHandler>>,
}

impl CustomTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        class_name: impl Into<String>,
        handler: Arc<dyn CustomTypeHandler>,
    ) -> &mut Self {
        self.handlers.insert(class_name.into(), handler);
        self
    }

    pub fn get(&self, class_name: &str) -> Option<&Arc<dyn CustomTypeHandler>> {
        self.handlers.get(class_name)
    }
}

/// Value codec for one protocol version.
#[derive(Debug, Clone)]
pub struct TypeCodec {
    version: ProtocolVersion,
    custom_types: Arc<CustomTypeRegistry>,
}

impl TypeCodec {
    pub fn new(version: ProtocolVersion, custom_types: Arc<CustomTypeRegistry>) -> Self {
        Self {
            version,
            custom_types,
        }
    }

    /// A codec without any custom type handlers.
    pub fn for_version(version: ProtocolVersion) -> Self {
        Self::new(version, Arc::new(CustomTypeRegistry::default()))
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Writes a bound value as `[value]`: an int length followed by the
    /// serialized value, `-1` for null and `-2` for unset.
    pub fn serialize_bound(
        &self,
        value: &BoundValue,
        typ: Option<&ColumnType>,
        buf: &mut impl BufMut,
    ) -> Result<(), SerializationError> {
        match value {
            BoundValue::Null => types::write_value(RawValue::Null, buf)?,
            BoundValue::Unset => {
                if !self.version.supports_unset() {
                    return Err(SerializationError::UnsetNotSupported(self.version));
                }
                types::write_value(RawValue::Unset, buf)?
            }
            BoundValue::Set(v) => {
                let mut body = Vec::new();
                self.serialize_value(v, typ, &mut body)?;
                types::write_bytes(&body, buf)?;
            }
        }
        Ok(())
    }

    /// Writes the bytes of a single value, without any length prefix.
    ///
    /// When `typ` is given the value is checked against it and custom columns
    /// are written through their registered handler; without a type the
    /// encoding is chosen from the value itself.
    pub fn serialize_value(
        &self,
        value: &CqlValue,
        typ: Option<&ColumnType>,
        buf: &mut Vec<u8>,
    ) -> Result<(), SerializationError> {
        if let Some(ColumnType::Custom(class_name)) = typ {
            return self.serialize_custom(class_name, value, buf);
        }
        if let Some(typ) = typ {
            if !value_matches_type(value, typ) {
                return Err(SerializationError::TypeMismatch {
                    value_kind: value.kind_name(),
                    column_type: typ.to_string(),
                });
            }
        }
        self.check_value_supported(value)?;

        match value {
            CqlValue::Ascii(s) | CqlValue::Text(s) => buf.extend_from_slice(s.as_bytes()),
            CqlValue::Blob(b) => buf.extend_from_slice(b),
            CqlValue::Boolean(b) => buf.put_u8(*b as u8),
            CqlValue::Counter(Counter(c)) => buf.put_i64(*c),
            CqlValue::BigInt(v) => buf.put_i64(*v),
            CqlValue::Int(v) => buf.put_i32(*v),
            CqlValue::SmallInt(v) => buf.put_i16(*v),
            CqlValue::TinyInt(v) => buf.put_i8(*v),
            CqlValue::Float(v) => buf.put_f32(*v),
            CqlValue::Double(v) => buf.put_f64(*v),
            CqlValue::Decimal(d) => types::write_decimal(d, buf)?,
            CqlValue::Varint(v) => types::write_varint(v, buf),
            CqlValue::Timestamp(CqlTimestamp(ms)) => buf.put_i64(*ms),
            CqlValue::Date(CqlDate(days)) => buf.put_u32(*days),
            CqlValue::Time(CqlTime(ns)) => buf.put_i64(*ns),
            CqlValue::Duration(d) => {
                types::vint_encode(d.months as i64, buf);
                types::vint_encode(d.days as i64, buf);
                types::vint_encode(d.nanoseconds, buf);
            }
            CqlValue::Uuid(u) | CqlValue::Timeuuid(u) => types::write_uuid(u, buf),
            CqlValue::Inet(addr) => types::write_ip_addr(*addr, buf),
            CqlValue::List(items) | CqlValue::Set(items) => {
                let elem_type = match typ {
                    Some(ColumnType::List(t)) | Some(ColumnType::Set(t)) => Some(t.as_ref()),
                    _ => None,
                };
                self.write_length(items.len(), buf)?;
                for item in items {
                    self.write_element(Some(item), elem_type, buf)?;
                }
            }
            CqlValue::Map(pairs) => {
                let (key_type, value_type) = match typ {
                    Some(ColumnType::Map(k, v)) => (Some(k.as_ref()), Some(v.as_ref())),
                    _ => (None, None),
                };
                self.write_length(pairs.len(), buf)?;
                for (k, v) in pairs {
                    self.write_element(Some(k), key_type, buf)?;
                    self.write_element(Some(v), value_type, buf)?;
                }
            }
            CqlValue::Tuple(items) => {
                let elem_types = match typ {
                    Some(ColumnType::Tuple(types)) => Some(types),
                    _ => None,
                };
                for (i, item) in items.iter().enumerate() {
                    let elem_type = elem_types.and_then(|t| t.get(i));
                    self.write_nested_field(item.as_ref(), elem_type, buf)?;
                }
            }
            CqlValue::UserDefinedType { fields, .. } => {
                let field_types = match typ {
                    Some(ColumnType::UserDefinedType { field_types, .. }) => Some(field_types),
                    _ => None,
                };
                match field_types {
                    // Write fields in declared order; missing ones are null.
                    Some(field_types) => {
                        for (name, field_type) in field_types {
                            let value = fields
                                .iter()
                                .find(|(n, _)| n == name)
                                .and_then(|(_, v)| v.as_ref());
                            self.write_nested_field(value, Some(field_type), buf)?;
                        }
                    }
                    None => {
                        for (_, value) in fields {
                            self.write_nested_field(value.as_ref(), None, buf)?;
                        }
                    }
                }
            }
            CqlValue::Custom { raw, .. } => buf.extend_from_slice(raw),
        }
        Ok(())
    }

    fn serialize_custom(
        &self,
        class_name: &str,
        value: &CqlValue,
        buf: &mut Vec<u8>,
    ) -> Result<(), SerializationError> {
        if let CqlValue::Custom { raw, .. } = value {
            buf.extend_from_slice(raw);
            return Ok(());
        }
        let handler = self
            .custom_types
            .get(class_name)
            .ok_or_else(|| SerializationError::MissingCustomHandler(class_name.to_owned()))?;
        handler
            .serialize(value, buf)
            .map_err(SerializationError::CustomHandler)
    }

    fn check_value_supported(&self, value: &CqlValue) -> Result<(), SerializationError> {
        let what = match value {
            CqlValue::SmallInt(_)
            | CqlValue::TinyInt(_)
            | CqlValue::Date(_)
            | CqlValue::Time(_)
            | CqlValue::Duration(_)
                if !self.version.supports_v4_scalars() =>
            {
                value.kind_name()
            }
            CqlValue::Tuple(_) | CqlValue::UserDefinedType { .. }
                if !self.version.supports_nested_types() =>
            {
                value.kind_name()
            }
            _ => return Ok(()),
        };
        Err(SerializationError::NotSupportedByVersion {
            what,
            version: self.version,
        })
    }

    fn write_length(&self, len: usize, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        types::write_collection_length(len, buf, self.version)
            .map_err(|_| SerializationError::LengthOverflow(self.version))
    }

    // Collection element: [short bytes] before v3, [bytes] from v3.
    fn write_element(
        &self,
        value: Option<&CqlValue>,
        typ: Option<&ColumnType>,
        buf: &mut Vec<u8>,
    ) -> Result<(), SerializationError> {
        let mut body = Vec::new();
        if let Some(value) = value {
            self.serialize_value(value, typ, &mut body)?;
        }
        if self.version.has_int_collection_lengths() {
            types::write_bytes(&body, buf)?;
        } else {
            types::write_short_bytes(&body, buf)
                .map_err(|_| SerializationError::LengthOverflow(self.version))?;
        }
        Ok(())
    }

    // Tuple and UDT fields are always [bytes], null as -1.
    fn write_nested_field(
        &self,
        value: Option<&CqlValue>,
        typ: Option<&ColumnType>,
        buf: &mut Vec<u8>,
    ) -> Result<(), SerializationError> {
        match value {
            Some(value) => {
                let mut body = Vec::new();
                self.serialize_value(value, typ, &mut body)?;
                types::write_bytes(&body, buf)?;
            }
            None => types::write_int(-1, buf),
        }
        Ok(())
    }

    /// Reads a `[bytes]` cell of a row and decodes it; a negative length is null.
    pub fn deserialize_cell(
        &self,
        typ: &ColumnType,
        buf: &mut &[u8],
    ) -> Result<Option<CqlValue>, DeserializationError> {
        match types::read_bytes_opt(buf)? {
            Some(raw) => self.deserialize_value(typ, raw).map(Some),
            None => Ok(None),
        }
    }

    /// Decodes the bytes of a single value of type `typ`.
    pub fn deserialize_value(
        &self,
        typ: &ColumnType,
        raw: &[u8],
    ) -> Result<CqlValue, DeserializationError> {
        let mut buf = raw;
        let value = match typ {
            ColumnType::Custom(class_name) => {
                let handler = self.custom_types.get(class_name).ok_or_else(|| {
                    DeserializationError::MissingCustomHandler(class_name.clone())
                })?;
                return handler
                    .deserialize(raw)
                    .map_err(DeserializationError::CustomHandler);
            }
            ColumnType::Ascii => {
                if !raw.is_ascii() {
                    return Err(DeserializationError::InvalidValue {
                        type_name: "ascii",
                        reason: "non-ASCII byte in value".to_owned(),
                    });
                }
                CqlValue::Ascii(String::from_utf8_lossy(raw).into_owned())
            }
            ColumnType::Text => CqlValue::Text(
                std::str::from_utf8(raw)
                    .map_err(|e| DeserializationError::InvalidValue {
                        type_name: "text",
                        reason: e.to_string(),
                    })?
                    .to_owned(),
            ),
            ColumnType::Blob => CqlValue::Blob(raw.to_vec()),
            ColumnType::Boolean => {
                exact_len("boolean", raw, 1)?;
                CqlValue::Boolean(raw[0] != 0)
            }
            ColumnType::Counter => {
                exact_len("counter", raw, 8)?;
                CqlValue::Counter(Counter(buf.read_i64::<BigEndian>().map_err(io_err)?))
            }
            ColumnType::BigInt => {
                exact_len("bigint", raw, 8)?;
                CqlValue::BigInt(buf.read_i64::<BigEndian>().map_err(io_err)?)
            }
            ColumnType::Timestamp => {
                exact_len("timestamp", raw, 8)?;
                CqlValue::Timestamp(CqlTimestamp(buf.read_i64::<BigEndian>().map_err(io_err)?))
            }
            ColumnType::Int => {
                exact_len("int", raw, 4)?;
                CqlValue::Int(buf.read_i32::<BigEndian>().map_err(io_err)?)
            }
            ColumnType::Float => {
                exact_len("float", raw, 4)?;
                CqlValue::Float(buf.read_f32::<BigEndian>().map_err(io_err)?)
            }
            ColumnType::Double => {
                exact_len("double", raw, 8)?;
                CqlValue::Double(buf.read_f64::<BigEndian>().map_err(io_err)?)
            }
            ColumnType::SmallInt => {
                exact_len("smallint", raw, 2)?;
                CqlValue::SmallInt(buf.read_i16::<BigEndian>().map_err(io_err)?)
            }
            ColumnType::TinyInt => {
                exact_len("tinyint", raw, 1)?;
                CqlValue::TinyInt(raw[0] as i8)
            }
            ColumnType::Date => {
                exact_len("date", raw, 4)?;
                CqlValue::Date(CqlDate(buf.read_u32::<BigEndian>().map_err(io_err)?))
            }
            ColumnType::Time => {
                exact_len("time", raw, 8)?;
                CqlValue::Time(CqlTime(buf.read_i64::<BigEndian>().map_err(io_err)?))
            }
            ColumnType::Decimal => CqlValue::Decimal(types::read_decimal(raw)?),
            ColumnType::Varint => CqlValue::Varint(types::read_varint(raw)),
            ColumnType::Duration => {
                let months = types::vint_decode(&mut buf)?;
                let days = types::vint_decode(&mut buf)?;
                let nanoseconds = types::vint_decode(&mut buf)?;
                let narrow = |v: i64| {
                    i32::try_from(v).map_err(|_| DeserializationError::InvalidValue {
                        type_name: "duration",
                        reason: format!("{} does not fit in 32 bits", v),
                    })
                };
                consumed("duration", buf)?;
                CqlValue::Duration(CqlDuration {
                    months: narrow(months)?,
                    days: narrow(days)?,
                    nanoseconds,
                })
            }
            ColumnType::Uuid => CqlValue::Uuid(read_exact_uuid("uuid", raw)?),
            ColumnType::Timeuuid => CqlValue::Timeuuid(read_exact_uuid("timeuuid", raw)?),
            ColumnType::Inet => CqlValue::Inet(types::read_ip_addr(raw)?),
            ColumnType::List(elem) => {
                let items = self.read_elements(elem, &mut buf)?;
                consumed("list", buf)?;
                CqlValue::List(items)
            }
            ColumnType::Set(elem) => {
                let items = self.read_elements(elem, &mut buf)?;
                consumed("set", buf)?;
                let mut unique: Vec<CqlValue> = Vec::new();
                for item in items {
                    if !unique.contains(&item) {
                        unique.push(item);
                    }
                }
                CqlValue::Set(unique)
            }
            ColumnType::Map(key_type, value_type) => {
                let len = types::read_collection_length(&mut buf, self.version)?;
                let mut pairs = Vec::with_capacity(len.min(buf.len()));
                for _ in 0..len {
                    let key = self.read_element(key_type, &mut buf)?;
                    let value = self.read_element(value_type, &mut buf)?;
                    pairs.push((key, value));
                }
                consumed("map", buf)?;
                CqlValue::Map(pairs)
            }
            ColumnType::Tuple(elem_types) => {
                let mut items = Vec::with_capacity(elem_types.len());
                for elem_type in elem_types {
                    // Trailing members may be missing entirely; they are null.
                    if buf.is_empty() {
                        items.push(None);
                        continue;
                    }
                    items.push(self.deserialize_cell(elem_type, &mut buf)?);
                }
                consumed("tuple", buf)?;
                CqlValue::Tuple(items)
            }
            ColumnType::UserDefinedType {
                keyspace,
                type_name,
                field_types,
            } => {
                let mut fields = Vec::with_capacity(field_types.len());
                for (name, field_type) in field_types {
                    let value = if buf.is_empty() {
                        None
                    } else {
                        self.deserialize_cell(field_type, &mut buf)?
                    };
                    fields.push((name.clone(), value));
                }
                consumed("udt", buf)?;
                CqlValue::UserDefinedType {
                    keyspace: keyspace.clone(),
                    name: type_name.clone(),
                    fields,
                }
            }
        };
        Ok(value)
    }

    fn read_elements(
        &self,
        elem: &ColumnType,
        buf: &mut &[u8],
    ) -> Result<Vec<CqlValue>, DeserializationError> {
        let len = types::read_collection_length(buf, self.version)?;
        let mut items = Vec::with_capacity(len.min(buf.len()));
        for _ in 0..len {
            items.push(self.read_element(elem, buf)?);
        }
        Ok(items)
    }

    fn read_element(
        &self,
        elem: &ColumnType,
        buf: &mut &[u8],
    ) -> Result<CqlValue, DeserializationError> {
        match types::read_collection_element(buf, self.version)? {
            Some(raw) => self.deserialize_value(elem, raw),
            None => Err(DeserializationError::InvalidValue {
                type_name: "collection",
                reason: "null element".to_owned(),
            }),
        }
    }
}

fn exact_len(
    type_name: &'static str,
    raw: &[u8],
    expected: usize,
) -> Result<(), DeserializationError> {
    if raw.len() != expected {
        return Err(DeserializationError::BadLength {
            type_name,
            expected,
            received: raw.len(),
        });
    }
    Ok(())
}

/// Nested values must use up their whole cell.
fn consumed(type_name: &'static str, rest: &[u8]) -> Result<(), DeserializationError> {
    if !rest.is_empty() {
        return Err(DeserializationError::TrailingBytes {
            type_name,
            remaining: rest.len(),
        });
    }
    Ok(())
}

fn read_exact_uuid(
    type_name: &'static str,
    raw: &[u8],
) -> Result<uuid::Uuid, DeserializationError> {
    exact_len(type_name, raw, 16)?;
    Ok(types::read_uuid(&mut &raw[..])?)
}

fn io_err(err: std::io::Error) -> DeserializationError {
    DeserializationError::LowLevel(err.into())
}

fn value_matches_type(value: &CqlValue, typ: &ColumnType) -> bool {
    match (value, typ) {
        (CqlValue::Ascii(_) | CqlValue::Text(_), ColumnType::Ascii | ColumnType::Text) => true,
        (CqlValue::Blob(_), ColumnType::Blob) => true,
        (CqlValue::Boolean(_), ColumnType::Boolean) => true,
        (CqlValue::Counter(_), ColumnType::Counter) => true,
        (CqlValue::BigInt(_), ColumnType::BigInt | ColumnType::Counter) => true,
        (CqlValue::Int(_), ColumnType::Int) => true,
        (CqlValue::SmallInt(_), ColumnType::SmallInt) => true,
        (CqlValue::TinyInt(_), ColumnType::TinyInt) => true,
        (CqlValue::Float(_), ColumnType::Float) => true,
        (CqlValue::Double(_), ColumnType::Double) => true,
        (CqlValue::Decimal(_), ColumnType::Decimal) => true,
        (CqlValue::Varint(_), ColumnType::Varint) => true,
        (CqlValue::Timestamp(_), ColumnType::Timestamp) => true,
        (CqlValue::Date(_), ColumnType::Date) => true,
        (CqlValue::Time(_), ColumnType::Time) => true,
        (CqlValue::Duration(_), ColumnType::Duration) => true,
        (CqlValue::Uuid(_) | CqlValue::Timeuuid(_), ColumnType::Uuid | ColumnType::Timeuuid) => {
            true
        }
        (CqlValue::Inet(_), ColumnType::Inet) => true,
        (CqlValue::List(_), ColumnType::List(_)) => true,
        (CqlValue::Set(_) | CqlValue::List(_), ColumnType::Set(_)) => true,
        (CqlValue::Map(_), ColumnType::Map(_, _)) => true,
        (CqlValue::Tuple(_), ColumnType::Tuple(_)) => true,
        (CqlValue::UserDefinedType { .. }, ColumnType::UserDefinedType { .. }) => true,
        (CqlValue::Custom { .. }, _) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bigdecimal::BigDecimal;
    use num_bigint::BigInt;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;
    use uuid::Uuid;

    const ALL_VERSIONS: [ProtocolVersion; 3] =
        [ProtocolVersion::V1, ProtocolVersion::V3, ProtocolVersion::V4];

    fn round_trip(codec: &TypeCodec, value: &CqlValue, typ: &ColumnType) -> CqlValue {
        let mut buf = Vec::new();
        codec.serialize_value(value, Some(typ), &mut buf).unwrap();
        codec.deserialize_value(typ, &buf).unwrap()
    }

    fn scalar_cases() -> Vec<(CqlValue, ColumnType)> {
        vec![
            (CqlValue::Int(i32::MIN), ColumnType::Int),
            (CqlValue::Int(i32::MAX), ColumnType::Int),
            (CqlValue::BigInt(i64::MIN), ColumnType::BigInt),
            (CqlValue::BigInt(i64::MAX), ColumnType::BigInt),
            (CqlValue::Counter(Counter(-5)), ColumnType::Counter),
            (CqlValue::Boolean(true), ColumnType::Boolean),
            (CqlValue::Float(f32::MAX), ColumnType::Float),
            (CqlValue::Double(f64::MIN_POSITIVE), ColumnType::Double),
            (CqlValue::Text("zażółć".to_owned()), ColumnType::Text),
            (CqlValue::Text(String::new()), ColumnType::Text),
            (CqlValue::Ascii("abc".to_owned()), ColumnType::Ascii),
            (CqlValue::Blob(vec![0, 1, 255]), ColumnType::Blob),
            (
                CqlValue::Decimal(BigDecimal::from_str("0").unwrap()),
                ColumnType::Decimal,
            ),
            (
                CqlValue::Decimal(BigDecimal::from_str("-98765.4321").unwrap()),
                ColumnType::Decimal,
            ),
            (
                CqlValue::Varint(BigInt::from(i64::MIN) * 3),
                ColumnType::Varint,
            ),
            (
                CqlValue::Timestamp(CqlTimestamp(1_600_000_000_000)),
                ColumnType::Timestamp,
            ),
            (
                CqlValue::Uuid(Uuid::from_u128(0x1234_5678_9abc_def0)),
                ColumnType::Uuid,
            ),
            (
                CqlValue::Inet(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
                ColumnType::Inet,
            ),
            (
                CqlValue::Inet(IpAddr::V6(Ipv6Addr::LOCALHOST)),
                ColumnType::Inet,
            ),
        ]
    }

    #[test]
    fn scalars_round_trip_in_every_version() {
        for version in ALL_VERSIONS {
            let codec = TypeCodec::for_version(version);
            for (value, typ) in scalar_cases() {
                assert_eq!(round_trip(&codec, &value, &typ), value, "{:?}", version);
            }
        }
    }

    #[test]
    fn v4_scalars() {
        let codec = TypeCodec::for_version(ProtocolVersion::V4);
        let cases = [
            (CqlValue::SmallInt(i16::MIN), ColumnType::SmallInt),
            (CqlValue::TinyInt(i8::MAX), ColumnType::TinyInt),
            (CqlValue::Date(CqlDate(u32::MAX)), ColumnType::Date),
            (CqlValue::Time(CqlTime(86_399_999_999_999)), ColumnType::Time),
            (
                CqlValue::Duration(CqlDuration {
                    months: -1,
                    days: i32::MAX,
                    nanoseconds: i64::MIN,
                }),
                ColumnType::Duration,
            ),
        ];
        for (value, typ) in cases {
            assert_eq!(round_trip(&codec, &value, &typ), value);
        }

        let v3 = TypeCodec::for_version(ProtocolVersion::V3);
        let mut buf = Vec::new();
        assert_matches!(
            v3.serialize_value(&CqlValue::SmallInt(1), None, &mut buf),
            Err(SerializationError::NotSupportedByVersion { .. })
        );
    }

    #[test]
    fn collections_use_version_specific_lengths() {
        let list = CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2)]);
        let typ = ColumnType::List(Box::new(ColumnType::Int));

        let v1 = TypeCodec::for_version(ProtocolVersion::V1);
        let mut buf = Vec::new();
        v1.serialize_value(&list, Some(&typ), &mut buf).unwrap();
        assert_eq!(buf, vec![0, 2, 0, 4, 0, 0, 0, 1, 0, 4, 0, 0, 0, 2]);

        let v3 = TypeCodec::for_version(ProtocolVersion::V3);
        buf.clear();
        v3.serialize_value(&list, Some(&typ), &mut buf).unwrap();
        assert_eq!(
            buf,
            vec![0, 0, 0, 2, 0, 0, 0, 4, 0, 0, 0, 1, 0, 0, 0, 4, 0, 0, 0, 2]
        );

        for codec in [v1, v3] {
            assert_eq!(round_trip(&codec, &list, &typ), list);
            let empty = CqlValue::List(vec![]);
            assert_eq!(round_trip(&codec, &empty, &typ), empty);
        }
    }

    #[test]
    fn maps_keep_order_and_sets_drop_duplicates() {
        let codec = TypeCodec::for_version(ProtocolVersion::V4);
        let map = CqlValue::Map(vec![
            (CqlValue::Text("b".to_owned()), CqlValue::Int(2)),
            (CqlValue::Text("a".to_owned()), CqlValue::Int(1)),
        ]);
        let map_type = ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Int));
        assert_eq!(round_trip(&codec, &map, &map_type), map);

        let set_type = ColumnType::Set(Box::new(ColumnType::Int));
        let with_duplicates = CqlValue::List(vec![
            CqlValue::Int(1),
            CqlValue::Int(2),
            CqlValue::Int(1),
        ]);
        assert_eq!(
            round_trip(&codec, &with_duplicates, &set_type),
            CqlValue::Set(vec![CqlValue::Int(1), CqlValue::Int(2)])
        );
    }

    #[test]
    fn udt_and_tuple_tolerate_missing_trailing_fields() {
        let codec = TypeCodec::for_version(ProtocolVersion::V3);
        let udt_type = ColumnType::UserDefinedType {
            keyspace: "ks".to_owned(),
            type_name: "address".to_owned(),
            field_types: vec![
                ("street".to_owned(), ColumnType::Text),
                ("number".to_owned(), ColumnType::Int),
                ("zip".to_owned(), ColumnType::Text),
            ],
        };
        // Only the first field present on the wire.
        let mut raw = Vec::new();
        types::write_bytes(b"Main", &mut raw).unwrap();
        let value = codec.deserialize_value(&udt_type, &raw).unwrap();
        assert_eq!(
            value,
            CqlValue::UserDefinedType {
                keyspace: "ks".to_owned(),
                name: "address".to_owned(),
                fields: vec![
                    ("street".to_owned(), Some(CqlValue::Text("Main".to_owned()))),
                    ("number".to_owned(), None),
                    ("zip".to_owned(), None),
                ],
            }
        );
        assert_eq!(round_trip(&codec, &value, &udt_type), value);

        let tuple_type = ColumnType::Tuple(vec![ColumnType::Int, ColumnType::Text]);
        let mut raw = Vec::new();
        types::write_bytes(&7i32.to_be_bytes(), &mut raw).unwrap();
        assert_eq!(
            codec.deserialize_value(&tuple_type, &raw).unwrap(),
            CqlValue::Tuple(vec![Some(CqlValue::Int(7)), None])
        );
        let full = CqlValue::Tuple(vec![None, Some(CqlValue::Text("x".to_owned()))]);
        assert_eq!(round_trip(&codec, &full, &tuple_type), full);
    }

    #[test]
    fn nested_types_need_v3() {
        let v1 = TypeCodec::for_version(ProtocolVersion::V1);
        let mut buf = Vec::new();
        assert_matches!(
            v1.serialize_value(&CqlValue::Tuple(vec![]), None, &mut buf),
            Err(SerializationError::NotSupportedByVersion { what: "tuple", .. })
        );
    }

    #[test]
    fn custom_types_require_a_handler() {
        let typ = ColumnType::Custom("org.example.Point".to_owned());
        let codec = TypeCodec::for_version(ProtocolVersion::V4);
        assert_matches!(
            codec.deserialize_value(&typ, &[1, 2, 3]),
            Err(DeserializationError::MissingCustomHandler(name)) if name == "org.example.Point"
        );

        let mut registry = CustomTypeRegistry::new();
        registry.register(
            "org.example.Point",
            Arc::new(OpaqueCustomType::new("org.example.Point")),
        );
        let codec = TypeCodec::new(ProtocolVersion::V4, Arc::new(registry));
        let value = codec.deserialize_value(&typ, &[1, 2, 3]).unwrap();
        assert_eq!(
            value,
            CqlValue::Custom {
                class_name: "org.example.Point".to_owned(),
                raw: vec![1, 2, 3]
            }
        );
        assert_eq!(round_trip(&codec, &value, &typ), value);
    }

    #[test]
    fn bound_values() {
        let v4 = TypeCodec::for_version(ProtocolVersion::V4);
        let mut buf = Vec::new();
        v4.serialize_bound(&BoundValue::Null, None, &mut buf).unwrap();
        v4.serialize_bound(&BoundValue::Unset, None, &mut buf).unwrap();
        v4.serialize_bound(&BoundValue::Set(CqlValue::TinyInt(-1)), None, &mut buf)
            .unwrap();
        assert_eq!(
            buf,
            vec![0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe, 0, 0, 0, 1, 0xff]
        );

        let v3 = TypeCodec::for_version(ProtocolVersion::V3);
        assert_matches!(
            v3.serialize_bound(&BoundValue::Unset, None, &mut buf),
            Err(SerializationError::UnsetNotSupported(ProtocolVersion::V3))
        );
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let codec = TypeCodec::for_version(ProtocolVersion::V4);
        let mut buf = Vec::new();
        assert_matches!(
            codec.serialize_value(&CqlValue::Int(1), Some(&ColumnType::Text), &mut buf),
            Err(SerializationError::TypeMismatch { value_kind: "int", .. })
        );
    }

    #[test]
    fn bad_lengths_are_decoding_errors() {
        let codec = TypeCodec::for_version(ProtocolVersion::V4);
        assert_matches!(
            codec.deserialize_value(&ColumnType::Int, &[0, 0, 1]),
            Err(DeserializationError::BadLength { expected: 4, received: 3, .. })
        );
        // A list claiming two elements but carrying one.
        let raw = [0, 0, 0, 2, 0, 0, 0, 4, 0, 0, 0, 1];
        assert!(codec
            .deserialize_value(&ColumnType::List(Box::new(ColumnType::Int)), &raw)
            .is_err());
    }

    #[test]
    fn nested_values_must_fill_their_cell() {
        let codec = TypeCodec::for_version(ProtocolVersion::V4);
        // One int element followed by a stray byte.
        let list = [0, 0, 0, 1, 0, 0, 0, 4, 0, 0, 0, 1, 9];
        assert_matches!(
            codec.deserialize_value(&ColumnType::List(Box::new(ColumnType::Int)), &list),
            Err(DeserializationError::TrailingBytes { type_name: "list", remaining: 1 })
        );
        let map = [0, 0, 0, 0, 9, 9];
        assert_matches!(
            codec.deserialize_value(
                &ColumnType::Map(Box::new(ColumnType::Int), Box::new(ColumnType::Int)),
                &map
            ),
            Err(DeserializationError::TrailingBytes { type_name: "map", remaining: 2 })
        );

        // Both members present, then the start of a third that the type does not have.
        let tuple = [0, 0, 0, 4, 0, 0, 0, 7, 0, 0, 0, 1, b'x', 0];
        let tuple_type = ColumnType::Tuple(vec![ColumnType::Int, ColumnType::Text]);
        assert_matches!(
            codec.deserialize_value(&tuple_type, &tuple),
            Err(DeserializationError::TrailingBytes { type_name: "tuple", remaining: 1 })
        );

        let udt_type = ColumnType::UserDefinedType {
            keyspace: "ks".to_owned(),
            type_name: "point".to_owned(),
            field_types: vec![("x".to_owned(), ColumnType::Int)],
        };
        let udt = [0, 0, 0, 4, 0, 0, 0, 7, 0, 0, 0, 0];
        assert_matches!(
            codec.deserialize_value(&udt_type, &udt),
            Err(DeserializationError::TrailingBytes { type_name: "udt", remaining: 4 })
        );
    }
}
