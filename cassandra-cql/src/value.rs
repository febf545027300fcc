//! Owned representation of CQL values.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime};
use num_bigint::BigInt;
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Represents a counter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Counter(pub i64);

/// Days since -5877641-06-23 i.e. 2^31 days before unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CqlDate(pub u32);

/// Milliseconds since unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CqlTimestamp(pub i64);

/// Nanoseconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CqlTime(pub i64);

/// Represents a CQL Duration value
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash)]
pub struct CqlDuration {
    pub months: i32,
    pub days: i32,
    pub nanoseconds: i64,
}

const DATE_EPOCH_OFFSET: i64 = 1 << 31;

impl CqlDate {
    pub fn to_naive_date(self) -> Option<NaiveDate> {
        let days = self.0 as i64 - DATE_EPOCH_OFFSET;
        NaiveDate::from_ymd_opt(1970, 1, 1)?.checked_add_signed(ChronoDuration::try_days(days)?)
    }
}

impl CqlTimestamp {
    pub fn to_date_time(self) -> Option<DateTime<chrono::Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }
}

impl CqlTime {
    pub fn to_naive_time(self) -> Option<NaiveTime> {
        let secs = u32::try_from(self.0.div_euclid(1_000_000_000)).ok()?;
        let nanos = u32::try_from(self.0.rem_euclid(1_000_000_000)).ok()?;
        NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
    }
}

/// A value bound to a statement marker.
///
/// `Unset` leaves the column untouched on the server and is only
/// representable from protocol v4 on.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum BoundValue {
    #[default]
    Null,
    Unset,
    Set(CqlValue),
}

impl From<CqlValue> for BoundValue {
    fn from(value: CqlValue) -> Self {
        BoundValue::Set(value)
    }
}

impl From<Option<CqlValue>> for BoundValue {
    fn from(value: Option<CqlValue>) -> Self {
        match value {
            Some(v) => BoundValue::Set(v),
            None => BoundValue::Null,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Counter(Counter),
    Decimal(BigDecimal),
    Date(CqlDate),
    Double(f64),
    Duration(CqlDuration),
    Float(f32),
    Int(i32),
    BigInt(i64),
    Text(String),
    Timestamp(CqlTimestamp),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    /// Pairs in the order they were received or inserted.
    Map(Vec<(CqlValue, CqlValue)>),
    /// Elements are unique; duplicates are dropped when decoding.
    Set(Vec<CqlValue>),
    UserDefinedType {
        keyspace: String,
        name: String,
        /// Fields in the order declared by the type.
        fields: Vec<(String, Option<CqlValue>)>,
    },
    SmallInt(i16),
    TinyInt(i8),
    Time(CqlTime),
    Timeuuid(Uuid),
    Tuple(Vec<Option<CqlValue>>),
    Uuid(Uuid),
    Varint(BigInt),
    /// Opaque bytes of a custom type, for handlers that keep the raw form.
    Custom { class_name: String, raw: Vec<u8> },
}

impl CqlValue {
    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CqlValue::Ascii(_) => "ascii",
            CqlValue::Boolean(_) => "boolean",
            CqlValue::Blob(_) => "blob",
            CqlValue::Counter(_) => "counter",
            CqlValue::Decimal(_) => "decimal",
            CqlValue::Date(_) => "date",
            CqlValue::Double(_) => "double",
            CqlValue::Duration(_) => "duration",
            CqlValue::Float(_) => "float",
            CqlValue::Int(_) => "int",
            CqlValue::BigInt(_) => "bigint",
            CqlValue::Text(_) => "text",
            CqlValue::Timestamp(_) => "timestamp",
            CqlValue::Inet(_) => "inet",
            CqlValue::List(_) => "list",
            CqlValue::Map(_) => "map",
            CqlValue::Set(_) => "set",
            CqlValue::UserDefinedType { .. } => "udt",
            CqlValue::SmallInt(_) => "smallint",
            CqlValue::TinyInt(_) => "tinyint",
            CqlValue::Time(_) => "time",
            CqlValue::Timeuuid(_) => "timeuuid",
            CqlValue::Tuple(_) => "tuple",
            CqlValue::Uuid(_) => "uuid",
            CqlValue::Varint(_) => "varint",
            CqlValue::Custom { .. } => "custom",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Text(s) | Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) | Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Vec<u8>> {
        match self {
            Self::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<CqlValue>> {
        match self {
            Self::List(s) | Self::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_vec(self) -> Option<Vec<CqlValue>> {
        match self {
            Self::List(s) | Self::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Vec<(CqlValue, CqlValue)>> {
        match self {
            Self::Map(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for CqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CqlValue::Ascii(s) | CqlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            CqlValue::Boolean(b) => write!(f, "{}", b),
            CqlValue::Blob(bytes) | CqlValue::Custom { raw: bytes, .. } => {
                f.write_str("0x")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            CqlValue::Counter(c) => write!(f, "{}", c.0),
            CqlValue::Decimal(d) => write!(f, "{}", d),
            CqlValue::Date(d) => match d.to_naive_date() {
                Some(date) => write!(f, "'{}'", date),
                None => write!(f, "{}", d.0),
            },
            CqlValue::Double(d) => write!(f, "{}", d),
            CqlValue::Duration(d) => write!(f, "{}mo{}d{}ns", d.months, d.days, d.nanoseconds),
            CqlValue::Float(v) => write!(f, "{}", v),
            CqlValue::Int(v) => write!(f, "{}", v),
            CqlValue::BigInt(v) => write!(f, "{}", v),
            CqlValue::Timestamp(ts) => match ts.to_date_time() {
                Some(dt) => write!(f, "'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f%z")),
                None => write!(f, "{}", ts.0),
            },
            CqlValue::Inet(addr) => write!(f, "'{}'", addr),
            CqlValue::List(items) => write_seq(f, "[", items.iter(), "]"),
            CqlValue::Set(items) => write_seq(f, "{", items.iter(), "}"),
            CqlValue::Map(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
            CqlValue::UserDefinedType { fields, .. } => {
                f.write_str("{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match value {
                        Some(v) => write!(f, "{}: {}", name, v)?,
                        None => write!(f, "{}: null", name)?,
                    }
                }
                f.write_str("}")
            }
            CqlValue::SmallInt(v) => write!(f, "{}", v),
            CqlValue::TinyInt(v) => write!(f, "{}", v),
            CqlValue::Time(t) => match t.to_naive_time() {
                Some(time) => write!(f, "'{}'", time),
                None => write!(f, "{}", t.0),
            },
            CqlValue::Timeuuid(u) | CqlValue::Uuid(u) => write!(f, "{}", u),
            CqlValue::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match item {
                        Some(v) => write!(f, "{}", v)?,
                        None => f.write_str("null")?,
                    }
                }
                f.write_str(")")
            }
            CqlValue::Varint(v) => write!(f, "{}", v),
        }
    }
}

fn write_seq<'a>(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    items: impl Iterator<Item = &'a CqlValue>,
    close: &str,
) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str(close)
}

/// A single row of a result, one optional value per column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

impl Row {
    pub fn get(&self, index: usize) -> Option<&CqlValue> {
        self.columns.get(index).and_then(Option::as_ref)
    }
}
