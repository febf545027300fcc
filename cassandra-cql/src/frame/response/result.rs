//! CQL protocol-level representation of a `RESULT` response.

use crate::frame::frame_errors::{
    ColumnTypeParseError, CqlResultParseError, LowLevelDeserializationError, PreparedParseError,
    ResultMetadataParseError, RowsParseError, SerializationError,
};
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::frame::value_codec::TypeCodec;
use crate::value::Row;
use bytes::{BufMut, Bytes};
use std::fmt;

// Metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

/// Type of a column, as described by result and prepared metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Custom(name) => write!(f, "'{}'", name),
            ColumnType::Ascii => f.write_str("ascii"),
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::Blob => f.write_str("blob"),
            ColumnType::Counter => f.write_str("counter"),
            ColumnType::Date => f.write_str("date"),
            ColumnType::Decimal => f.write_str("decimal"),
            ColumnType::Double => f.write_str("double"),
            ColumnType::Duration => f.write_str("duration"),
            ColumnType::Float => f.write_str("float"),
            ColumnType::Int => f.write_str("int"),
            ColumnType::BigInt => f.write_str("bigint"),
            ColumnType::Text => f.write_str("text"),
            ColumnType::Timestamp => f.write_str("timestamp"),
            ColumnType::Inet => f.write_str("inet"),
            ColumnType::List(t) => write!(f, "list<{}>", t),
            ColumnType::Map(k, v) => write!(f, "map<{}, {}>", k, v),
            ColumnType::Set(t) => write!(f, "set<{}>", t),
            ColumnType::UserDefinedType {
                keyspace,
                type_name,
                ..
            } => write!(f, "{}.{}", keyspace, type_name),
            ColumnType::SmallInt => f.write_str("smallint"),
            ColumnType::TinyInt => f.write_str("tinyint"),
            ColumnType::Time => f.write_str("time"),
            ColumnType::Timeuuid => f.write_str("timeuuid"),
            ColumnType::Tuple(types) => {
                f.write_str("tuple<")?;
                for (i, t) in types.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                f.write_str(">")
            }
            ColumnType::Uuid => f.write_str("uuid"),
            ColumnType::Varint => f.write_str("varint"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    /// Empty when the server omitted them (skip-metadata execution).
    pub col_specs: Vec<ColumnSpec>,
}

impl ResultMetadata {
    pub fn new(col_specs: Vec<ColumnSpec>) -> Self {
        Self {
            col_count: col_specs.len(),
            paging_state: None,
            col_specs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// Indexes of partition key columns among the bound values.
    /// Only sent by the server from protocol v4.
    pub pk_indexes: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
}

/// Materialized rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

/// Rows whose metadata was not sent, decoded later against the statement's
/// own result metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRows {
    pub paging_state: Option<Bytes>,
    pub col_count: usize,
    pub rows_count: usize,
    raw_rows: Bytes,
}

impl RawRows {
    /// Rows of `col_count` columns still encoded as `[bytes]` cells.
    pub fn new(
        col_count: usize,
        rows_count: usize,
        paging_state: Option<Bytes>,
        raw_rows: Bytes,
    ) -> Self {
        Self {
            paging_state,
            col_count,
            rows_count,
            raw_rows,
        }
    }

    pub fn materialize(
        &self,
        metadata: &ResultMetadata,
        codec: &TypeCodec,
    ) -> StdResult<Rows, RowsParseError> {
        if metadata.col_specs.len() != self.col_count {
            return Err(RowsParseError::ColumnCountMismatch {
                col_count: self.col_count,
                col_specs_count: metadata.col_specs.len(),
            });
        }
        let rows = deser_rows(
            &mut &self.raw_rows[..],
            self.rows_count,
            &metadata.col_specs,
            codec,
        )?;
        Ok(Rows {
            metadata: ResultMetadata {
                col_count: self.col_count,
                paging_state: self.paging_state.clone(),
                col_specs: metadata.col_specs.clone(),
            },
            rows_count: self.rows_count,
            rows,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Result {
    Void,
    Rows(Rows),
    RawRows(RawRows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, LowLevelDeserializationError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

type StdResult<T, E> = std::result::Result<T, E>;

/// Reads a type descriptor: a type id followed by its options.
pub fn deser_type(
    buf: &mut &[u8],
    version: ProtocolVersion,
) -> StdResult<ColumnType, ColumnTypeParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    let v4_only = |typ: ColumnType| {
        if version.supports_v4_scalars() {
            Ok(typ)
        } else {
            Err(ColumnTypeParseError::NotSupportedByVersion {
                type_id: id,
                version,
            })
        }
    };
    let typ = match id {
        0x0000 => Custom(types::read_string(buf)?.to_owned()),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        // 0x000A is "text" in v1 and an alias of varchar afterwards.
        0x000A | 0x000D => Text,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => v4_only(Date)?,
        0x0012 => v4_only(Time)?,
        0x0013 => v4_only(SmallInt)?,
        0x0014 => v4_only(TinyInt)?,
        0x0015 => v4_only(Duration)?,
        0x0020 => List(Box::new(deser_type(buf, version)?)),
        0x0021 => Map(
            Box::new(deser_type(buf, version)?),
            Box::new(deser_type(buf, version)?),
        ),
        0x0022 => Set(Box::new(deser_type(buf, version)?)),
        0x0030 | 0x0031 if !version.supports_nested_types() => {
            return Err(ColumnTypeParseError::NotSupportedByVersion {
                type_id: id,
                version,
            })
        }
        0x0030 => {
            let keyspace = types::read_string(buf)?.to_owned();
            let type_name = types::read_string(buf)?.to_owned();
            let fields_size = types::read_short(buf)? as usize;
            let mut field_types = Vec::with_capacity(fields_size);
            for _ in 0..fields_size {
                let field_name = types::read_string(buf)?.to_owned();
                let field_type = deser_type(buf, version)?;
                field_types.push((field_name, field_type));
            }
            UserDefinedType {
                keyspace,
                type_name,
                field_types,
            }
        }
        0x0031 => {
            let len = types::read_short(buf)? as usize;
            let mut types = Vec::with_capacity(len);
            for _ in 0..len {
                types.push(deser_type(buf, version)?);
            }
            Tuple(types)
        }
        id => return Err(ColumnTypeParseError::UnknownTypeId(id)),
    };

    Ok(typ)
}

impl ColumnType {
    /// Writes the type descriptor, the inverse of [`deser_type`].
    pub fn serialize(&self, buf: &mut impl BufMut) -> StdResult<(), SerializationError> {
        use ColumnType::*;
        let id: u16 = match self {
            Custom(_) => 0x0000,
            Ascii => 0x0001,
            BigInt => 0x0002,
            Blob => 0x0003,
            Boolean => 0x0004,
            Counter => 0x0005,
            Decimal => 0x0006,
            Double => 0x0007,
            Float => 0x0008,
            Int => 0x0009,
            Timestamp => 0x000B,
            Uuid => 0x000C,
            Text => 0x000D,
            Varint => 0x000E,
            Timeuuid => 0x000F,
            Inet => 0x0010,
            Date => 0x0011,
            Time => 0x0012,
            SmallInt => 0x0013,
            TinyInt => 0x0014,
            Duration => 0x0015,
            List(_) => 0x0020,
            Map(_, _) => 0x0021,
            Set(_) => 0x0022,
            UserDefinedType { .. } => 0x0030,
            Tuple(_) => 0x0031,
        };
        types::write_short(id, buf);
        match self {
            Custom(name) => types::write_string(name, buf)?,
            List(t) | Set(t) => t.serialize(buf)?,
            Map(k, v) => {
                k.serialize(buf)?;
                v.serialize(buf)?;
            }
            UserDefinedType {
                keyspace,
                type_name,
                field_types,
            } => {
                types::write_string(keyspace, buf)?;
                types::write_string(type_name, buf)?;
                types::write_short(u16::try_from(field_types.len())?, buf);
                for (name, typ) in field_types {
                    types::write_string(name, buf)?;
                    typ.serialize(buf)?;
                }
            }
            Tuple(types) => {
                types::write_short(u16::try_from(types.len())?, buf);
                for typ in types {
                    typ.serialize(buf)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
    version: ProtocolVersion,
) -> StdResult<Vec<ColumnSpec>, ResultMetadataParseError> {
    let mut col_specs = Vec::with_capacity(col_count.min(buf.len()));
    for column_index in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf).map_err(|err| {
                ResultMetadataParseError::ColumnSpecParseError { column_index, err }
            })?,
        };

        let name = types::read_string(buf)
            .map_err(|err| ResultMetadataParseError::ColumnSpecParseError { column_index, err })?
            .to_owned();
        let typ = deser_type(buf, version)
            .map_err(|err| ResultMetadataParseError::ColumnTypeParseError { column_index, err })?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(
    buf: &mut &[u8],
    version: ProtocolVersion,
) -> StdResult<ResultMetadata, ResultMetadataParseError> {
    let flags = types::read_int(buf).map_err(ResultMetadataParseError::FlagsParseError)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;

    let col_count =
        types::read_int_length(buf).map_err(ResultMetadataParseError::ColumnCountParseError)?;

    let paging_state = if has_more_pages {
        Some(Bytes::copy_from_slice(
            types::read_bytes(buf).map_err(ResultMetadataParseError::PagingStateParseError)?,
        ))
    } else {
        None
    };

    if no_metadata {
        return Ok(ResultMetadata {
            col_count,
            paging_state,
            col_specs: vec![],
        });
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf).map_err(ResultMetadataParseError::GlobalTableSpecParseError)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count, version)?;

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn deser_prepared_metadata(
    buf: &mut &[u8],
    version: ProtocolVersion,
) -> StdResult<PreparedMetadata, ResultMetadataParseError> {
    let flags = types::read_int(buf).map_err(ResultMetadataParseError::FlagsParseError)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;

    let col_count =
        types::read_int_length(buf).map_err(ResultMetadataParseError::ColumnCountParseError)?;

    let pk_indexes = match version {
        ProtocolVersion::V4 => {
            let pk_count = types::read_int_length(buf)
                .map_err(ResultMetadataParseError::PkCountParseError)?;
            let mut pk_indexes = Vec::with_capacity(pk_count.min(buf.len()));
            for _ in 0..pk_count {
                pk_indexes.push(
                    types::read_short(buf).map_err(ResultMetadataParseError::PkIndexParseError)?,
                );
            }
            pk_indexes
        }
        ProtocolVersion::V1 | ProtocolVersion::V3 => Vec::new(),
    };

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf).map_err(ResultMetadataParseError::GlobalTableSpecParseError)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count, version)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn deser_rows(
    buf: &mut &[u8],
    rows_count: usize,
    col_specs: &[ColumnSpec],
    codec: &TypeCodec,
) -> StdResult<Vec<Row>, RowsParseError> {
    let mut rows = Vec::with_capacity(rows_count.min(buf.len()));
    for row in 0..rows_count {
        let mut columns = Vec::with_capacity(col_specs.len());
        for spec in col_specs {
            let value = codec.deserialize_cell(&spec.typ, buf).map_err(|err| {
                RowsParseError::ColumnDeserializationError {
                    row,
                    column_name: spec.name.clone(),
                    err,
                }
            })?;
            columns.push(value);
        }
        rows.push(Row { columns });
    }
    Ok(rows)
}

fn deser_rows_result(buf: &mut &[u8], codec: &TypeCodec) -> StdResult<Result, RowsParseError> {
    let metadata = deser_result_metadata(buf, codec.version())?;
    let rows_count = types::read_int_length(buf).map_err(RowsParseError::RowsCountParseError)?;

    // Without column specs the rows cannot be decoded yet.
    if metadata.col_specs.is_empty() && metadata.col_count > 0 {
        let raw_rows = Bytes::copy_from_slice(buf);
        *buf = &[];
        return Ok(Result::RawRows(RawRows {
            paging_state: metadata.paging_state,
            col_count: metadata.col_count,
            rows_count,
            raw_rows,
        }));
    }

    let rows = deser_rows(buf, rows_count, &metadata.col_specs, codec)?;
    Ok(Result::Rows(Rows {
        metadata,
        rows_count,
        rows,
    }))
}

fn deser_prepared(buf: &mut &[u8], version: ProtocolVersion) -> StdResult<Prepared, PreparedParseError> {
    let id = Bytes::copy_from_slice(
        types::read_short_bytes(buf).map_err(PreparedParseError::IdLengthParseError)?,
    );
    let prepared_metadata = deser_prepared_metadata(buf, version)
        .map_err(PreparedParseError::PreparedMetadataParseError)?;
    let result_metadata = match version {
        ProtocolVersion::V1 => ResultMetadata::default(),
        ProtocolVersion::V3 | ProtocolVersion::V4 => deser_result_metadata(buf, version)
            .map_err(PreparedParseError::ResultMetadataParseError)?,
    };
    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

/// Parses a RESULT body. Rows are decoded with `codec`, which also fixes the
/// protocol version of the body.
pub fn deserialize(
    buf: &mut &[u8],
    codec: &TypeCodec,
) -> StdResult<Result, CqlResultParseError> {
    use self::Result::*;
    Ok(
        match types::read_int(buf).map_err(CqlResultParseError::ResultIdParseError)? {
            0x0001 => Void,
            0x0002 => deser_rows_result(buf, codec)?,
            0x0003 => SetKeyspace(self::SetKeyspace {
                keyspace_name: types::read_string(buf)
                    .map_err(CqlResultParseError::SetKeyspaceParseError)?
                    .to_owned(),
            }),
            0x0004 => Prepared(deser_prepared(buf, codec.version())?),
            0x0005 => SchemaChange(self::SchemaChange {
                event: SchemaChangeEvent::deserialize(buf, codec.version())?,
            }),
            id => return Err(CqlResultParseError::UnknownResultId(id)),
        },
    )
}

fn write_metadata_columns(
    col_specs: &[ColumnSpec],
    buf: &mut Vec<u8>,
) -> StdResult<(), SerializationError> {
    for spec in col_specs {
        types::write_string(&spec.table_spec.ks_name, buf)?;
        types::write_string(&spec.table_spec.table_name, buf)?;
        types::write_string(&spec.name, buf)?;
        spec.typ.serialize(buf)?;
    }
    Ok(())
}

impl ResultMetadata {
    /// Writes the metadata without a global table spec. With `skip_columns`
    /// only the count is written and the no-metadata flag is set.
    pub fn serialize(
        &self,
        buf: &mut Vec<u8>,
        skip_columns: bool,
    ) -> StdResult<(), SerializationError> {
        let mut flags = 0;
        if self.paging_state.is_some() {
            flags |= FLAG_HAS_MORE_PAGES;
        }
        if skip_columns {
            flags |= FLAG_NO_METADATA;
        }
        types::write_int(flags, buf);
        types::write_int_length(self.col_count, buf)?;
        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }
        if !skip_columns {
            write_metadata_columns(&self.col_specs, buf)?;
        }
        Ok(())
    }
}

impl PreparedMetadata {
    pub fn serialize(
        &self,
        buf: &mut Vec<u8>,
        version: ProtocolVersion,
    ) -> StdResult<(), SerializationError> {
        types::write_int(0, buf);
        types::write_int_length(self.col_specs.len(), buf)?;
        if version == ProtocolVersion::V4 {
            types::write_int_length(self.pk_indexes.len(), buf)?;
            for index in &self.pk_indexes {
                types::write_short(*index, buf);
            }
        }
        write_metadata_columns(&self.col_specs, buf)
    }
}

impl Result {
    /// Encodes the result body as a server would.
    pub fn serialize(&self, buf: &mut Vec<u8>, codec: &TypeCodec) -> StdResult<(), SerializationError> {
        match self {
            Result::Void => types::write_int(0x0001, buf),
            Result::Rows(rows) => {
                types::write_int(0x0002, buf);
                rows.metadata.serialize(buf, false)?;
                types::write_int_length(rows.rows.len(), buf)?;
                for row in &rows.rows {
                    if row.columns.len() != rows.metadata.col_specs.len() {
                        return Err(SerializationError::ValueCountMismatch {
                            expected: rows.metadata.col_specs.len(),
                            received: row.columns.len(),
                        });
                    }
                    for (value, spec) in row.columns.iter().zip(&rows.metadata.col_specs) {
                        match value {
                            Some(value) => {
                                let mut cell = Vec::new();
                                codec.serialize_value(value, Some(&spec.typ), &mut cell)?;
                                types::write_bytes(&cell, buf)?;
                            }
                            None => types::write_int(-1, buf),
                        }
                    }
                }
            }
            Result::RawRows(raw) => {
                types::write_int(0x0002, buf);
                ResultMetadata {
                    col_count: raw.col_count,
                    paging_state: raw.paging_state.clone(),
                    col_specs: vec![],
                }
                .serialize(buf, true)?;
                types::write_int_length(raw.rows_count, buf)?;
                buf.extend_from_slice(&raw.raw_rows);
            }
            Result::SetKeyspace(set) => {
                types::write_int(0x0003, buf);
                types::write_string(&set.keyspace_name, buf)?;
            }
            Result::Prepared(prepared) => {
                types::write_int(0x0004, buf);
                types::write_short_bytes(&prepared.id, buf)?;
                prepared
                    .prepared_metadata
                    .serialize(buf, codec.version())?;
                if codec.version() != ProtocolVersion::V1 {
                    prepared.result_metadata.serialize(buf, false)?;
                }
            }
            Result::SchemaChange(change) => {
                types::write_int(0x0005, buf);
                change.event.serialize(buf, codec.version())?;
            }
        }
        Ok(())
    }
}
