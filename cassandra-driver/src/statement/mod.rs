//! Statements the driver can execute: simple [`Statement`]s, prepared
//! statements and batches, together with their per-statement options.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use cassandra_cql::frame::request::SerializedValues;
use cassandra_cql::frame::response::result::ColumnSpec;
use cassandra_cql::frame::value_codec::TypeCodec;
use cassandra_cql::value::BoundValue;

use crate::errors::ClientError;

pub mod batch;
pub mod prepared;
pub mod unprepared;

pub use cassandra_cql::{Consistency, SerialConsistency};

/// Options that can be set on any statement. Unset options fall back to the
/// session's [`ExecutionConfig`](crate::client::execution::ExecutionConfig).
#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<SerialConsistency>,

    pub(crate) page_size: Option<i32>,
    pub(crate) paging_state: Option<Bytes>,

    pub(crate) is_idempotent: Option<bool>,

    pub(crate) tracing: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) custom_payload: Option<HashMap<String, Bytes>>,
}

impl StatementConfig {
    /// Determines the consistency of a query
    #[must_use]
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}

// Generates the option accessors shared by all statement kinds.
macro_rules! impl_statement_config_accessors {
    ($t:ty) => {
        impl $t {
            /// Sets the consistency to be used when executing this statement.
            pub fn set_consistency(&mut self, c: $crate::statement::Consistency) {
                self.config.consistency = Some(c);
            }

            /// Gets the consistency to be used when executing this statement if it is filled.
            /// If this is empty, the default session's consistency will be used.
            pub fn get_consistency(&self) -> Option<$crate::statement::Consistency> {
                self.config.consistency
            }

            /// Sets the serial consistency to be used when executing this statement.
            /// Ignored unless the statement is a lightweight transaction.
            pub fn set_serial_consistency(
                &mut self,
                sc: Option<$crate::statement::SerialConsistency>,
            ) {
                self.config.serial_consistency = sc;
            }

            pub fn get_serial_consistency(&self) -> Option<$crate::statement::SerialConsistency> {
                self.config.serial_consistency
            }

            /// Sets the idempotence of this statement.
            /// Only idempotent statements are tried on another host after a timeout.
            pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
                self.config.is_idempotent = Some(is_idempotent);
            }

            /// Gets the idempotence of this statement, if it was set explicitly.
            pub fn get_is_idempotent(&self) -> Option<bool> {
                self.config.is_idempotent
            }

            /// Enable or disable CQL Tracing for this statement.
            pub fn set_tracing(&mut self, should_trace: bool) {
                self.config.tracing = should_trace;
            }

            pub fn get_tracing(&self) -> bool {
                self.config.tracing
            }

            /// Sets the default timestamp for this statement in microseconds.
            /// If not None, it will replace the server side assigned timestamp as default timestamp.
            pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
                self.config.timestamp = timestamp
            }

            pub fn get_timestamp(&self) -> Option<i64> {
                self.config.timestamp
            }

            /// Sets the client-side timeout for this statement.
            /// If not None, the driver will stop waiting for the request
            /// to finish after `timeout` passed.
            /// Otherwise, default session client timeout will be applied.
            pub fn set_request_timeout(&mut self, timeout: Option<std::time::Duration>) {
                self.config.request_timeout = timeout
            }

            pub fn get_request_timeout(&self) -> Option<std::time::Duration> {
                self.config.request_timeout
            }

            /// Sets a custom payload sent with the request (protocol v4).
            pub fn set_custom_payload(
                &mut self,
                custom_payload: Option<std::collections::HashMap<String, bytes::Bytes>>,
            ) {
                self.config.custom_payload = custom_payload;
            }

            pub fn get_custom_payload(
                &self,
            ) -> Option<&std::collections::HashMap<String, bytes::Bytes>> {
                self.config.custom_payload.as_ref()
            }
        }
    };
}
pub(crate) use impl_statement_config_accessors;

/// Values bound to the markers of a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Values {
    #[default]
    Empty,
    Positional(Vec<BoundValue>),
    /// Only simple statements can use named values, from protocol v3.
    Named(Vec<(String, BoundValue)>),
}

impl Values {
    pub fn is_empty(&self) -> bool {
        match self {
            Values::Empty => true,
            Values::Positional(values) => values.is_empty(),
            Values::Named(values) => values.is_empty(),
        }
    }

    /// Serializes the values, checking them against `col_specs` when the
    /// statement is prepared.
    pub(crate) fn serialize(
        &self,
        codec: &TypeCodec,
        col_specs: Option<&[ColumnSpec]>,
    ) -> Result<SerializedValues, ClientError> {
        let mut serialized = SerializedValues::new();
        let typ = |i: usize| col_specs.and_then(|specs| specs.get(i)).map(|spec| &spec.typ);
        match self {
            Values::Empty => {}
            Values::Positional(values) => {
                if let Some(col_specs) = col_specs {
                    if col_specs.len() != values.len() {
                        return Err(ClientError::ValueCountMismatch {
                            expected: col_specs.len(),
                            received: values.len(),
                        });
                    }
                }
                for (i, value) in values.iter().enumerate() {
                    serialized
                        .add_value(codec, value, typ(i))
                        .map_err(ClientError::Values)?;
                }
            }
            Values::Named(values) => {
                for (name, value) in values {
                    let typ = col_specs
                        .and_then(|specs| specs.iter().find(|spec| &spec.name == name))
                        .map(|spec| &spec.typ);
                    serialized
                        .add_named_value(codec, name, value, typ)
                        .map_err(ClientError::Values)?;
                }
            }
        }
        Ok(serialized)
    }
}

impl From<Vec<BoundValue>> for Values {
    fn from(values: Vec<BoundValue>) -> Self {
        Values::Positional(values)
    }
}

impl From<Vec<cassandra_cql::CqlValue>> for Values {
    fn from(values: Vec<cassandra_cql::CqlValue>) -> Self {
        Values::Positional(values.into_iter().map(BoundValue::Set).collect())
    }
}
