//! Results of executed statements.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use cassandra_cql::frame::response::event::SchemaChangeEvent;
use cassandra_cql::frame::response::result::{ColumnSpec, Rows};
use cassandra_cql::frame::response::{NonErrorResponse, Response};
use cassandra_cql::value::Row;
use cassandra_cql::Consistency;
use uuid::Uuid;

use crate::errors::RequestAttemptError;
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;
use crate::statement::Values;

/// A response received from the server, with its frame extensions.
#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
    pub(crate) custom_payload: Option<HashMap<String, Bytes>>,
}

// A QueryResponse in which response can not be Response::Error
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
    pub(crate) custom_payload: Option<HashMap<String, Bytes>>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_response(self) -> Result<NonErrorResponse, RequestAttemptError> {
        Ok(self.response.into_non_error_response()?)
    }

    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        Ok(NonErrorQueryResponse {
            response: self.response.into_non_error_response()?,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
            custom_payload: self.custom_payload,
        })
    }
}

/// How a logical operation was carried out.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct ExecutionInfo {
    /// Hosts the request was sent to, in order. The last one produced the result.
    pub hosts: Vec<SocketAddr>,
    /// Number of times the request was sent again after a failed attempt.
    pub retries: usize,
    /// Consistency of the attempt that produced the result.
    pub consistency: Consistency,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: Option<HashMap<String, Bytes>>,
    /// Set after schema changes: whether all live hosts agreed on the
    /// schema version before the result was returned.
    pub schema_in_agreement: Option<bool>,
}

impl ExecutionInfo {
    pub(crate) fn new(consistency: Consistency) -> Self {
        Self {
            hosts: Vec::new(),
            retries: 0,
            consistency,
            tracing_id: None,
            warnings: Vec::new(),
            custom_payload: None,
            schema_in_agreement: None,
        }
    }
}

/// The statement a page came from, kept to request the following pages.
#[derive(Debug, Clone)]
pub(crate) enum PagingOrigin {
    Statement(Statement, Values),
    Prepared(PreparedStatement, Values),
}

impl PagingOrigin {
    pub(crate) fn with_paging_state(&self, paging_state: Bytes) -> PagingOrigin {
        match self {
            PagingOrigin::Statement(statement, values) => {
                let mut statement = statement.clone();
                statement.set_paging_state(Some(paging_state));
                PagingOrigin::Statement(statement, values.clone())
            }
            PagingOrigin::Prepared(prepared, values) => {
                let mut prepared = prepared.clone();
                prepared.set_paging_state(Some(paging_state));
                PagingOrigin::Prepared(prepared, values.clone())
            }
        }
    }
}

/// Result of a single logical operation: rows (one page of them) for
/// SELECTs, the schema change for DDL, and nothing for other statements.
#[derive(Debug, Clone)]
pub struct QueryResult {
    rows: Option<Rows>,
    schema_change: Option<SchemaChangeEvent>,
    info: ExecutionInfo,
    pub(crate) paging: Option<PagingOrigin>,
}

impl QueryResult {
    pub(crate) fn new(
        rows: Option<Rows>,
        schema_change: Option<SchemaChangeEvent>,
        info: ExecutionInfo,
    ) -> Self {
        Self {
            rows,
            schema_change,
            info,
            paging: None,
        }
    }

    pub(crate) fn void(info: ExecutionInfo) -> Self {
        Self::new(None, None, info)
    }

    /// Returns `true` if the result carries rows, even if there are zero of them.
    pub fn is_rows(&self) -> bool {
        self.rows.is_some()
    }

    /// Rows of this page. Empty for results without rows.
    pub fn rows(&self) -> &[Row] {
        self.rows.as_ref().map_or(&[], |rows| &rows.rows)
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        self.rows.map(|rows| rows.rows)
    }

    /// Columns of the returned rows.
    pub fn col_specs(&self) -> &[ColumnSpec] {
        self.rows
            .as_ref()
            .map_or(&[], |rows| &rows.metadata.col_specs)
    }

    /// Token to continue reading from, if the server has more pages.
    pub fn paging_state(&self) -> Option<&Bytes> {
        self.rows
            .as_ref()
            .and_then(|rows| rows.metadata.paging_state.as_ref())
    }

    pub fn has_more_pages(&self) -> bool {
        self.paging_state().is_some()
    }

    pub fn schema_change(&self) -> Option<&SchemaChangeEvent> {
        self.schema_change.as_ref()
    }

    pub fn info(&self) -> &ExecutionInfo {
        &self.info
    }

    /// The statement with the paging state set to fetch the next page.
    pub(crate) fn next_page_origin(&self) -> Option<PagingOrigin> {
        let paging_state = self.paging_state()?.clone();
        self.paging
            .as_ref()
            .map(|origin| origin.with_paging_state(paging_state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassandra_cql::frame::response::result::ResultMetadata;
    use cassandra_cql::CqlValue;

    fn page(paging_state: Option<Bytes>) -> QueryResult {
        let rows = Rows {
            metadata: ResultMetadata {
                col_count: 1,
                paging_state,
                col_specs: vec![],
            },
            rows_count: 1,
            rows: vec![Row {
                columns: vec![Some(CqlValue::Int(7))],
            }],
        };
        QueryResult::new(Some(rows), None, ExecutionInfo::new(Consistency::One))
    }

    #[test]
    fn next_page_carries_paging_state() {
        let mut result = page(Some(Bytes::from_static(b"state")));
        result.paging = Some(PagingOrigin::Statement(
            Statement::new("SELECT a FROM ks.t"),
            Values::Empty,
        ));

        assert!(result.has_more_pages());
        assert_eq!(result.rows().len(), 1);
        match result.next_page_origin() {
            Some(PagingOrigin::Statement(statement, _)) => {
                assert_eq!(statement.get_paging_state().unwrap().as_ref(), b"state")
            }
            other => panic!("unexpected origin: {:?}", other),
        }
    }

    #[test]
    fn last_page_has_no_continuation() {
        let mut result = page(None);
        result.paging = Some(PagingOrigin::Statement(
            Statement::new("SELECT a FROM ks.t"),
            Values::Empty,
        ));
        assert!(!result.has_more_pages());
        assert!(result.next_page_origin().is_none());

        let void = QueryResult::void(ExecutionInfo::new(Consistency::Quorum));
        assert!(!void.is_rows());
        assert!(void.rows().is_empty());
        assert!(void.col_specs().is_empty());
    }
}
