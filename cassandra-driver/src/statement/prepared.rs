use bytes::Bytes;
use std::sync::Arc;

use cassandra_cql::frame::response::result::{ColumnSpec, PreparedMetadata, ResultMetadata};

use super::{impl_statement_config_accessors, StatementConfig};

/// Represents a statement prepared on the server.
///
/// The server identifies it by an id derived from its text, so the same id is
/// valid on every host that has prepared the text. Hosts that have not are
/// sent a PREPARE transparently before the first EXECUTE.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) config: StatementConfig,

    id: Bytes,
    shared: Arc<PreparedStatementSharedData>,
}

#[derive(Debug)]
struct PreparedStatementSharedData {
    statement: String,
    prepared_metadata: PreparedMetadata,
    result_metadata: ResultMetadata,
}

impl PreparedStatement {
    pub(crate) fn new(
        id: Bytes,
        statement: String,
        prepared_metadata: PreparedMetadata,
        result_metadata: ResultMetadata,
        config: StatementConfig,
    ) -> Self {
        Self {
            id,
            shared: Arc::new(PreparedStatementSharedData {
                statement,
                prepared_metadata,
                result_metadata,
            }),
            config,
        }
    }

    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    pub fn get_statement(&self) -> &str {
        &self.shared.statement
    }

    /// Sets the page size for this CQL statement.
    ///
    /// Panics if given number is nonpositive.
    pub fn set_page_size(&mut self, page_size: i32) {
        assert!(page_size > 0, "page size must be larger than 0");
        self.config.page_size = Some(page_size);
    }

    /// Clears the page size of this statement, so that the session's default applies.
    pub fn unset_page_size(&mut self) {
        self.config.page_size = None;
    }

    /// Returns the page size for this CQL statement.
    pub fn get_page_size(&self) -> Option<i32> {
        self.config.page_size
    }

    /// Continues paging from a state returned with an earlier page.
    pub fn set_paging_state(&mut self, paging_state: Option<Bytes>) {
        self.config.paging_state = paging_state;
    }

    pub fn get_paging_state(&self) -> Option<&Bytes> {
        self.config.paging_state.as_ref()
    }

    /// Access metadata about the bind variables of this statement.
    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.shared.prepared_metadata
    }

    /// Columns of the bind markers, in order.
    pub fn get_variable_col_specs(&self) -> &[ColumnSpec] {
        &self.shared.prepared_metadata.col_specs
    }

    /// Indexes of the partition key columns among the bind markers.
    /// Empty before protocol v4, which is the first to send them.
    pub fn get_variable_pk_indexes(&self) -> &[u16] {
        &self.shared.prepared_metadata.pk_indexes
    }

    /// Metadata of the rows this statement returns. Rows sent without
    /// metadata are decoded against it.
    pub fn get_result_metadata(&self) -> &ResultMetadata {
        &self.shared.result_metadata
    }

    /// Skipping result metadata is only safe when the server told us
    /// what the result columns are.
    pub(crate) fn can_skip_metadata(&self) -> bool {
        !self.shared.result_metadata.col_specs.is_empty()
    }
}

impl_statement_config_accessors!(PreparedStatement);
