use super::prepared::PreparedStatement;
use super::unprepared::Statement;
use super::{impl_statement_config_accessors, StatementConfig};

pub use cassandra_cql::frame::request::batch::BatchType;

/// CQL batch statement.
///
/// This represents a CQL batch that can be executed on a server.
/// Batches need protocol v3 or newer.
#[derive(Debug, Clone)]
pub struct Batch {
    pub(crate) config: StatementConfig,

    pub statements: Vec<BatchStatement>,
    batch_type: BatchType,
}

impl Batch {
    /// Creates a new, empty `Batch` of `batch_type` type.
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            statements: Vec::new(),
            config: StatementConfig::default(),
        }
    }

    /// Creates a new, empty `Batch` of `batch_type` type with the provided statements.
    pub fn new_with_statements(batch_type: BatchType, statements: Vec<BatchStatement>) -> Self {
        Self {
            batch_type,
            statements,
            config: StatementConfig::default(),
        }
    }

    /// Appends a new statement to the batch.
    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }

    /// Gets type of batch.
    pub fn get_type(&self) -> BatchType {
        self.batch_type
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new(BatchType::Logged)
    }
}

impl_statement_config_accessors!(Batch);

/// This enum represents a CQL statement, that can be part of batch.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum BatchStatement {
    /// A simple (unprepared) statement.
    Query(Statement),
    /// A prepared statement.
    PreparedStatement(PreparedStatement),
}

impl BatchStatement {
    pub(crate) fn contents(&self) -> &str {
        match self {
            BatchStatement::Query(statement) => &statement.contents,
            BatchStatement::PreparedStatement(prepared) => prepared.get_statement(),
        }
    }
}

impl From<&str> for BatchStatement {
    fn from(s: &str) -> Self {
        BatchStatement::Query(Statement::from(s))
    }
}

impl From<Statement> for BatchStatement {
    fn from(q: Statement) -> Self {
        BatchStatement::Query(q)
    }
}

impl From<PreparedStatement> for BatchStatement {
    fn from(p: PreparedStatement) -> Self {
        BatchStatement::PreparedStatement(p)
    }
}
