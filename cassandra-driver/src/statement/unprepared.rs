use bytes::Bytes;

use super::{impl_statement_config_accessors, StatementConfig};

/// **Unprepared** CQL statement.
///
/// Sent as a QUERY request, with its text parsed by the server every time.
/// Use a [`PreparedStatement`](super::prepared::PreparedStatement) for
/// statements executed many times.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) config: StatementConfig,

    pub contents: String,
}

impl Statement {
    /// Creates a new [`Statement`] from a CQL statement string.
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            config: Default::default(),
        }
    }

    /// Returns self with page size set to the given value.
    ///
    /// Panics if given number is nonpositive.
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.set_page_size(page_size);
        self
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
}

impl_statement_config_accessors!(Statement);

impl From<String> for Statement {
    fn from(s: String) -> Statement {
        Statement::new(s)
    }
}

impl<'a> From<&'a str> for Statement {
    fn from(s: &'a str) -> Statement {
        Statement::new(s.to_owned())
    }
}
