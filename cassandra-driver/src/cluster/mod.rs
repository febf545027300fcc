//! The cluster as the driver sees it: the hosts it is made of, and the
//! control connection that discovers them and follows their changes.
//!
//! - [Registry] holds the known [Host]s and tells [HostListener](crate::policies::host_listener::HostListener)s
//!   when one is found, lost, goes up or down.
//! - The control connection fills the registry from the system tables and
//!   turns server events into registry updates and schema refreshes.

pub(crate) mod control_connection;
pub use control_connection::{ControlConnectionConfig, SchemaListener, SchemaTable};

mod host;
pub use host::{Host, HostInfo, HostState};

mod registry;
pub use registry::Registry;

mod schema_events;
pub use schema_events::SchemaRefresh;
