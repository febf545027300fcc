//! Async Rust driver core for [Apache Cassandra®](https://cassandra.apache.org/)
//! and other databases speaking the CQL binary protocol (versions 1, 3 and 4).
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Session].\
//! `Session` is created from a few known nodes, which are used to discover
//! the rest of the cluster:
//!
//! ```rust,no_run
//! use cassandra_driver::{Session, SessionConfig};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let mut config = SessionConfig::new();
//!     config.add_known_node("127.0.0.1:9042");
//!     config.add_known_node("1.2.3.4:9876");
//!
//!     let session: Session = Session::connect(config).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Making queries
//! The driver supports simple statements, prepared statements and batches:
//! * [Simple](crate::Session::query)
//! * [Prepared](crate::Session::execute) (need to be [prepared](crate::Session::prepare) before use)
//! * [Batch](crate::Session::batch)
//!
//! Results come one page at a time; [`Session::next_page`] fetches the next one.
//!
//! ```rust
//! # use cassandra_driver::{CqlValue, Session, Values};
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! session
//!     .query(
//!         "INSERT INTO ks.tab (a, b) VALUES (?, ?)",
//!         vec![CqlValue::Int(2), CqlValue::Text("some text".to_owned())],
//!     )
//!     .await?;
//!
//! let mut page = Some(session.query("SELECT a, b FROM ks.tab", Values::Empty).await?);
//! while let Some(current) = page {
//!     for row in current.rows() {
//!         println!("{:?}", row.columns);
//!     }
//!     page = session.next_page(&current).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Configuration
//! Hosts are chosen by a [load balancing policy](crate::policies::load_balancing),
//! failed requests are handled by a [retry policy](crate::policies::retry), and
//! hosts that went down are reconnected to on a
//! [reconnection schedule](crate::policies::reconnection). All of them, together
//! with connection and pool settings, are part of [`SessionConfig`].

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod frame {
    pub use cassandra_cql::frame::{frame_errors, Compression};

    pub mod types {
        pub use cassandra_cql::frame::types::{Consistency, SerialConsistency};
    }

    pub mod response {
        pub mod result {
            pub use cassandra_cql::frame::response::result::{
                ColumnSpec, ColumnType, PreparedMetadata, ResultMetadata, Rows, TableSpec,
            };
        }

        pub mod event {
            pub use cassandra_cql::frame::response::event::{SchemaChangeEvent, SchemaChangeType};
        }
    }
}

/// CQL values, as bound to statements and read from rows.
pub mod value {
    pub use cassandra_cql::value::{BoundValue, CqlValue, Row};
}

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;
pub mod response;
pub mod statement;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cassandra_cql::{Consistency, CqlValue, ProtocolVersion, SerialConsistency};

pub use client::execution::ExecutionConfig;
pub use client::session::{Session, SessionConfig};
pub use response::{ExecutionInfo, QueryResult};
pub use statement::batch::{Batch, BatchStatement};
pub use statement::prepared::PreparedStatement;
pub use statement::unprepared::Statement;
pub use statement::Values;
