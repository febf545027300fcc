//! The entry point of the driver: [`Session`](session::Session), and the
//! execution pipeline it runs requests through.

pub mod execution;

pub mod session;

pub use cassandra_cql::frame::Compression;
