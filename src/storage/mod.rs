//! Job-record store
//!
//! SQLite schema, connection handling, job record writes and the
//! [`RowSource`] read interface the sync subsystem consumes.

mod connection;
mod migrations;
pub mod queries;
mod source;

pub use connection::{Storage, StorageMode, StoreConfig};
pub use migrations::SCHEMA_VERSION;
pub use source::RowSource;
