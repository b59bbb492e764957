//! Jobmirror - job record mirroring
//!
//! Watches a local store of training job records and keeps a remote
//! spreadsheet mirror in step with it: change detection, a coalescing
//! priority queue, rate-limited workers and idempotent full-sheet writes.

pub mod config;
pub mod error;
pub mod remote;
pub mod server;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::SyncConfig;
pub use error::{MirrorError, Result};
pub use storage::Storage;
pub use sync::SyncService;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
