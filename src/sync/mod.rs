//! Change capture and remote mirror sync
//!
//! Change sources feed a debouncer, which admits work into a bounded
//! priority queue. Realtime and background workers drain the queue and run
//! the executor, whose remote calls are all metered by one rate limiter.
//!
//! # Feature Flags
//!
//! Filesystem notifications need the `watcher` feature; checksum polling is
//! always available.

mod detector;
mod executor;
mod health;
mod polling;
mod queue;
mod rate_limit;
mod service;
#[cfg(feature = "watcher")]
mod watch;
mod worker;

pub use detector::{ChangeDetector, ChangeSource, DetectedChange, Debouncer};
pub use executor::{serialize_rows, SyncExecutor};
pub use health::{HealthMonitor, SyncEvent, SyncEventType};
pub use polling::{checksum, PollingChangeSource, TableSnapshot};
pub use queue::{Admission, ClaimFilter, CompletedEntry, QueueStats, SyncQueue};
pub use rate_limit::{Budget, RateLimiter};
pub use service::{SyncService, SyncStatus};
#[cfg(feature = "watcher")]
pub use watch::NotifyChangeSource;
pub use worker::{calculate_backoff, retry_delay, WorkerCounts, WorkerPool, WorkerTier};
