//! Supervised sync service
//!
//! Wires the detector, queue, workers and executor together and exposes the
//! operational entry points: start/stop, force full sync and status.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::detector::{ChangeDetector, ChangeSource};
use super::executor::SyncExecutor;
use super::health::{HealthMonitor, SyncEvent};
use super::queue::{QueueStats, SyncQueue};
use super::rate_limit::RateLimiter;
use super::worker::{WorkerCounts, WorkerPool};
use crate::config::SyncConfig;
use crate::error::{MirrorError, Result};
use crate::remote::RemoteMirror;
use crate::storage::RowSource;
use crate::types::{HealthState, SyncResult, TableHealth};

/// Snapshot returned by the status query
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub running: bool,
    pub healthy: bool,
    pub target_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub health: HealthState,
    pub tables: BTreeMap<String, TableHealth>,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub queue_capacity: usize,
    pub queue_stats: QueueStats,
    pub workers: WorkerCounts,
    /// Remote calls admitted by the rate limiter since startup
    pub remote_calls: u64,
    pub last_result: Option<SyncResult>,
}

struct Cleanup {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SyncService {
    config: Arc<SyncConfig>,
    queue: Arc<SyncQueue>,
    limiter: Arc<RateLimiter>,
    executor: Arc<SyncExecutor>,
    health: Arc<HealthMonitor>,
    detector: ChangeDetector,
    workers: WorkerPool,
    cleanup: Mutex<Option<Cleanup>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncService {
    /// Build the service. Fails if the configuration does not validate.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn RowSource>,
        mirror: Arc<dyn RemoteMirror>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let queue = Arc::new(SyncQueue::new(&config.queue));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let executor = Arc::new(SyncExecutor::new(
            &config,
            Arc::clone(&store),
            mirror,
            Arc::clone(&limiter),
        ));
        let health = Arc::new(HealthMonitor::new(&config.monitoring));
        for table in config.enabled_tables() {
            health.register_table(&table);
        }
        let detector = ChangeDetector::new(Arc::clone(&config), store, Arc::clone(&queue));
        let workers = WorkerPool::new(
            &config.workers,
            Arc::clone(&queue),
            Arc::clone(&executor),
            Arc::clone(&health),
        );

        Ok(Self {
            config,
            queue,
            limiter,
            executor,
            health,
            detector,
            workers,
            cleanup: Mutex::new(None),
            started_at: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn is_running(&self) -> bool {
        self.started_at.lock().is_some()
    }

    /// Start detection, workers and queue cleanup. No-op when running.
    pub fn start(&self) -> Result<()> {
        self.start_inner(None)
    }

    /// Start with explicit change sources instead of the configured ones
    pub fn start_with_sources(&self, sources: Vec<Box<dyn ChangeSource>>) -> Result<()> {
        self.start_inner(Some(sources))
    }

    fn start_inner(&self, sources: Option<Vec<Box<dyn ChangeSource>>>) -> Result<()> {
        if !self.config.enabled {
            return Err(MirrorError::Config("sync is disabled in configuration".into()));
        }
        let mut started_at = self.started_at.lock();
        if started_at.is_some() {
            return Ok(());
        }

        self.queue.reopen();
        self.workers.start();
        match sources {
            Some(sources) => self.detector.start_with(sources)?,
            None => self.detector.start()?,
        }
        *self.cleanup.lock() = Some(self.spawn_cleanup());

        *started_at = Some(Utc::now());
        tracing::info!(
            target_id = %self.config.target.target_id,
            tables = ?self.config.enabled_tables(),
            "sync_service_started"
        );
        Ok(())
    }

    fn spawn_cleanup(&self) -> Cleanup {
        let cancel = CancellationToken::new();
        let queue = Arc::clone(&self.queue);
        let every = self.config.queue.cleanup_interval();
        let max_age = self.config.queue.max_completed_age();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = queue.cleanup(max_age);
                        if removed > 0 {
                            tracing::debug!(removed, "queue_cleanup");
                        }
                    }
                }
            }
        });
        Cleanup { cancel, handle }
    }

    /// Stop detection first, then let workers drain within the grace
    /// period. Pending tasks are dropped; the next detection cycle after a
    /// restart regenerates them.
    pub async fn stop(&self) {
        if self.started_at.lock().take().is_none() {
            return;
        }

        self.detector.stop().await;
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            cleanup.cancel.cancel();
            let _ = cleanup.handle.await;
        }
        self.workers.shutdown(self.config.workers.shutdown_grace()).await;
        let dropped = self.queue.close();
        tracing::info!(dropped_pending = dropped, "sync_service_stopped");
    }

    /// Sync every enabled table now, bypassing queue and debounce
    pub async fn force_full_sync(&self) -> SyncResult {
        let started_at = Utc::now();
        let tables = self.config.enabled_tables();
        tracing::info!(tables = tables.len(), "force_full_sync");

        let outcomes = join_all(tables.iter().map(|table| async move {
            self.health.record_started(table);
            (table.clone(), self.executor.sync_table(table).await)
        }))
        .await;

        let mut counts = BTreeMap::new();
        let mut failures = BTreeMap::new();
        let mut errors = Vec::new();
        for (table, outcome) in outcomes {
            match outcome {
                Ok(rows) => {
                    counts.insert(table, rows);
                }
                Err(e) => {
                    failures.insert(table.clone(), e.to_string());
                    errors.push((table, e));
                }
            }
        }

        let result = SyncResult::from_outcomes(started_at, counts, failures);
        self.health.record_run(&result, &errors);
        if result.success {
            tracing::info!(message = %result.message, "force_full_sync_completed");
        } else {
            tracing::warn!(message = %result.message, "force_full_sync_partial");
        }
        result
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            enabled: self.config.enabled,
            running: self.is_running(),
            healthy: self.health.is_healthy(),
            target_id: self.config.target.target_id.clone(),
            started_at: *self.started_at.lock(),
            health: self.health.state(),
            tables: self.health.tables(),
            queue_depth: self.queue.len(),
            in_flight: self.queue.in_flight(),
            queue_capacity: self.queue.max_size(),
            queue_stats: self.queue.stats(),
            workers: self.workers.counts(),
            remote_calls: self.limiter.admitted(),
            last_result: self.health.history().pop(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.health.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;
    use crate::remote::MemoryMirror;
    use crate::storage::queries::{insert_variation, NewVariation};
    use crate::storage::Storage;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.enabled = true;
        config.target.target_id = "target-1".to_string();
        config.auth.credentials_path = Some("/etc/jobmirror/client_secret.json".to_string());
        config
    }

    fn service(mirror: &Arc<MemoryMirror>) -> (SyncService, Storage) {
        let storage = Storage::open_in_memory().unwrap();
        let service = SyncService::new(config(), Arc::new(storage.clone()), mirror.clone()).unwrap();
        (service, storage)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.target.target_id.clear();
        let storage = Storage::open_in_memory().unwrap();
        let mirror = Arc::new(MemoryMirror::new());
        assert!(matches!(
            SyncService::new(config, Arc::new(storage), mirror),
            Err(MirrorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_force_full_sync_counts_rows() {
        let mirror = Arc::new(MemoryMirror::with_target("target-1"));
        let (service, storage) = service(&mirror);
        storage
            .with_connection(|conn| {
                for i in 0..3 {
                    insert_variation(
                        conn,
                        &NewVariation {
                            id: format!("var-{}", i),
                            execution_id: None,
                            name: format!("lr-{}", i),
                            parameters: serde_json::json!({ "lr": 0.001 * (i + 1) as f64 }),
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let result = service.force_full_sync().await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.synced_counts_by_table["variations"], 3);
        assert_eq!(result.synced_counts_by_table["executions"], 0);

        let status = service.status();
        assert!(status.healthy);
        assert_eq!(status.queue_depth, 0);
        assert!(status.remote_calls >= 4);
        assert!(status.last_result.is_some());
    }

    #[tokio::test]
    async fn test_force_sync_reports_failed_table() {
        let mirror = Arc::new(MemoryMirror::with_target("target-1"));
        mirror.fail_always(Some("Executions"), RemoteErrorKind::Permission);
        let (service, _storage) = service(&mirror);

        let result = service.force_full_sync().await;
        assert!(!result.success);
        assert!(result.failed_tables.contains_key("executions"));
        assert_eq!(result.synced_counts_by_table["variations"], 0);

        let status = service.status();
        assert!(!status.healthy);
        assert!(status.tables["executions"].permanent_failure);
        assert!(status.tables["variations"].healthy);
        assert_eq!(status.health.consecutive_failures, 1);
        assert!(status.health.last_success_at.is_none());

        let last = status.last_result.unwrap();
        assert!(!last.success);
        assert!(last.failed_tables.contains_key("executions"));
        assert_eq!(last.synced_counts_by_table["variations"], 0);
        assert_eq!(service.health().history().len(), 1);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let mirror = Arc::new(MemoryMirror::with_target("target-1"));
        let (service, _storage) = service(&mirror);

        service.start_with_sources(Vec::new()).unwrap();
        service.start_with_sources(Vec::new()).unwrap();
        assert!(service.status().running);

        service.stop().await;
        service.stop().await;
        assert!(!service.status().running);
        assert!(service.queue().is_closed());

        // restart after stop
        service.start_with_sources(Vec::new()).unwrap();
        assert!(!service.queue().is_closed());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_service_does_not_start() {
        let mut config = config();
        config.enabled = false;
        let storage = Storage::open_in_memory().unwrap();
        let mirror = Arc::new(MemoryMirror::with_target("target-1"));
        let service = SyncService::new(config, Arc::new(storage), mirror).unwrap();
        assert!(service.start().is_err());
        assert!(!service.is_running());
    }
}
