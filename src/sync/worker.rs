//! Two-tier worker pool draining the sync queue

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::executor::SyncExecutor;
use super::health::HealthMonitor;
use super::queue::{ClaimFilter, SyncQueue};
use crate::config::WorkerPolicy;
use crate::types::SyncTask;

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;
const MAX_JITTER: f64 = 0.2;

/// Exponential backoff for the given attempt (1-based), capped
pub fn calculate_backoff(attempt: u32) -> Duration {
    let backoff_secs = INITIAL_BACKOFF_SECS
        .saturating_mul(2u64.pow(attempt.saturating_sub(1).min(8)))
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(backoff_secs)
}

/// Backoff plus up to 20% random jitter, still capped
pub fn retry_delay(attempt: u32) -> Duration {
    let base = calculate_backoff(attempt);
    let jitter = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
    base.mul_f64(1.0 + jitter)
        .min(Duration::from_secs(MAX_BACKOFF_SECS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTier {
    Realtime,
    Background,
}

impl WorkerTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerTier::Realtime => "realtime",
            WorkerTier::Background => "background",
        }
    }

    /// Realtime workers take everything when no background tier exists
    fn filter(&self, has_background: bool) -> ClaimFilter {
        match self {
            WorkerTier::Realtime if has_background => ClaimFilter::realtime(),
            _ => ClaimFilter::any(),
        }
    }
}

/// Worker counts reported by status
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkerCounts {
    pub realtime: usize,
    pub background: usize,
    /// Syncs running right now
    pub active: usize,
}

/// How a single task attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Synced,
    Retrying,
    Failed,
}

/// Counts a sync as active for as long as it is alive, including when the
/// worker running it is aborted mid-sync
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct WorkerContext {
    queue: Arc<SyncQueue>,
    executor: Arc<SyncExecutor>,
    health: Arc<HealthMonitor>,
    max_attempts: u32,
    active: AtomicUsize,
}

impl WorkerContext {
    /// Run one claimed task to completion and settle it with the queue
    async fn process(&self, task: SyncTask, tier: WorkerTier) -> TaskOutcome {
        let table = task.table_name.clone();
        let attempt = task.attempt_count + 1;
        let started_at = Utc::now();
        self.health.record_started(&table);
        tracing::debug!(
            table = %table,
            tier = tier.as_str(),
            attempt,
            priority = %task.priority,
            "sync_started"
        );

        let result = {
            let _active = ActiveGuard::enter(&self.active);
            self.executor.sync(&table).await
        };

        match result {
            Ok(result) => {
                self.queue.complete(&task);
                self.health.record_success(&result);
                TaskOutcome::Synced
            }
            Err(e) => {
                self.health.record_failure(&table, &e, started_at);
                if e.is_retryable() && !e.is_permanent() && attempt < self.max_attempts {
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        table = %table,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "sync_retry_scheduled"
                    );
                    self.queue.requeue(task, delay);
                    TaskOutcome::Retrying
                } else {
                    tracing::error!(
                        table = %table,
                        attempt,
                        permanent = e.is_permanent(),
                        error = %e,
                        "sync_task_failed"
                    );
                    self.queue.fail(&task);
                    TaskOutcome::Failed
                }
            }
        }
    }
}

async fn run_worker(
    ctx: Arc<WorkerContext>,
    tier: WorkerTier,
    filter: ClaimFilter,
    worker_id: usize,
    poll: Duration,
    batch_size: usize,
    cancel: CancellationToken,
) {
    tracing::debug!(tier = tier.as_str(), worker_id, "worker_started");

    loop {
        if cancel.is_cancelled() || ctx.queue.is_closed() {
            break;
        }

        let batch = ctx.queue.dequeue_batch(filter, batch_size);
        if batch.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => continue,
            }
        }

        let mut tasks = batch.into_iter();
        while let Some(task) = tasks.next() {
            if cancel.is_cancelled() {
                // not started; give the claims back
                ctx.queue.release(task);
                for rest in tasks.by_ref() {
                    ctx.queue.release(rest);
                }
                break;
            }
            ctx.process(task, tier).await;
        }
    }

    tracing::debug!(tier = tier.as_str(), worker_id, "worker_stopped");
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Realtime and background workers sharing one queue and executor
pub struct WorkerPool {
    policy: WorkerPolicy,
    ctx: Arc<WorkerContext>,
    running: Mutex<Option<Running>>,
}

impl WorkerPool {
    pub fn new(
        policy: &WorkerPolicy,
        queue: Arc<SyncQueue>,
        executor: Arc<SyncExecutor>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            policy: policy.clone(),
            ctx: Arc::new(WorkerContext {
                queue,
                executor,
                health,
                max_attempts: policy.max_attempts.max(1),
                active: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn every worker. No-op when already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let has_background = self.policy.background_workers > 0;
        if !has_background {
            tracing::info!("no background workers; realtime workers take all priorities");
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(self.policy.total_workers());
        for worker_id in 0..self.policy.realtime_workers {
            handles.push(tokio::spawn(run_worker(
                Arc::clone(&self.ctx),
                WorkerTier::Realtime,
                WorkerTier::Realtime.filter(has_background),
                worker_id,
                self.policy.realtime_poll(),
                1,
                cancel.clone(),
            )));
        }
        for worker_id in 0..self.policy.background_workers {
            handles.push(tokio::spawn(run_worker(
                Arc::clone(&self.ctx),
                WorkerTier::Background,
                WorkerTier::Background.filter(has_background),
                worker_id,
                self.policy.background_poll(),
                self.policy.background_batch_size.max(1),
                cancel.clone(),
            )));
        }

        tracing::info!(
            realtime = self.policy.realtime_workers,
            background = self.policy.background_workers,
            "worker_pool_started"
        );
        *running = Some(Running { cancel, handles });
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop claiming work and wait up to `grace` for in-flight syncs.
    /// Workers still busy after that are aborted. Returns false if any were.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let Some(running) = self.running.lock().take() else {
            return true;
        };
        running.cancel.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        let mut clean = true;
        for mut handle in running.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "worker_join_failed");
                }
                Err(_) => {
                    handle.abort();
                    // resolves once the aborted task has been dropped
                    let _ = handle.await;
                    clean = false;
                }
            }
        }

        if clean {
            tracing::info!("worker_pool_stopped");
        } else {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "worker_pool_aborted_after_grace");
        }
        clean
    }

    pub fn counts(&self) -> WorkerCounts {
        WorkerCounts {
            realtime: self.policy.realtime_workers,
            background: self.policy.background_workers,
            active: self.ctx.active.load(Ordering::SeqCst),
        }
    }
}
