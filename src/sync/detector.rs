//! Change detection
//!
//! Change sources (filesystem notifications, checksum polling) fan in over one
//! channel into the [`Debouncer`], which turns them into queue admissions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::polling::PollingChangeSource;
use super::queue::{Admission, SyncQueue};
use crate::config::{SyncConfig, TableSyncPolicy};
use crate::error::Result;
use crate::storage::RowSource;
use crate::types::{ChangeEvent, Priority};

const CHANNEL_CAPACITY: usize = 256;
const FLUSH_TICK: Duration = Duration::from_millis(250);

/// A change event plus an optional acknowledgement. The debouncer answers
/// `true` once the change is enqueued or held as pending, `false` if it
/// could not be admitted.
#[derive(Debug)]
pub struct DetectedChange {
    pub event: ChangeEvent,
    pub ack: Option<oneshot::Sender<bool>>,
}

impl DetectedChange {
    pub fn new(event: ChangeEvent) -> Self {
        Self { event, ack: None }
    }

    pub fn with_ack(event: ChangeEvent) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                event,
                ack: Some(tx),
            },
            rx,
        )
    }
}

/// Something that notices local store mutation
#[async_trait]
pub trait ChangeSource: Send {
    fn name(&self) -> &'static str;

    /// Emit changes into `sink` until cancelled
    async fn run(&mut self, sink: mpsc::Sender<DetectedChange>, cancel: CancellationToken);
}

#[derive(Debug, Default)]
struct DebounceState {
    /// When the oldest held change arrived
    since: Option<Instant>,
    pending: Option<Priority>,
}

/// Per-table gate that fires on the trailing edge: the first change opens a
/// `debounce_seconds` window, every change inside it is folded in at the
/// highest priority seen, and one task is enqueued when the window closes.
pub struct Debouncer {
    policies: BTreeMap<String, TableSyncPolicy>,
    queue: Arc<SyncQueue>,
    tables: HashMap<String, DebounceState>,
}

impl Debouncer {
    pub fn new(config: &SyncConfig, queue: Arc<SyncQueue>) -> Self {
        let policies = config
            .table_configs
            .iter()
            .filter(|(_, policy)| policy.enabled)
            .map(|(name, policy)| (name.clone(), policy.clone()))
            .collect();
        Self {
            policies,
            queue,
            tables: HashMap::new(),
        }
    }

    /// Take one change. Returns whether it was admitted or is being held.
    pub fn handle(&mut self, event: &ChangeEvent) -> bool {
        let Some(policy) = self.policies.get(&event.table_name) else {
            tracing::debug!(table = %event.table_name, "change_ignored_untracked_table");
            return false;
        };
        let priority = policy.priority_for(event.ops);
        let debounce = policy.debounce();
        let batched = policy.enable_batching;

        let state = self.tables.entry(event.table_name.clone()).or_default();
        let priority = state.pending.map_or(priority, |p| p.max(priority));

        if !debounce.is_zero() {
            state.pending = Some(priority);
            state.since.get_or_insert_with(Instant::now);
            tracing::trace!(table = %event.table_name, "change_debounced");
            return true;
        }

        let admission = self.queue.enqueue(&event.table_name, priority, batched);
        Self::settle(state, admission, priority, &event.table_name)
    }

    fn settle(
        state: &mut DebounceState,
        admission: Admission,
        priority: Priority,
        table: &str,
    ) -> bool {
        if admission.is_accepted() {
            state.since = None;
            state.pending = None;
            tracing::debug!(table = %table, priority = %priority, ?admission, "change_enqueued");
            true
        } else {
            // keep it pending so the next flush retries
            state.pending = Some(priority);
            state.since.get_or_insert_with(Instant::now);
            tracing::warn!(table = %table, priority = %priority, "change_rejected_queue_full");
            false
        }
    }

    /// Enqueue held changes whose debounce window has closed
    pub fn flush(&mut self) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        for (table, state) in self.tables.iter_mut() {
            let Some(priority) = state.pending else {
                continue;
            };
            let Some(policy) = self.policies.get(table) else {
                continue;
            };
            let due = state
                .since
                .map_or(true, |at| now.duration_since(at) >= policy.debounce());
            if !due {
                continue;
            }
            let admission = self.queue.enqueue(table, priority, policy.enable_batching);
            if Self::settle(state, admission, priority, table) {
                fired += 1;
            }
        }
        fired
    }

    /// Whether a table has a change held back
    pub fn is_pending(&self, table: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|state| state.pending.is_some())
    }
}

async fn run_debouncer(
    mut debouncer: Debouncer,
    mut changes: mpsc::Receiver<DetectedChange>,
    cancel: CancellationToken,
) {
    let mut flush = tokio::time::interval(FLUSH_TICK);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            change = changes.recv() => {
                let Some(DetectedChange { event, ack }) = change else {
                    break;
                };
                let accepted = debouncer.handle(&event);
                if let Some(ack) = ack {
                    // source may have stopped waiting
                    let _ = ack.send(accepted);
                }
            }
            _ = flush.tick() => {
                debouncer.flush();
            }
        }
    }

    tracing::debug!("debouncer_stopped");
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the change sources and the debouncer loop
pub struct ChangeDetector {
    config: Arc<SyncConfig>,
    store: Arc<dyn RowSource>,
    queue: Arc<SyncQueue>,
    running: Mutex<Option<Running>>,
}

impl ChangeDetector {
    pub fn new(config: Arc<SyncConfig>, store: Arc<dyn RowSource>, queue: Arc<SyncQueue>) -> Self {
        Self {
            config,
            store,
            queue,
            running: Mutex::new(None),
        }
    }

    /// Notification source when available, plus checksum polling
    fn default_sources(&self) -> Vec<Box<dyn ChangeSource>> {
        let tables = self.config.enabled_tables();
        let mut sources: Vec<Box<dyn ChangeSource>> = Vec::new();

        #[cfg(feature = "watcher")]
        if self.config.detection.use_file_notifications {
            let paths = self.store.watch_paths();
            if !paths.is_empty() {
                match super::watch::NotifyChangeSource::new(paths, tables.clone()) {
                    Ok(source) => sources.push(Box::new(source)),
                    Err(e) => {
                        tracing::warn!(error = %e, "file_notifications_unavailable_polling_only")
                    }
                }
            }
        }

        let notifications_active = !sources.is_empty();
        let interval = self.config.detection.checksum_interval(notifications_active);
        sources.push(Box::new(PollingChangeSource::new(
            Arc::clone(&self.store),
            tables,
            interval,
        )));
        sources
    }

    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let sources = self.default_sources();
        self.start_with(sources)
    }

    /// Start with an explicit set of sources. No-op when already running.
    pub fn start_with(&self, sources: Vec<Box<dyn ChangeSource>>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut tasks = Vec::with_capacity(sources.len() + 1);

        let debouncer = Debouncer::new(&self.config, Arc::clone(&self.queue));
        tasks.push(tokio::spawn(run_debouncer(debouncer, rx, cancel.clone())));

        for mut source in sources {
            let sink = tx.clone();
            let cancel = cancel.clone();
            tracing::info!(source = source.name(), "change_source_started");
            tasks.push(tokio::spawn(async move {
                source.run(sink, cancel).await;
                tracing::debug!(source = source.name(), "change_source_stopped");
            }));
        }

        *running = Some(Running { cancel, tasks });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Cancel every source and the debouncer and wait for them to exit
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "detector_task_join_failed");
            }
        }
        tracing::info!("change_detector_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueuePolicy;
    use crate::sync::queue::ClaimFilter;
    use crate::types::ChangeOps;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        for policy in config.table_configs.values_mut() {
            policy.debounce_seconds = 2.0;
        }
        config
    }

    fn queue(max_size: usize) -> Arc<SyncQueue> {
        Arc::new(SyncQueue::new(&QueuePolicy {
            max_size,
            ..QueuePolicy::default()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_one_task() {
        let queue = queue(10);
        let mut debouncer = Debouncer::new(&config(), queue.clone());

        for _ in 0..20 {
            assert!(debouncer.handle(&ChangeEvent::filesystem("executions")));
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        assert!(debouncer.is_pending("executions"));
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(debouncer.flush(), 1);
        assert!(!debouncer.is_pending("executions"));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_during_burst_do_not_split_it() {
        let queue = queue(10);
        let mut debouncer = Debouncer::new(&config(), queue.clone());

        debouncer.handle(&ChangeEvent::filesystem("executions"));
        // a worker polling mid-burst finds nothing to claim
        assert!(queue.try_dequeue(ClaimFilter::any()).is_none());
        for _ in 0..9 {
            tokio::time::advance(Duration::from_millis(100)).await;
            debouncer.handle(&ChangeEvent::filesystem("executions"));
            assert!(queue.try_dequeue(ClaimFilter::any()).is_none());
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(debouncer.flush(), 1);
        let task = queue.try_dequeue(ClaimFilter::any()).unwrap();
        queue.complete(&task);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(debouncer.flush(), 0);
        assert_eq!(queue.stats().created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_not_flushed_early() {
        let queue = queue(10);
        let mut debouncer = Debouncer::new(&config(), queue.clone());

        debouncer.handle(&ChangeEvent::filesystem("executions"));
        tokio::time::advance(Duration::from_secs(1)).await;
        // later changes do not push the window out
        debouncer.handle(&ChangeEvent::filesystem("executions"));
        assert_eq!(debouncer.flush(), 0);
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(debouncer.flush(), 1);
        assert_eq!(queue.len(), 1);

        // the next change opens a fresh window
        debouncer.handle(&ChangeEvent::filesystem("executions"));
        assert_eq!(debouncer.flush(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_keeps_max_priority() {
        let queue = queue(10);
        let mut debouncer = Debouncer::new(&config(), queue.clone());

        for ops in [
            ChangeOps {
                updated: true,
                ..Default::default()
            },
            ChangeOps {
                deleted: true,
                ..Default::default()
            },
            ChangeOps {
                updated: true,
                ..Default::default()
            },
        ] {
            debouncer.handle(&ChangeEvent::checksum("executions", ops));
        }
        tokio::time::advance(Duration::from_secs(3)).await;
        debouncer.flush();
        assert_eq!(queue.pending_priority("executions"), Some(Priority::High));
    }

    #[tokio::test]
    async fn test_zero_debounce_enqueues_immediately() {
        let queue = queue(10);
        let mut config = config();
        for policy in config.table_configs.values_mut() {
            policy.debounce_seconds = 0.0;
        }
        let mut debouncer = Debouncer::new(&config, queue.clone());

        assert!(debouncer.handle(&ChangeEvent::filesystem("executions")));
        assert!(!debouncer.is_pending("executions"));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_tables_ignored() {
        let queue = queue(10);
        let mut config = config();
        if let Some(policy) = config.table_configs.get_mut("variations") {
            policy.enabled = false;
        }
        let mut debouncer = Debouncer::new(&config, queue.clone());

        assert!(!debouncer.handle(&ChangeEvent::filesystem("jobs")));
        assert!(!debouncer.handle(&ChangeEvent::filesystem("variations")));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_change_stays_pending() {
        let queue = queue(1);
        queue.enqueue("variations", Priority::High, false);
        let mut debouncer = Debouncer::new(&config(), queue.clone());

        // update priority is medium; the queue is full of higher work
        let update = ChangeEvent::checksum(
            "executions",
            ChangeOps {
                updated: true,
                ..Default::default()
            },
        );
        assert!(debouncer.handle(&update));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(debouncer.flush(), 0);
        assert!(debouncer.is_pending("executions"));
        assert_eq!(queue.stats().rejected, 1);

        // room frees up; the next flush retries
        let task = queue.try_dequeue(ClaimFilter::any()).unwrap();
        queue.complete(&task);
        assert_eq!(debouncer.flush(), 1);
        assert_eq!(queue.pending_priority("executions"), Some(Priority::Medium));
    }

    struct ScriptedSource {
        events: Vec<ChangeEvent>,
    }

    #[async_trait]
    impl ChangeSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(&mut self, sink: mpsc::Sender<DetectedChange>, cancel: CancellationToken) {
            for event in self.events.drain(..) {
                if sink.send(DetectedChange::new(event)).await.is_err() {
                    return;
                }
            }
            cancel.cancelled().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_start_stop_idempotent() {
        let queue = queue(10);
        let store: Arc<dyn RowSource> = Arc::new(crate::storage::Storage::open_in_memory().unwrap());
        let detector = ChangeDetector::new(Arc::new(config()), store, queue.clone());

        let source = ScriptedSource {
            events: (0..5).map(|_| ChangeEvent::filesystem("executions")).collect(),
        };
        detector.start_with(vec![Box::new(source)]).unwrap();
        detector.start_with(Vec::new()).unwrap();
        assert!(detector.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        detector.stop().await;
        detector.stop().await;
        assert!(!detector.is_running());
        assert_eq!(queue.stats().created, 1);
    }
}
