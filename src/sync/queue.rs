//! Bounded, coalescing priority queue of sync tasks
//!
//! At most one pending task exists per table: a second request for the same
//! table upgrades the pending task's priority instead of adding another.
//! Tasks are handed out highest priority first, oldest first within a
//! priority, and never for a table that already has a claimed task.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueuePolicy;
use crate::types::{Priority, SyncTask};

/// Outcome of [`SyncQueue::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// New pending task
    Created,
    /// Folded into the table's existing pending task
    Coalesced,
    /// Admitted by evicting a lower-priority task for another table
    Evicted { evicted_table: String },
    /// Queue full (or closed); counted as backpressure
    Rejected,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Which tasks a worker is willing to claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimFilter {
    pub min_priority: Priority,
    pub include_batched: bool,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self {
            min_priority: Priority::Low,
            include_batched: true,
        }
    }

    /// Urgent, unbatched work only
    pub fn realtime() -> Self {
        Self {
            min_priority: Priority::High,
            include_batched: false,
        }
    }

    fn matches(&self, task: &SyncTask) -> bool {
        task.priority >= self.min_priority && (self.include_batched || !task.batched)
    }
}

/// Counters surfaced through the status query
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub created: u64,
    pub coalesced: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub requeued: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Bookkeeping for a finished task, kept until `max_completed_age`
#[derive(Debug, Clone)]
pub struct CompletedEntry {
    pub task_id: Uuid,
    pub table_name: String,
    pub finished_at: Instant,
    pub succeeded: bool,
}

#[derive(Debug)]
struct PendingTask {
    task: SyncTask,
    seq: u64,
    not_before: Option<Instant>,
}

impl PendingTask {
    fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<String, PendingTask>,
    claimed: HashMap<String, SyncTask>,
    completed: VecDeque<CompletedEntry>,
    stats: QueueStats,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Lowest priority, then oldest, strictly below `priority`
    fn eviction_victim(&self, priority: Priority) -> Option<String> {
        self.pending
            .values()
            .filter(|p| p.task.priority < priority)
            .min_by_key(|p| (p.task.priority, p.seq))
            .map(|p| p.task.table_name.clone())
    }

    /// Admit a task for a table with no pending entry
    fn admit(&mut self, task: SyncTask, not_before: Option<Instant>, max_size: usize) -> Admission {
        let mut admission = Admission::Created;
        if self.pending.len() >= max_size {
            let victim = if task.priority.is_urgent() {
                self.eviction_victim(task.priority)
            } else {
                None
            };
            match victim {
                Some(table) => {
                    self.pending.remove(&table);
                    self.stats.evicted += 1;
                    tracing::warn!(
                        evicted = %table,
                        admitted = %task.table_name,
                        priority = %task.priority,
                        "queue_full_evicted"
                    );
                    admission = Admission::Evicted {
                        evicted_table: table,
                    };
                }
                None => {
                    self.stats.rejected += 1;
                    tracing::warn!(
                        table = %task.table_name,
                        priority = %task.priority,
                        pending = self.pending.len(),
                        "queue_full_rejected"
                    );
                    return Admission::Rejected;
                }
            }
        }

        let seq = self.next_seq();
        self.pending.insert(
            task.table_name.clone(),
            PendingTask {
                task,
                seq,
                not_before,
            },
        );
        admission
    }

    fn claim(&mut self, filter: ClaimFilter, now: Instant) -> Option<SyncTask> {
        let table = self
            .pending
            .values()
            .filter(|p| {
                p.is_ready(now)
                    && filter.matches(&p.task)
                    && !self.claimed.contains_key(&p.task.table_name)
            })
            // highest priority, then lowest sequence number
            .max_by(|a, b| {
                a.task
                    .priority
                    .cmp(&b.task.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|p| p.task.table_name.clone())?;

        let pending = self.pending.remove(&table)?;
        self.claimed.insert(table, pending.task.clone());
        Some(pending.task)
    }

    /// Time until the earliest backed-off task becomes ready
    fn next_ready_in(&self, now: Instant) -> Option<Duration> {
        self.pending
            .values()
            .filter_map(|p| p.not_before)
            .filter(|t| *t > now)
            .min()
            .map(|t| t - now)
    }

    fn finish(&mut self, task: &SyncTask, succeeded: bool) {
        if self
            .claimed
            .get(&task.table_name)
            .is_some_and(|claimed| claimed.id == task.id)
        {
            self.claimed.remove(&task.table_name);
        }
        self.completed.push_back(CompletedEntry {
            task_id: task.id,
            table_name: task.table_name.clone(),
            finished_at: Instant::now(),
            succeeded,
        });
    }
}

/// The sync task queue shared by the detector and the worker pool
pub struct SyncQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_size: usize,
}

impl SyncQueue {
    pub fn new(policy: &QueuePolicy) -> Self {
        Self::with_capacity(policy.max_size)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_size: max_size.max(1),
        }
    }

    /// Request a sync of `table`. Repeated requests while one is pending are
    /// coalesced, keeping the higher priority.
    pub fn enqueue(&self, table: &str, priority: Priority, batched: bool) -> Admission {
        let admission = {
            let mut state = self.state.lock();
            if state.closed {
                state.stats.rejected += 1;
                return Admission::Rejected;
            }

            if let Some(existing) = state.pending.get_mut(table) {
                existing.task.priority = existing.task.priority.max(priority);
                state.stats.coalesced += 1;
                Admission::Coalesced
            } else {
                let admission =
                    state.admit(SyncTask::new(table, priority, batched), None, self.max_size);
                if admission.is_accepted() {
                    state.stats.created += 1;
                }
                admission
            }
        };

        if admission.is_accepted() {
            tracing::debug!(table, %priority, ?admission, "sync_task_enqueued");
            self.notify.notify_waiters();
        }
        admission
    }

    /// Claim the best eligible task without waiting
    pub fn try_dequeue(&self, filter: ClaimFilter) -> Option<SyncTask> {
        self.state.lock().claim(filter, Instant::now())
    }

    /// Wait for any task. Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<SyncTask> {
        self.dequeue_matching(ClaimFilter::any()).await
    }

    /// Wait for a task accepted by `filter`. Returns `None` once closed.
    pub async fn dequeue_matching(&self, filter: ClaimFilter) -> Option<SyncTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                if let Some(task) = state.claim(filter, now) {
                    return Some(task);
                }
                state.next_ready_in(now)
            };

            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Claim up to `max` tasks at once
    pub fn dequeue_batch(&self, filter: ClaimFilter, max: usize) -> Vec<SyncTask> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let mut batch = Vec::new();
        while batch.len() < max {
            match state.claim(filter, now) {
                Some(task) => batch.push(task),
                None => break,
            }
        }
        batch
    }

    /// Release a claimed task after a successful sync
    pub fn complete(&self, task: &SyncTask) {
        {
            let mut state = self.state.lock();
            state.finish(task, true);
            state.stats.completed += 1;
        }
        self.notify.notify_waiters();
    }

    /// Release a claimed task that will not be retried
    pub fn fail(&self, task: &SyncTask) {
        {
            let mut state = self.state.lock();
            state.finish(task, false);
            state.stats.failed += 1;
        }
        self.notify.notify_waiters();
    }

    /// Release a claimed task and schedule another attempt after `delay`.
    /// Merges with a pending request for the same table if one arrived
    /// meanwhile.
    pub fn requeue(&self, mut task: SyncTask, delay: Duration) -> Admission {
        let admission = {
            let mut state = self.state.lock();
            if state
                .claimed
                .get(&task.table_name)
                .is_some_and(|claimed| claimed.id == task.id)
            {
                state.claimed.remove(&task.table_name);
            }
            if state.closed {
                state.stats.rejected += 1;
                Admission::Rejected
            } else {
                task.attempt_count += 1;
                state.stats.requeued += 1;
                let not_before = Some(Instant::now() + delay);

                if let Some(existing) = state.pending.get_mut(&task.table_name) {
                    existing.task.priority = existing.task.priority.max(task.priority);
                    existing.task.attempt_count =
                        existing.task.attempt_count.max(task.attempt_count);
                    existing.not_before = not_before;
                    Admission::Coalesced
                } else {
                    state.admit(task, not_before, self.max_size)
                }
            }
        };
        self.notify.notify_waiters();
        admission
    }

    /// Hand back a claimed task that was never started
    pub fn release(&self, task: SyncTask) -> Admission {
        let admission = {
            let mut state = self.state.lock();
            if state
                .claimed
                .get(&task.table_name)
                .is_some_and(|claimed| claimed.id == task.id)
            {
                state.claimed.remove(&task.table_name);
            }
            if state.closed {
                Admission::Rejected
            } else if let Some(existing) = state.pending.get_mut(&task.table_name) {
                existing.task.priority = existing.task.priority.max(task.priority);
                Admission::Coalesced
            } else {
                state.admit(task, None, self.max_size)
            }
        };
        self.notify.notify_waiters();
        admission
    }

    /// Drop completed bookkeeping older than `max_age`; returns how many
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.completed.len();
        let now = Instant::now();
        state
            .completed
            .retain(|entry| now.duration_since(entry.finished_at) <= max_age);
        before - state.completed.len()
    }

    /// Stop handing out work and drop everything still pending
    pub fn close(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            state.closed = true;
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        self.notify.notify_waiters();
        dropped
    }

    /// Accept work again after [`Self::close`]. Claims left by workers
    /// aborted during shutdown are discarded.
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.closed = false;
        state.claimed.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pending (unclaimed) tasks
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks currently claimed by workers
    pub fn in_flight(&self) -> usize {
        self.state.lock().claimed.len()
    }

    pub fn pending_priority(&self, table: &str) -> Option<Priority> {
        self.state.lock().pending.get(table).map(|p| p.task.priority)
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats.clone()
    }

    pub fn completed(&self) -> Vec<CompletedEntry> {
        self.state.lock().completed.iter().cloned().collect()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
