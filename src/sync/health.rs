//! Sync health tracking and event broadcast

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::MonitoringPolicy;
use crate::error::MirrorError;
use crate::types::{HealthState, SyncResult, TableHealth};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Types of sync events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    Alert,
}

/// A sync lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub event_type: SyncEventType,
    pub timestamp: DateTime<Utc>,
    pub table_name: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl SyncEvent {
    pub fn sync_started(table: &str) -> Self {
        Self {
            event_type: SyncEventType::SyncStarted,
            timestamp: Utc::now(),
            table_name: Some(table.to_string()),
            data: None,
        }
    }

    pub fn sync_completed(table: &str, rows: usize) -> Self {
        Self {
            event_type: SyncEventType::SyncCompleted,
            timestamp: Utc::now(),
            table_name: Some(table.to_string()),
            data: Some(serde_json::json!({ "rows": rows })),
        }
    }

    pub fn sync_failed(table: &str, error: &str, permanent: bool) -> Self {
        Self {
            event_type: SyncEventType::SyncFailed,
            timestamp: Utc::now(),
            table_name: Some(table.to_string()),
            data: Some(serde_json::json!({
                "error": error,
                "permanent": permanent,
            })),
        }
    }

    pub fn alert(table: &str, consecutive_failures: u32, error: &str) -> Self {
        Self {
            event_type: SyncEventType::Alert,
            timestamp: Utc::now(),
            table_name: Some(table.to_string()),
            data: Some(serde_json::json!({
                "consecutive_failures": consecutive_failures,
                "error": error,
            })),
        }
    }
}

#[derive(Default)]
struct MonitorState {
    global: HealthState,
    tables: BTreeMap<String, TableHealth>,
    history: VecDeque<SyncResult>,
}

/// Folds sync outcomes into global and per-table health
pub struct HealthMonitor {
    state: RwLock<MonitorState>,
    events: broadcast::Sender<SyncEvent>,
    alert_threshold: u32,
    history_size: usize,
}

impl HealthMonitor {
    pub fn new(policy: &MonitoringPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(MonitorState::default()),
            events,
            alert_threshold: policy.alert_threshold.max(1),
            history_size: policy.history_size,
        }
    }

    /// Start tracking a table so it shows up in status before its first sync
    pub fn register_table(&self, table: &str) {
        self.state
            .write()
            .tables
            .entry(table.to_string())
            .or_insert_with(|| TableHealth {
                healthy: true,
                ..Default::default()
            });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn push_history(&self, state: &mut MonitorState, result: SyncResult) {
        if self.history_size == 0 {
            return;
        }
        while state.history.len() >= self.history_size {
            state.history.pop_front();
        }
        state.history.push_back(result);
    }

    pub fn record_started(&self, table: &str) {
        self.emit(SyncEvent::sync_started(table));
    }

    fn mark_synced(state: &mut MonitorState, table: &str, rows: usize, now: DateTime<Utc>) {
        let health = state.tables.entry(table.to_string()).or_default();
        health.healthy = true;
        health.consecutive_failures = 0;
        health.last_success_at = Some(now);
        health.last_error = None;
        health.last_row_count = Some(rows);
        health.permanent_failure = false;
    }

    /// Returns the table's consecutive failure count
    fn mark_failed(state: &mut MonitorState, table: &str, message: &str, permanent: bool) -> u32 {
        let health = state.tables.entry(table.to_string()).or_default();
        health.healthy = false;
        health.consecutive_failures += 1;
        health.last_error = Some(message.to_string());
        health.permanent_failure = permanent;
        health.consecutive_failures
    }

    fn note_global_failure(state: &mut MonitorState, table: &str, message: &str, now: DateTime<Utc>) {
        state.global.consecutive_failures += 1;
        state.global.last_failure_at = Some(now);
        state.global.last_error = Some(format!("{}: {}", table, message));
        state.global.total_failures += 1;
    }

    fn announce_synced(&self, result: &SyncResult) {
        for (table, rows) in &result.synced_counts_by_table {
            tracing::info!(table = %table, rows = *rows, "sync_completed");
            self.emit(SyncEvent::sync_completed(table, *rows));
        }
    }

    /// Log and broadcast a failure. Returns true when it raised an alert.
    fn announce_failure(
        &self,
        table: &str,
        message: &str,
        permanent: bool,
        table_failures: u32,
        global_failures: u32,
    ) -> bool {
        if permanent {
            tracing::error!(table = %table, error = %message, "sync_failed_permanently");
        } else {
            tracing::warn!(table = %table, error = %message, "sync_failed");
        }
        self.emit(SyncEvent::sync_failed(table, message, permanent));

        let alert = table_failures == self.alert_threshold
            || global_failures == self.alert_threshold;
        if alert {
            tracing::error!(
                table = %table,
                consecutive_failures = table_failures.max(global_failures),
                threshold = self.alert_threshold,
                "sync_alert"
            );
            self.emit(SyncEvent::alert(
                table,
                table_failures.max(global_failures),
                message,
            ));
        }
        alert
    }

    pub fn record_success(&self, result: &SyncResult) {
        let now = result.completed_at;
        {
            let mut state = self.state.write();
            state.global.consecutive_failures = 0;
            state.global.last_success_at = Some(now);
            state.global.total_syncs += 1;
            for (table, rows) in &result.synced_counts_by_table {
                Self::mark_synced(&mut state, table, *rows, now);
            }
            self.push_history(&mut state, result.clone());
        }
        self.announce_synced(result);
    }

    /// Record a failed attempt. Returns true when this failure raised an alert.
    pub fn record_failure(&self, table: &str, error: &MirrorError, started_at: DateTime<Utc>) -> bool {
        let message = error.to_string();
        let permanent = error.is_permanent();
        let (table_failures, global_failures) = {
            let mut state = self.state.write();
            state.global.total_syncs += 1;
            Self::note_global_failure(&mut state, table, &message, Utc::now());
            let table_failures = Self::mark_failed(&mut state, table, &message, permanent);

            let mut failures = BTreeMap::new();
            failures.insert(table.to_string(), message.clone());
            let result = SyncResult::from_outcomes(started_at, BTreeMap::new(), failures);
            self.push_history(&mut state, result);
            (table_failures, state.global.consecutive_failures)
        };

        self.announce_failure(table, &message, permanent, table_failures, global_failures)
    }

    /// Record a multi-table run as a single history entry. Tables are
    /// updated one by one; the global failure streak only resets when every
    /// table synced. Returns true when the run raised an alert.
    pub fn record_run(&self, result: &SyncResult, errors: &[(String, MirrorError)]) -> bool {
        let now = result.completed_at;
        let (failed, global_failures) = {
            let mut state = self.state.write();
            state.global.total_syncs += 1;
            for (table, rows) in &result.synced_counts_by_table {
                Self::mark_synced(&mut state, table, *rows, now);
            }

            let mut failed = Vec::with_capacity(errors.len());
            for (table, error) in errors {
                let message = error.to_string();
                let permanent = error.is_permanent();
                let table_failures = Self::mark_failed(&mut state, table, &message, permanent);
                failed.push((table.as_str(), message, permanent, table_failures));
            }
            match failed.first() {
                Some((table, message, _, _)) => {
                    Self::note_global_failure(&mut state, table, message, now);
                }
                None => {
                    state.global.consecutive_failures = 0;
                    state.global.last_success_at = Some(now);
                }
            }

            self.push_history(&mut state, result.clone());
            (failed, state.global.consecutive_failures)
        };

        self.announce_synced(result);
        let mut alerted = false;
        for (i, (table, message, permanent, table_failures)) in failed.into_iter().enumerate() {
            // the global streak moved once for the whole run
            let global = if i == 0 { global_failures } else { 0 };
            alerted |= self.announce_failure(table, &message, permanent, table_failures, global);
        }
        alerted
    }

    pub fn state(&self) -> HealthState {
        self.state.read().global.clone()
    }

    pub fn table_health(&self, table: &str) -> Option<TableHealth> {
        self.state.read().tables.get(table).cloned()
    }

    pub fn tables(&self) -> BTreeMap<String, TableHealth> {
        self.state.read().tables.clone()
    }

    /// Recent results, oldest first
    pub fn history(&self) -> Vec<SyncResult> {
        self.state.read().history.iter().cloned().collect()
    }

    /// Healthy when every tracked table's last attempt succeeded
    pub fn is_healthy(&self) -> bool {
        self.state.read().tables.values().all(|t| t.healthy)
    }
}
