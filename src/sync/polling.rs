//! Checksum polling change source
//!
//! Works for any [`RowSource`]. Each cycle hashes the `(id, status,
//! updated_at)` fingerprints of every tracked table and reports tables whose
//! hash moved. A table's new hash is only committed once the debouncer has
//! acknowledged the change, so a change that could not be admitted is
//! detected again on the next cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::detector::{ChangeSource, DetectedChange};
use crate::error::{MirrorError, Result};
use crate::storage::RowSource;
use crate::types::{ChangeEvent, ChangeOps, RowFingerprint};

/// Last committed view of a table
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    pub checksum: String,
    rows: HashMap<String, (Option<String>, Option<String>)>,
}

impl TableSnapshot {
    pub fn from_fingerprints(fingerprints: &[RowFingerprint]) -> Result<Self> {
        Ok(Self {
            checksum: checksum(fingerprints)?,
            rows: fingerprints
                .iter()
                .map(|fp| (fp.id.clone(), (fp.status.clone(), fp.updated_at.clone())))
                .collect(),
        })
    }

    /// Which row operations separate `self` from `newer`
    pub fn diff(&self, newer: &TableSnapshot) -> ChangeOps {
        let mut ops = ChangeOps::default();
        for (id, state) in &newer.rows {
            match self.rows.get(id) {
                None => ops.inserted = true,
                Some(old) if old != state => ops.updated = true,
                Some(_) => {}
            }
        }
        ops.deleted = self.rows.keys().any(|id| !newer.rows.contains_key(id));
        ops
    }
}

/// SHA-256 over the JSON of the fingerprints, in the order given
pub fn checksum(fingerprints: &[RowFingerprint]) -> Result<String> {
    let serialized = serde_json::to_vec(fingerprints)?;
    Ok(hex::encode(Sha256::digest(&serialized)))
}

pub struct PollingChangeSource {
    store: Arc<dyn RowSource>,
    tables: Vec<String>,
    interval: Duration,
    snapshots: HashMap<String, TableSnapshot>,
}

impl PollingChangeSource {
    pub fn new(store: Arc<dyn RowSource>, tables: Vec<String>, interval: Duration) -> Self {
        Self {
            store,
            tables,
            interval,
            snapshots: HashMap::new(),
        }
    }

    pub fn snapshot(&self, table: &str) -> Option<&TableSnapshot> {
        self.snapshots.get(table)
    }

    async fn read_snapshot(&self, table: &str) -> Result<TableSnapshot> {
        let store = Arc::clone(&self.store);
        let table = table.to_string();
        tokio::task::spawn_blocking(move || {
            let fingerprints = store.fingerprints(&table)?;
            TableSnapshot::from_fingerprints(&fingerprints)
        })
        .await
        .map_err(|e| MirrorError::Internal(format!("fingerprint task failed: {}", e)))?
    }

    /// One pass over every table. Returns how many changes were committed.
    pub async fn poll_once(
        &mut self,
        sink: &mpsc::Sender<DetectedChange>,
        cancel: &CancellationToken,
    ) -> usize {
        let mut committed = 0;
        for table in self.tables.clone() {
            if cancel.is_cancelled() {
                break;
            }

            let current = match self.read_snapshot(&table).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(table = %table, error = %e, "checksum_cycle_skipped");
                    continue;
                }
            };

            // first sighting reconciles the mirror with unknown ops
            let ops = match self.snapshots.get(&table) {
                Some(previous) if previous.checksum == current.checksum => continue,
                Some(previous) => previous.diff(&current),
                None => ChangeOps::default(),
            };

            let (change, ack) = DetectedChange::with_ack(ChangeEvent::checksum(&table, ops));
            if sink.send(change).await.is_err() {
                return committed;
            }
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return committed,
                ack = ack => ack.unwrap_or(false),
            };

            if accepted {
                tracing::debug!(table = %table, checksum = %current.checksum, ?ops, "checksum_changed");
                self.snapshots.insert(table, current);
                committed += 1;
            } else {
                tracing::debug!(table = %table, "checksum_change_not_admitted");
            }
        }
        committed
    }
}

#[async_trait]
impl ChangeSource for PollingChangeSource {
    fn name(&self) -> &'static str {
        "checksum"
    }

    async fn run(&mut self, sink: mpsc::Sender<DetectedChange>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once(&sink, &cancel).await;
                }
            }
        }
    }
}
