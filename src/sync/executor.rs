//! Read-and-replace sync of one table into the remote mirror

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::rate_limit::RateLimiter;
use crate::config::SyncConfig;
use crate::error::{MirrorError, RemoteErrorKind, Result};
use crate::remote::{A1Range, RemoteMirror};
use crate::storage::RowSource;
use crate::types::{CellValue, Row, SyncResult};

/// Header row followed by one row of cells per record
pub fn serialize_rows(columns: &[String], rows: &[Row]) -> Vec<Vec<CellValue>> {
    let mut out = Vec::with_capacity(rows.len() + 1);
    out.push(columns.iter().cloned().map(CellValue::Text).collect());
    out.extend(rows.iter().map(Row::to_cells));
    out
}

/// Performs the authoritative full replace of a table's sheet.
///
/// Every remote call goes through the shared [`RateLimiter`]. Syncs of the
/// same table are serialized by a per-table async mutex.
pub struct SyncExecutor {
    source: Arc<dyn RowSource>,
    mirror: Arc<dyn RemoteMirror>,
    limiter: Arc<RateLimiter>,
    target_id: String,
    create_if_missing: bool,
    sheet_names: BTreeMap<String, String>,
    table_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Sheets known to exist on the target
    ensured: Mutex<HashSet<String>>,
}

impl SyncExecutor {
    pub fn new(
        config: &SyncConfig,
        source: Arc<dyn RowSource>,
        mirror: Arc<dyn RemoteMirror>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            source,
            mirror,
            limiter,
            target_id: config.target.target_id.clone(),
            create_if_missing: config.target.create_if_missing,
            sheet_names: config.target.sheet_names.clone(),
            table_locks: DashMap::new(),
            ensured: Mutex::new(HashSet::new()),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    fn sheet_for(&self, table: &str) -> Result<String> {
        self.sheet_names
            .get(table)
            .cloned()
            .ok_or_else(|| MirrorError::Config(format!("no sheet name configured for {}", table)))
    }

    fn table_lock(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.table_locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Whether a sync of this table is running right now
    pub fn is_syncing(&self, table: &str) -> bool {
        self.table_locks
            .get(table)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    async fn read_table(&self, table: &str) -> Result<(Vec<String>, Vec<Row>)> {
        let source = Arc::clone(&self.source);
        let table = table.to_string();
        tokio::task::spawn_blocking(move || -> Result<(Vec<String>, Vec<Row>)> {
            let columns = source.columns(&table)?;
            let rows = source.list_rows(&table)?;
            Ok((columns, rows))
        })
        .await
        .map_err(|e| MirrorError::Internal(format!("row read task failed: {}", e)))?
    }

    /// Make sure the sheet exists, creating it when allowed
    async fn ensure_sheet(&self, sheet: &str) -> Result<()> {
        if self.ensured.lock().contains(sheet) {
            return Ok(());
        }

        self.limiter.acquire().await;
        let target = self.mirror.get_target(&self.target_id).await?;
        if !target.has_sheet(sheet) {
            if !self.create_if_missing {
                return Err(MirrorError::remote(
                    RemoteErrorKind::NotFound,
                    format!("sheet {} missing on target {}", sheet, self.target_id),
                ));
            }
            self.limiter.acquire().await;
            match self.mirror.create_sheet(&self.target_id, sheet).await {
                Ok(()) => tracing::info!(sheet = %sheet, "sheet_created"),
                // lost a race with another writer
                Err(e) if e.remote_kind() == Some(RemoteErrorKind::AlreadyExists) => {}
                Err(e) => return Err(e),
            }
        }

        self.ensured.lock().insert(sheet.to_string());
        Ok(())
    }

    /// Replace the table's sheet with the current rows. Returns the number of
    /// data rows written.
    pub async fn sync_table(&self, table: &str) -> Result<usize> {
        let sheet = self.sheet_for(table)?;
        let lock = self.table_lock(table);
        let _guard = lock.lock().await;

        let started = std::time::Instant::now();
        let (columns, rows) = self.read_table(table).await?;
        let row_count = rows.len();
        let values = serialize_rows(&columns, &rows);

        let outcome = async {
            self.ensure_sheet(&sheet).await?;
            self.limiter.acquire().await;
            self.mirror
                .clear_range(&self.target_id, &sheet, A1Range::Whole)
                .await?;
            self.limiter.acquire().await;
            self.mirror
                .write_range(&self.target_id, &sheet, A1Range::covering(&values), &values)
                .await
        }
        .await;

        if let Err(e) = &outcome {
            if e.remote_kind() == Some(RemoteErrorKind::NotFound) {
                // sheet may have been deleted remotely; re-check next time
                self.ensured.lock().remove(&sheet);
            }
        }
        outcome?;

        tracing::debug!(
            table = %table,
            sheet = %sheet,
            rows = row_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "table_synced"
        );
        Ok(row_count)
    }

    /// [`Self::sync_table`] folded into a [`SyncResult`]
    pub async fn sync(&self, table: &str) -> Result<SyncResult> {
        let started_at = Utc::now();
        let rows = self.sync_table(table).await?;
        let mut counts = BTreeMap::new();
        counts.insert(table.to_string(), rows);
        Ok(SyncResult::from_outcomes(started_at, counts, BTreeMap::new()))
    }
}
