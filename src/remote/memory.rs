//! In-process mirror
//!
//! Keeps sheets in memory and records every call. Used for dry runs and as the
//! test double for the sync pipeline; failure injection and optional latency
//! let tests exercise retries and concurrency.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{A1Range, RemoteMirror, TargetInfo};
use crate::error::{MirrorError, RemoteErrorKind, Result};
use crate::types::CellValue;

/// One recorded `write_range` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub target_id: String,
    pub sheet: String,
    pub range: String,
    /// JSON body as it would go over the wire
    pub payload: String,
}

/// One recorded call of any kind
#[derive(Debug, Clone)]
pub struct MirrorCall {
    pub at: Instant,
    pub op: &'static str,
    pub sheet: Option<String>,
}

#[derive(Debug)]
struct InjectedFailure {
    /// `None` matches every call
    sheet: Option<String>,
    kind: RemoteErrorKind,
    remaining: Option<u32>,
}

#[derive(Default)]
struct MirrorState {
    targets: HashMap<String, BTreeMap<String, Vec<Vec<CellValue>>>>,
    writes: Vec<WriteRecord>,
    calls: Vec<MirrorCall>,
    failures: Vec<InjectedFailure>,
    in_flight: HashMap<String, usize>,
    /// Sheets cleared whose rewrite has not landed yet
    awaiting_write: HashSet<String>,
    overlaps: usize,
}

/// In-memory [`RemoteMirror`]
#[derive(Default)]
pub struct MemoryMirror {
    state: Mutex<MirrorState>,
    latency: Option<Duration>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror with one empty target already present
    pub fn with_target(target_id: &str) -> Self {
        let mirror = Self::new();
        mirror.add_target(target_id);
        mirror
    }

    /// Sleep this long inside every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn add_target(&self, target_id: &str) {
        self.state
            .lock()
            .targets
            .entry(target_id.to_string())
            .or_default();
    }

    /// Fail every call touching `sheet` (or every call, for `None`)
    pub fn fail_always(&self, sheet: Option<&str>, kind: RemoteErrorKind) {
        self.state.lock().failures.push(InjectedFailure {
            sheet: sheet.map(str::to_string),
            kind,
            remaining: None,
        });
    }

    /// Fail the next `times` calls touching `sheet`
    pub fn fail_times(&self, sheet: Option<&str>, kind: RemoteErrorKind, times: u32) {
        self.state.lock().failures.push(InjectedFailure {
            sheet: sheet.map(str::to_string),
            kind,
            remaining: Some(times),
        });
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn calls(&self) -> Vec<MirrorCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Current contents of a sheet
    pub fn sheet_rows(&self, target_id: &str, sheet: &str) -> Option<Vec<Vec<CellValue>>> {
        self.state
            .lock()
            .targets
            .get(target_id)
            .and_then(|sheets| sheets.get(sheet))
            .cloned()
    }

    /// Times two writers worked on the same sheet at once
    pub fn overlaps(&self) -> usize {
        self.state.lock().overlaps
    }

    /// Record the call, apply injected failures and mark the sheet busy
    fn begin(&self, op: &'static str, sheet: Option<&str>) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.calls.push(MirrorCall {
            at: Instant::now(),
            op,
            sheet: sheet.map(str::to_string),
        });

        let matched = state.failures.iter().position(|f| match &f.sheet {
            None => true,
            Some(s) => Some(s.as_str()) == sheet,
        });
        if let Some(idx) = matched {
            let kind = state.failures[idx].kind;
            if let Some(remaining) = state.failures[idx].remaining.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    state.failures.remove(idx);
                }
            }
            if let Some(sheet) = sheet {
                state.awaiting_write.remove(sheet);
            }
            return Err(MirrorError::remote(kind, format!("injected {} failure", kind)));
        }

        if let Some(sheet) = sheet {
            let count = state.in_flight.entry(sheet.to_string()).or_insert(0);
            *count += 1;
            if *count > 1 {
                state.overlaps += 1;
            }
        }
        Ok(())
    }

    fn end(&self, sheet: Option<&str>) {
        if let Some(sheet) = sheet {
            if let Some(count) = self.state.lock().in_flight.get_mut(sheet) {
                *count = count.saturating_sub(1);
            }
        }
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn sheets_mut<'a>(
        state: &'a mut MirrorState,
        target_id: &str,
    ) -> Result<&'a mut BTreeMap<String, Vec<Vec<CellValue>>>> {
        state.targets.get_mut(target_id).ok_or_else(|| {
            MirrorError::remote(
                RemoteErrorKind::NotFound,
                format!("target {} not found", target_id),
            )
        })
    }
}

#[async_trait]
impl RemoteMirror for MemoryMirror {
    async fn get_target(&self, target_id: &str) -> Result<TargetInfo> {
        self.begin("get_target", None)?;
        self.pause().await;
        let mut state = self.state.lock();
        let sheets = Self::sheets_mut(&mut state, target_id)?;
        Ok(TargetInfo {
            target_id: target_id.to_string(),
            title: None,
            sheets: sheets.keys().cloned().collect(),
        })
    }

    async fn create_sheet(&self, target_id: &str, name: &str) -> Result<()> {
        self.begin("create_sheet", Some(name))?;
        self.pause().await;
        let result = {
            let mut state = self.state.lock();
            Self::sheets_mut(&mut state, target_id).and_then(|sheets| {
                if sheets.contains_key(name) {
                    Err(MirrorError::remote(
                        RemoteErrorKind::AlreadyExists,
                        format!("sheet {} already exists", name),
                    ))
                } else {
                    sheets.insert(name.to_string(), Vec::new());
                    Ok(())
                }
            })
        };
        self.end(Some(name));
        result
    }

    async fn clear_range(&self, target_id: &str, sheet: &str, range: A1Range) -> Result<()> {
        self.begin("clear_range", Some(sheet))?;
        self.pause().await;
        let result = {
            let mut state = self.state.lock();
            let cleared = Self::sheets_mut(&mut state, target_id).and_then(|sheets| {
                let rows = sheets.get_mut(sheet).ok_or_else(|| {
                    MirrorError::remote(
                        RemoteErrorKind::NotFound,
                        format!("sheet {} not found", sheet),
                    )
                })?;
                match range {
                    A1Range::Whole => rows.clear(),
                    A1Range::Block { rows: n, .. } => rows.truncate(rows.len().min(n)),
                }
                Ok(())
            });
            if cleared.is_ok() && !state.awaiting_write.insert(sheet.to_string()) {
                // a second clear before the first rewrite landed
                state.overlaps += 1;
            }
            cleared
        };
        self.end(Some(sheet));
        result
    }

    async fn write_range(
        &self,
        target_id: &str,
        sheet: &str,
        range: A1Range,
        rows: &[Vec<CellValue>],
    ) -> Result<()> {
        self.begin("write_range", Some(sheet))?;
        self.pause().await;
        let payload = serde_json::to_string(rows);
        let result = {
            let mut state = self.state.lock();
            state.awaiting_write.remove(sheet);
            let written = Self::sheets_mut(&mut state, target_id).and_then(|sheets| {
                let existing = sheets.get_mut(sheet).ok_or_else(|| {
                    MirrorError::remote(
                        RemoteErrorKind::NotFound,
                        format!("sheet {} not found", sheet),
                    )
                })?;
                for (idx, row) in rows.iter().enumerate() {
                    if idx < existing.len() {
                        existing[idx] = row.clone();
                    } else {
                        existing.push(row.clone());
                    }
                }
                Ok(())
            });
            match (written, payload) {
                (Ok(()), Ok(payload)) => {
                    state.writes.push(WriteRecord {
                        target_id: target_id.to_string(),
                        sheet: sheet.to_string(),
                        range: range.qualified(sheet),
                        payload,
                    });
                    Ok(())
                }
                (Err(e), _) => Err(e),
                (_, Err(e)) => Err(e.into()),
            }
        };
        self.end(Some(sheet));
        result
    }
}
