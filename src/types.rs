//! Core types for jobmirror

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Task priority. Ordering is significant: `Critical > High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Whether realtime workers should pick this up
    pub fn is_urgent(&self) -> bool {
        *self >= Priority::High
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// What noticed the change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Filesystem,
    Checksum,
}

/// Row-level operations observed in a change. All false means "unknown"
/// (filesystem notifications carry no row information).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOps {
    pub inserted: bool,
    pub updated: bool,
    pub deleted: bool,
}

impl ChangeOps {
    pub fn is_unknown(&self) -> bool {
        !self.inserted && !self.updated && !self.deleted
    }
}

/// A signal that the local store may have mutated for a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table_name: String,
    pub detected_at: DateTime<Utc>,
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub ops: ChangeOps,
}

impl ChangeEvent {
    pub fn filesystem(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            detected_at: Utc::now(),
            trigger_kind: TriggerKind::Filesystem,
            ops: ChangeOps::default(),
        }
    }

    pub fn checksum(table_name: impl Into<String>, ops: ChangeOps) -> Self {
        Self {
            table_name: table_name.into(),
            detected_at: Utc::now(),
            trigger_kind: TriggerKind::Checksum,
            ops,
        }
    }
}

/// A pending or claimed unit of sync work
#[derive(Debug, Clone, Serialize)]
pub struct SyncTask {
    pub id: Uuid,
    pub table_name: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    /// Table policy asked for batching; only background workers claim it
    pub batched: bool,
}

impl SyncTask {
    pub fn new(table_name: impl Into<String>, priority: Priority, batched: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            table_name: table_name.into(),
            priority,
            enqueued_at: Utc::now(),
            attempt_count: 0,
            batched,
        }
    }
}

/// Outcome of one sync attempt (one table or a full forced sync)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub message: String,
    pub synced_counts_by_table: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_tables: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncResult {
    /// Fold per-table outcomes into one result
    pub fn from_outcomes(
        started_at: DateTime<Utc>,
        counts: BTreeMap<String, usize>,
        failures: BTreeMap<String, String>,
    ) -> Self {
        let success = failures.is_empty();
        let message = if success {
            format!(
                "Synced {} table(s), {} row(s)",
                counts.len(),
                counts.values().sum::<usize>()
            )
        } else {
            format!(
                "{} table(s) synced, {} failed: {}",
                counts.len(),
                failures.len(),
                failures.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        };

        Self {
            success,
            message,
            synced_counts_by_table: counts,
            failed_tables: failures,
            started_at,
            completed_at: Utc::now(),
        }
    }
}

/// Global sync health
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthState {
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_syncs: u64,
    pub total_failures: u64,
}

/// Per-table sync health
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_row_count: Option<usize>,
    /// Last failure was non-retryable (auth, permission, missing target)
    pub permanent_failure: bool,
}

/// A primitive cell written to the remote mirror
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Empty,
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CellValue::Text(s) => serializer.serialize_str(s),
            CellValue::Integer(i) => serializer.serialize_i64(*i),
            // JSON has no NaN/inf
            CellValue::Float(f) if !f.is_finite() => serializer.serialize_str(&f.to_string()),
            CellValue::Float(f) => serializer.serialize_f64(*f),
            CellValue::Bool(b) => serializer.serialize_bool(*b),
            CellValue::Empty => serializer.serialize_str(""),
        }
    }
}

/// A value as read from the local store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl StoreValue {
    /// Flatten into a primitive cell. Binary is hex-encoded, non-primitive
    /// values are stringified, null becomes the empty string.
    pub fn to_cell(&self) -> CellValue {
        match self {
            StoreValue::Null => CellValue::Empty,
            StoreValue::Integer(i) => CellValue::Integer(*i),
            StoreValue::Real(f) => CellValue::Float(*f),
            StoreValue::Text(s) => CellValue::Text(s.clone()),
            StoreValue::Blob(b) => CellValue::Text(hex::encode(b)),
            StoreValue::Bool(b) => CellValue::Bool(*b),
            StoreValue::Timestamp(ts) => CellValue::Text(ts.to_rfc3339()),
            StoreValue::Json(v) => match v {
                serde_json::Value::Null => CellValue::Empty,
                serde_json::Value::Bool(b) => CellValue::Bool(*b),
                serde_json::Value::String(s) => CellValue::Text(s.clone()),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => CellValue::Integer(i),
                    None => CellValue::Float(n.as_f64().unwrap_or_default()),
                },
                other => CellValue::Text(other.to_string()),
            },
        }
    }

    /// Text form used for change fingerprints
    pub fn as_text(&self) -> Option<String> {
        match self {
            StoreValue::Null => None,
            StoreValue::Text(s) => Some(s.clone()),
            StoreValue::Integer(i) => Some(i.to_string()),
            StoreValue::Real(f) => Some(f.to_string()),
            StoreValue::Bool(b) => Some(b.to_string()),
            StoreValue::Blob(b) => Some(hex::encode(b)),
            StoreValue::Timestamp(ts) => Some(ts.to_rfc3339()),
            StoreValue::Json(v) => Some(v.to_string()),
        }
    }
}

/// One row of a local table with its field names in column order
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub fields: Vec<(String, StoreValue)>,
}

impl Row {
    pub fn new(fields: Vec<(String, StoreValue)>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&StoreValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn id(&self) -> Option<String> {
        self.get("id").and_then(StoreValue::as_text)
    }

    pub fn updated_at(&self) -> Option<String> {
        self.get("updated_at").and_then(StoreValue::as_text)
    }

    /// Cells in column order
    pub fn to_cells(&self) -> Vec<CellValue> {
        self.fields.iter().map(|(_, v)| v.to_cell()).collect()
    }
}

/// The subset of a row that matters for change detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFingerprint {
    pub id: String,
    pub status: Option<String>,
    pub updated_at: Option<String>,
}
