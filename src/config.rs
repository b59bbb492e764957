//! Sync configuration
//!
//! Loaded from the `sync` key of a JSON document. Every field has an explicit
//! default so partial documents are accepted; [`SyncConfig::validate`] runs
//! once before anything starts.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::types::{ChangeOps, Priority};

/// Key under which the sync block lives in the shared config document
pub const CONFIG_KEY: &str = "sync";

/// Upper bound for any interval, debounce or grace period, in seconds
pub const MAX_INTERVAL_SECONDS: f64 = 86_400.0;

/// Characters the spreadsheet service refuses in sheet titles
const FORBIDDEN_SHEET_CHARS: &[char] = &['[', ']', '*', '?', '/', '\\', ':'];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    #[serde(default)]
    pub queue: QueuePolicy,
    #[serde(default)]
    pub workers: WorkerPolicy,
    #[serde(default = "default_table_configs")]
    pub table_configs: BTreeMap<String, TableSyncPolicy>,
    #[serde(default)]
    pub detection: DetectionPolicy,
    #[serde(default)]
    pub monitoring: MonitoringPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auth: AuthConfig::default(),
            target: TargetConfig::default(),
            rate_limit: RateLimitPolicy::default(),
            queue: QueuePolicy::default(),
            workers: WorkerPolicy::default(),
            table_configs: default_table_configs(),
            detection: DetectionPolicy::default(),
            monitoring: MonitoringPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Oauth2,
    ServiceAccount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_type")]
    pub auth_type: AuthType,
    /// OAuth2 client secrets (installed-app JSON)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<String>,
    /// Service account key file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_path: Option<String>,
    /// Cached OAuth2 token
    #[serde(default = "default_token_path", skip_serializing_if = "Option::is_none")]
    pub token_path: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_type: default_auth_type(),
            credentials_path: None,
            service_account_path: None,
            token_path: default_token_path(),
        }
    }
}

impl AuthConfig {
    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.credentials_path.as_deref().map(expand_path)
    }

    pub fn service_account_path(&self) -> Option<PathBuf> {
        self.service_account_path.as_deref().map(expand_path)
    }

    pub fn token_path(&self) -> Option<PathBuf> {
        self.token_path.as_deref().map(expand_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub target_id: String,
    #[serde(default = "default_true")]
    pub create_if_missing: bool,
    #[serde(default = "default_sheet_names")]
    pub sheet_names: BTreeMap<String, String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            target_id: String::new(),
            create_if_missing: true,
            sheet_names: default_sheet_names(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    /// Length of the `requests_per_window` window
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Calls allowed within any one second
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            requests_per_window: default_requests_per_window(),
            window_seconds: default_window_seconds(),
            burst_limit: default_burst_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePolicy {
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_max_completed_age")]
    pub max_completed_age_seconds: u64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            cleanup_interval_seconds: default_cleanup_interval(),
            max_completed_age_seconds: default_max_completed_age(),
        }
    }
}

impl QueuePolicy {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn max_completed_age(&self) -> Duration {
        Duration::from_secs(self.max_completed_age_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPolicy {
    #[serde(default = "default_realtime_workers")]
    pub realtime_workers: usize,
    #[serde(default = "default_background_workers")]
    pub background_workers: usize,
    #[serde(default = "default_realtime_poll_interval")]
    pub realtime_poll_interval: f64,
    #[serde(default = "default_background_poll_interval")]
    pub background_poll_interval: f64,
    #[serde(default = "default_background_batch_size")]
    pub background_batch_size: usize,
    /// Attempts per task before it is marked permanently failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How long `stop` waits for in-flight syncs
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: f64,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            realtime_workers: default_realtime_workers(),
            background_workers: default_background_workers(),
            realtime_poll_interval: default_realtime_poll_interval(),
            background_poll_interval: default_background_poll_interval(),
            background_batch_size: default_background_batch_size(),
            max_attempts: default_max_attempts(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

impl WorkerPolicy {
    pub fn realtime_poll(&self) -> Duration {
        clamped_secs(self.realtime_poll_interval)
    }

    pub fn background_poll(&self) -> Duration {
        clamped_secs(self.background_poll_interval)
    }

    pub fn shutdown_grace(&self) -> Duration {
        clamped_secs(self.shutdown_grace_seconds)
    }

    pub fn total_workers(&self) -> usize {
        self.realtime_workers + self.background_workers
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSyncPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_high")]
    pub insert_priority: Priority,
    #[serde(default = "default_medium")]
    pub update_priority: Priority,
    #[serde(default = "default_high")]
    pub delete_priority: Priority,
    #[serde(default)]
    pub enable_batching: bool,
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: f64,
}

impl Default for TableSyncPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            insert_priority: Priority::High,
            update_priority: Priority::Medium,
            delete_priority: Priority::High,
            enable_batching: false,
            debounce_seconds: default_debounce_seconds(),
        }
    }
}

impl TableSyncPolicy {
    /// Highest priority among the observed operations; unknown changes are
    /// treated as updates.
    pub fn priority_for(&self, ops: ChangeOps) -> Priority {
        if ops.is_unknown() {
            return self.update_priority;
        }
        let mut priority = Priority::Low;
        if ops.inserted {
            priority = priority.max(self.insert_priority);
        }
        if ops.updated {
            priority = priority.max(self.update_priority);
        }
        if ops.deleted {
            priority = priority.max(self.delete_priority);
        }
        priority
    }

    pub fn debounce(&self) -> Duration {
        clamped_secs(self.debounce_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionPolicy {
    /// Subscribe to file notifications when the store is a single file
    #[serde(default = "default_true")]
    pub use_file_notifications: bool,
    /// Checksum interval when no notifications are available
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    /// Checksum interval when notifications back it up
    #[serde(default = "default_notify_poll_interval")]
    pub notify_poll_interval_seconds: f64,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            use_file_notifications: true,
            poll_interval_seconds: default_poll_interval(),
            notify_poll_interval_seconds: default_notify_poll_interval(),
        }
    }
}

impl DetectionPolicy {
    pub fn checksum_interval(&self, notifications_active: bool) -> Duration {
        if notifications_active {
            clamped_secs(self.notify_poll_interval_seconds)
        } else {
            clamped_secs(self.poll_interval_seconds)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringPolicy {
    /// Consecutive failures before an alert fires
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u32,
    /// Recent results kept for status queries
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for MonitoringPolicy {
    fn default() -> Self {
        Self {
            alert_threshold: default_alert_threshold(),
            history_size: default_history_size(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_auth_type() -> AuthType {
    AuthType::Oauth2
}

fn default_token_path() -> Option<String> {
    Some("~/.config/jobmirror/token.json".to_string())
}

fn default_sheet_names() -> BTreeMap<String, String> {
    let mut names = BTreeMap::new();
    names.insert("executions".to_string(), "Executions".to_string());
    names.insert("variations".to_string(), "Variations".to_string());
    names
}

fn default_table_configs() -> BTreeMap<String, TableSyncPolicy> {
    let mut tables = BTreeMap::new();
    tables.insert("executions".to_string(), TableSyncPolicy::default());
    tables.insert(
        "variations".to_string(),
        TableSyncPolicy {
            enable_batching: true,
            ..TableSyncPolicy::default()
        },
    );
    tables
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_requests_per_window() -> u32 {
    100
}

fn default_window_seconds() -> u64 {
    100
}

fn default_burst_limit() -> u32 {
    10
}

fn default_queue_max_size() -> usize {
    1000
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_max_completed_age() -> u64 {
    3600
}

fn default_realtime_workers() -> usize {
    2
}

fn default_background_workers() -> usize {
    3
}

fn default_realtime_poll_interval() -> f64 {
    0.5
}

fn default_background_poll_interval() -> f64 {
    2.0
}

fn default_background_batch_size() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_shutdown_grace() -> f64 {
    10.0
}

fn default_high() -> Priority {
    Priority::High
}

fn default_medium() -> Priority {
    Priority::Medium
}

fn default_debounce_seconds() -> f64 {
    2.0
}

fn default_poll_interval() -> f64 {
    5.0
}

fn default_notify_poll_interval() -> f64 {
    10.0
}

fn default_alert_threshold() -> u32 {
    5
}

fn default_history_size() -> usize {
    50
}

/// Expand `~` and environment variables in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Default config document location (`~/.config/jobmirror/config.json`)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobmirror")
        .join("config.json")
}

impl SyncConfig {
    /// Load the `sync` block from a JSON document. A document without one
    /// yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_document(&content)
    }

    /// Parse the `sync` block out of a JSON document string
    pub fn from_document(content: &str) -> Result<Self> {
        let doc: serde_json::Value = serde_json::from_str(content)?;
        match doc.get(CONFIG_KEY) {
            Some(block) => serde_json::from_value(block.clone())
                .map_err(|e| MirrorError::Config(format!("Invalid sync block: {}", e))),
            None => Ok(Self::default()),
        }
    }

    /// Write this config into the document at `path`, keeping every other
    /// top-level key as it was.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut doc = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            if content.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            serde_json::Value::Object(Default::default())
        };

        let map = doc.as_object_mut().ok_or_else(|| {
            MirrorError::Config(format!("{} is not a JSON object", path.display()))
        })?;
        map.insert(CONFIG_KEY.to_string(), serde_json::to_value(self)?);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Tables that are enabled, in name order
    pub fn enabled_tables(&self) -> Vec<String> {
        self.table_configs
            .iter()
            .filter(|(_, policy)| policy.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn table_policy(&self, table: &str) -> Option<&TableSyncPolicy> {
        self.table_configs.get(table)
    }

    pub fn sheet_name(&self, table: &str) -> Option<&str> {
        self.target.sheet_names.get(table).map(String::as_str)
    }

    /// Every problem with this config; empty when valid
    pub fn validation_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        match self.auth.auth_type {
            AuthType::Oauth2 => {
                if is_blank(&self.auth.credentials_path) {
                    issues.push("auth.credentials_path is required for oauth2".to_string());
                }
                if is_blank(&self.auth.token_path) {
                    issues.push("auth.token_path is required for oauth2".to_string());
                }
            }
            AuthType::ServiceAccount => {
                if is_blank(&self.auth.service_account_path) {
                    issues.push(
                        "auth.service_account_path is required for service_account".to_string(),
                    );
                }
            }
        }

        if self.target.target_id.trim().is_empty() {
            issues.push("target.target_id must not be empty".to_string());
        }

        let rl = &self.rate_limit;
        for (name, value) in [
            ("rate_limit.requests_per_minute", rl.requests_per_minute as u64),
            ("rate_limit.requests_per_window", rl.requests_per_window as u64),
            ("rate_limit.window_seconds", rl.window_seconds),
            ("rate_limit.burst_limit", rl.burst_limit as u64),
            ("queue.max_size", self.queue.max_size as u64),
            (
                "queue.cleanup_interval_seconds",
                self.queue.cleanup_interval_seconds,
            ),
            (
                "queue.max_completed_age_seconds",
                self.queue.max_completed_age_seconds,
            ),
            (
                "workers.background_batch_size",
                self.workers.background_batch_size as u64,
            ),
            ("workers.max_attempts", self.workers.max_attempts as u64),
            (
                "monitoring.alert_threshold",
                self.monitoring.alert_threshold as u64,
            ),
            ("monitoring.history_size", self.monitoring.history_size as u64),
        ] {
            if value == 0 {
                issues.push(format!("{} must be positive", name));
            }
        }

        if self.workers.total_workers() == 0 {
            issues.push("workers: at least one realtime or background worker is required".into());
        }

        for (name, value) in [
            (
                "workers.realtime_poll_interval",
                self.workers.realtime_poll_interval,
            ),
            (
                "workers.background_poll_interval",
                self.workers.background_poll_interval,
            ),
            (
                "detection.poll_interval_seconds",
                self.detection.poll_interval_seconds,
            ),
            (
                "detection.notify_poll_interval_seconds",
                self.detection.notify_poll_interval_seconds,
            ),
        ] {
            if !(value.is_finite() && value > 0.0) {
                issues.push(format!("{} must be positive", name));
            } else if value > MAX_INTERVAL_SECONDS {
                issues.push(too_long(name));
            }
        }
        let grace = self.workers.shutdown_grace_seconds;
        if !(grace.is_finite() && grace >= 0.0) {
            issues.push("workers.shutdown_grace_seconds must not be negative".to_string());
        } else if grace > MAX_INTERVAL_SECONDS {
            issues.push(too_long("workers.shutdown_grace_seconds"));
        }

        let mut seen = HashSet::new();
        for (table, sheet) in &self.target.sheet_names {
            if sheet.trim().is_empty() {
                issues.push(format!("target.sheet_names.{} must not be empty", table));
                continue;
            }
            if sheet.contains(FORBIDDEN_SHEET_CHARS) {
                issues.push(format!(
                    "target.sheet_names.{} contains a forbidden character",
                    table
                ));
            }
            // sheet titles are unique case-insensitively
            if !seen.insert(sheet.to_lowercase()) {
                issues.push(format!("duplicate target sheet name: {}", sheet));
            }
        }

        for (table, policy) in &self.table_configs {
            if !(policy.debounce_seconds.is_finite() && policy.debounce_seconds >= 0.0) {
                issues.push(format!(
                    "table_configs.{}.debounce_seconds must not be negative",
                    table
                ));
            } else if policy.debounce_seconds > MAX_INTERVAL_SECONDS {
                issues.push(too_long(&format!("table_configs.{}.debounce_seconds", table)));
            }
            if policy.enabled && !self.target.sheet_names.contains_key(table) {
                issues.push(format!(
                    "table_configs.{} is enabled but has no target sheet name",
                    table
                ));
            }
        }

        issues
    }

    /// Fail fast on any configuration problem
    pub fn validate(&self) -> Result<()> {
        let issues = self.validation_issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(MirrorError::Config(issues.join("; ")))
        }
    }
}

fn too_long(name: &str) -> String {
    format!("{} must not exceed {} seconds", name, MAX_INTERVAL_SECONDS)
}

/// Seconds to a Duration without panicking on values validation would reject
fn clamped_secs(value: f64) -> Duration {
    if value.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(value.clamp(0.0, MAX_INTERVAL_SECONDS))
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}
