//! Filesystem notification change source
//!
//! Watches the directory holding the store file (SQLite writes may land in
//! the `-wal`/`-journal` sibling first) and reports a change for every
//! tracked table when any of the store files is modified.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::detector::{ChangeSource, DetectedChange};
use crate::error::{MirrorError, Result};
use crate::types::ChangeEvent;

const RAW_EVENT_CAPACITY: usize = 64;

pub struct NotifyChangeSource {
    tables: Vec<String>,
    file_names: HashSet<OsString>,
    // dropping the watcher releases the subscription
    watcher: Option<RecommendedWatcher>,
    raw_events: mpsc::Receiver<Event>,
}

impl NotifyChangeSource {
    /// Subscribe to modifications of `paths`, which must share a directory
    pub fn new(paths: Vec<PathBuf>, tables: Vec<String>) -> Result<Self> {
        let first = paths
            .first()
            .ok_or_else(|| MirrorError::Watcher("no paths to watch".into()))?;
        let dir = first
            .parent()
            .map(|p| {
                if p.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    p.to_path_buf()
                }
            })
            .ok_or_else(|| MirrorError::Watcher(format!("{} has no parent", first.display())))?;
        let file_names = paths
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_os_string()))
            .collect();

        let (tx, raw_events) = mpsc::channel(RAW_EVENT_CAPACITY);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            // a full channel already carries a pending signal
            Ok(event) => {
                let _ = tx.try_send(event);
            }
            Err(e) => tracing::warn!(error = %e, "file_watch_error"),
        })
        .map_err(|e| MirrorError::Watcher(e.to_string()))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| MirrorError::Watcher(e.to_string()))?;

        tracing::info!(dir = %dir.display(), "file_watch_started");
        Ok(Self {
            tables,
            file_names,
            watcher: Some(watcher),
            raw_events,
        })
    }

    fn is_relevant(&self, event: &Event) -> bool {
        let kind_matches = matches!(
            event.kind,
            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
        );
        kind_matches
            && event.paths.iter().any(|p| {
                p.file_name()
                    .is_some_and(|name| self.file_names.contains(name))
            })
    }
}

#[async_trait]
impl ChangeSource for NotifyChangeSource {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn run(&mut self, sink: mpsc::Sender<DetectedChange>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.raw_events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !self.is_relevant(&event) {
                continue;
            }
            for table in &self.tables {
                if sink
                    .send(DetectedChange::new(ChangeEvent::filesystem(table)))
                    .await
                    .is_err()
                {
                    self.watcher.take();
                    return;
                }
            }
        }
        self.watcher.take();
        tracing::debug!("file_watch_stopped");
    }
}
