//! End-to-end sync scenarios
//!
//! Each test wires a real job store to an in-memory mirror and drives the
//! pipeline the way a running service would. Timing-dependent tests run on
//! the real clock and poll for the expected state.
//!
//! Run with: cargo test --test sync_scenarios

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use jobmirror::config::SyncConfig;
use jobmirror::error::RemoteErrorKind;
use jobmirror::remote::MemoryMirror;
use jobmirror::storage::queries::{
    delete_execution, insert_execution, insert_variation, update_execution_status, NewExecution,
    NewVariation,
};
use jobmirror::storage::{RowSource, Storage};
use jobmirror::sync::{
    Admission, ChangeDetector, ChangeSource, ClaimFilter, DetectedChange, SyncQueue, SyncService,
};
use jobmirror::types::{CellValue, ChangeEvent, Priority};

const TARGET: &str = "target-1";

fn fast_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.enabled = true;
    config.target.target_id = TARGET.to_string();
    config.auth.credentials_path = Some("/etc/jobmirror/client.json".to_string());
    config.workers.realtime_poll_interval = 0.02;
    config.workers.background_poll_interval = 0.05;
    config.workers.shutdown_grace_seconds = 5.0;
    config.detection.poll_interval_seconds = 0.1;
    config.detection.notify_poll_interval_seconds = 0.1;
    config.rate_limit.burst_limit = 1000;
    config.rate_limit.requests_per_minute = 1000;
    config.rate_limit.requests_per_window = 1000;
    for policy in config.table_configs.values_mut() {
        policy.debounce_seconds = 0.05;
    }
    config
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    while !check() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn execution(id: &str) -> NewExecution {
    NewExecution {
        id: id.to_string(),
        preset: "base".to_string(),
        dataset: Some("imagenet-mini".to_string()),
        output_dir: None,
    }
}

fn sheet_len(mirror: &MemoryMirror, sheet: &str) -> Option<usize> {
    mirror.sheet_rows(TARGET, sheet).map(|rows| rows.len())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_changes_reach_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open_path(dir.path().join("jobs.db")).unwrap();
    let mirror = Arc::new(MemoryMirror::with_target(TARGET));
    let service = SyncService::new(fast_config(), Arc::new(storage.clone()), mirror.clone()).unwrap();
    service.start().unwrap();

    // startup reconcile writes both headers
    wait_until("initial headers", || {
        sheet_len(&mirror, "Executions") == Some(1) && sheet_len(&mirror, "Variations") == Some(1)
    })
    .await;

    storage
        .with_connection(|conn| insert_execution(conn, &execution("exec-1")))
        .unwrap();
    wait_until("inserted row", || {
        sheet_len(&mirror, "Executions") == Some(2)
    })
    .await;

    storage
        .with_connection(|conn| update_execution_status(conn, "exec-1", "completed", None))
        .unwrap();
    wait_until("updated status", || {
        mirror
            .sheet_rows(TARGET, "Executions")
            .and_then(|rows| rows.get(1).cloned())
            .is_some_and(|row| row.contains(&CellValue::Text("completed".to_string())))
    })
    .await;

    storage
        .with_connection(|conn| delete_execution(conn, "exec-1"))
        .unwrap();
    wait_until("deleted row", || {
        sheet_len(&mirror, "Executions") == Some(1)
    })
    .await;

    service.stop().await;
    assert!(!service.is_running());
    assert_eq!(mirror.overlaps(), 0);
    assert!(service.status().healthy);
}

#[tokio::test]
async fn test_burst_of_changes_enqueues_once() {
    struct BurstSource(usize);

    #[async_trait]
    impl ChangeSource for BurstSource {
        fn name(&self) -> &'static str {
            "burst"
        }

        async fn run(&mut self, sink: mpsc::Sender<DetectedChange>, cancel: CancellationToken) {
            for _ in 0..self.0 {
                let change = DetectedChange::new(ChangeEvent::filesystem("executions"));
                if sink.send(change).await.is_err() {
                    return;
                }
            }
            cancel.cancelled().await;
        }
    }

    let mut config = fast_config();
    for policy in config.table_configs.values_mut() {
        policy.debounce_seconds = 1.0;
    }
    let queue = Arc::new(SyncQueue::with_capacity(100));
    let storage = Storage::open_in_memory().unwrap();
    let detector = ChangeDetector::new(Arc::new(config), Arc::new(storage), queue.clone());
    detector.start_with(vec![Box::new(BurstSource(50))]).unwrap();

    // a worker draining the queue while the burst is still settling
    let mut synced = 0;
    wait_until("burst enqueued and drained", || {
        while let Some(task) = queue.try_dequeue(ClaimFilter::any()) {
            queue.complete(&task);
            synced += 1;
        }
        synced >= 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    detector.stop().await;

    assert_eq!(queue.stats().created, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_full_sync_is_idempotent() {
    let storage = Storage::open_in_memory().unwrap();
    storage
        .with_connection(|conn| {
            insert_execution(conn, &execution("exec-1"))?;
            insert_execution(conn, &execution("exec-2"))?;
            Ok(())
        })
        .unwrap();
    let mirror = Arc::new(MemoryMirror::with_target(TARGET));
    let service = SyncService::new(fast_config(), Arc::new(storage), mirror.clone()).unwrap();

    assert!(service.force_full_sync().await.success);
    assert!(service.force_full_sync().await.success);

    let writes: Vec<_> = mirror
        .writes()
        .into_iter()
        .filter(|w| w.sheet == "Executions")
        .collect();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0], writes[1]);
}

#[tokio::test]
async fn test_counts_match_rows_read() {
    let storage = Storage::open_in_memory().unwrap();
    storage
        .with_connection(|conn| {
            for i in 0..7 {
                insert_variation(
                    conn,
                    &NewVariation {
                        id: format!("var-{}", i),
                        execution_id: None,
                        name: format!("dropout-{}", i),
                        parameters: serde_json::json!({ "dropout": i as f64 / 10.0 }),
                    },
                )?;
            }
            Ok(())
        })
        .unwrap();
    let mirror = Arc::new(MemoryMirror::with_target(TARGET));
    let service =
        SyncService::new(fast_config(), Arc::new(storage.clone()), mirror.clone()).unwrap();

    let result = service.force_full_sync().await;
    assert!(result.success);
    for table in ["executions", "variations"] {
        assert_eq!(
            result.synced_counts_by_table[table],
            storage.list_rows(table).unwrap().len()
        );
    }
    assert_eq!(sheet_len(&mirror, "Variations"), Some(8));
    assert_eq!(sheet_len(&mirror, "Executions"), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_never_overlap() {
    let storage = Storage::open_in_memory().unwrap();
    storage
        .with_connection(|conn| insert_execution(conn, &execution("exec-1")))
        .unwrap();
    let mirror =
        Arc::new(MemoryMirror::with_target(TARGET).with_latency(Duration::from_millis(10)));
    let service = Arc::new(
        SyncService::new(fast_config(), Arc::new(storage), mirror.clone()).unwrap(),
    );
    service.start_with_sources(Vec::new()).unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let forced = service.clone();
        handles.push(tokio::spawn(async move { forced.force_full_sync().await }));
        service.queue().enqueue("executions", Priority::Critical, false);
        service.queue().enqueue("variations", Priority::Low, true);
    }
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }
    wait_until("queue drained", || {
        service.queue().is_empty() && service.queue().in_flight() == 0
    })
    .await;
    service.stop().await;

    assert_eq!(mirror.overlaps(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flood_respects_burst_limit() {
    let mut config = fast_config();
    config.rate_limit.burst_limit = 5;
    let storage = Storage::open_in_memory().unwrap();
    let mirror = Arc::new(MemoryMirror::with_target(TARGET));
    let service = Arc::new(SyncService::new(config, Arc::new(storage), mirror.clone()).unwrap());

    let syncs: Vec<_> = (0..3)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.force_full_sync().await })
        })
        .collect();
    for sync in syncs {
        assert!(sync.await.unwrap().success);
    }

    let calls = mirror.calls();
    assert!(calls.len() > 5);
    for (i, first) in calls.iter().enumerate() {
        let within = calls[i..]
            .iter()
            .filter(|c| c.at.duration_since(first.at) < Duration::from_millis(900))
            .count();
        assert!(within <= 5, "{} calls inside one burst window", within);
    }
}

#[tokio::test]
async fn test_full_queue_evicts_low_for_critical() {
    let queue = SyncQueue::with_capacity(3);
    for table in ["a", "b", "c"] {
        assert_eq!(queue.enqueue(table, Priority::Low, false), Admission::Created);
    }
    assert_eq!(queue.enqueue("d", Priority::Low, false), Admission::Rejected);
    assert_eq!(queue.len(), 3);

    let admission = queue.enqueue("e", Priority::Critical, false);
    assert_eq!(
        admission,
        Admission::Evicted {
            evicted_table: "a".to_string()
        }
    );
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.pending_priority("e"), Some(Priority::Critical));
}

#[tokio::test]
async fn test_empty_table_writes_header_only() {
    let storage = Storage::open_in_memory().unwrap();
    let columns = storage.columns("executions").unwrap();
    let mirror = Arc::new(MemoryMirror::with_target(TARGET));
    let service = SyncService::new(fast_config(), Arc::new(storage), mirror.clone()).unwrap();

    let result = service.force_full_sync().await;
    assert_eq!(result.synced_counts_by_table["executions"], 0);

    let rows = mirror.sheet_rows(TARGET, "Executions").unwrap();
    assert_eq!(rows.len(), 1);
    let header: Vec<CellValue> = columns.into_iter().map(CellValue::Text).collect();
    assert_eq!(rows[0], header);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_auth_failure_isolated_to_its_table() {
    let storage = Storage::open_in_memory().unwrap();
    let mirror = Arc::new(MemoryMirror::with_target(TARGET));
    mirror.fail_always(Some("Executions"), RemoteErrorKind::Auth);
    let service = SyncService::new(fast_config(), Arc::new(storage), mirror.clone()).unwrap();
    service.start_with_sources(Vec::new()).unwrap();

    service.queue().enqueue("executions", Priority::High, false);
    service.queue().enqueue("variations", Priority::High, false);

    wait_until("variations synced", || {
        sheet_len(&mirror, "Variations") == Some(1)
    })
    .await;
    wait_until("executions marked failed", || {
        service
            .health()
            .table_health("executions")
            .is_some_and(|h| h.permanent_failure)
    })
    .await;
    service.stop().await;

    let tables = service.status().tables;
    assert!(tables["variations"].healthy);
    assert!(!tables["executions"].healthy);
    assert_eq!(tables["executions"].consecutive_failures, 1);
    assert_eq!(service.queue().stats().failed, 1);
}
