//! Property-based tests for jobmirror
//!
//! These tests verify invariants that must hold for all inputs:
//! - The queue never holds more than one pending task per table
//! - The queue never grows past its capacity
//! - Claims come out highest priority first
//! - Rate budgets are never exceeded
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

use jobmirror::types::Priority;

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Medium),
        Just(Priority::High),
        Just(Priority::Critical),
    ]
}

// ============================================================================
// QUEUE TESTS
// ============================================================================

mod queue_tests {
    use super::*;
    use std::collections::HashSet;

    use jobmirror::sync::{ClaimFilter, SyncQueue};

    proptest! {
        /// Invariant: pending tasks never exceed capacity, whatever arrives
        #[test]
        fn bounded(
            capacity in 1usize..20,
            requests in prop::collection::vec((0usize..40, priority(), any::<bool>()), 0..200),
        ) {
            let queue = SyncQueue::with_capacity(capacity);
            for (table, priority, batched) in requests {
                queue.enqueue(&format!("table_{}", table), priority, batched);
                prop_assert!(queue.len() <= capacity);
            }
        }

        /// Invariant: at most one pending task per table
        #[test]
        fn one_pending_per_table(
            requests in prop::collection::vec((0usize..8, priority()), 1..100),
        ) {
            let queue = SyncQueue::with_capacity(100);
            let mut tables = HashSet::new();
            for (table, priority) in &requests {
                let name = format!("table_{}", table);
                queue.enqueue(&name, *priority, false);
                tables.insert(name);
            }
            prop_assert_eq!(queue.len(), tables.len());

            let stats = queue.stats();
            prop_assert_eq!(stats.created as usize, tables.len());
            prop_assert_eq!(stats.coalesced as usize, requests.len() - tables.len());
        }

        /// Invariant: a coalesced task carries the highest requested priority
        #[test]
        fn coalesced_priority_is_max(priorities in prop::collection::vec(priority(), 1..30)) {
            let queue = SyncQueue::with_capacity(10);
            for priority in &priorities {
                queue.enqueue("executions", *priority, false);
            }
            let expected = priorities.iter().copied().max();
            prop_assert_eq!(queue.pending_priority("executions"), expected);
        }

        /// Invariant: draining yields priorities in non-increasing order
        #[test]
        fn drains_by_priority(
            requests in prop::collection::vec((0usize..30, priority()), 1..60),
        ) {
            let queue = SyncQueue::with_capacity(100);
            for (table, priority) in requests {
                queue.enqueue(&format!("table_{}", table), priority, false);
            }

            let mut last = Priority::Critical;
            while let Some(task) = queue.try_dequeue(ClaimFilter::any()) {
                prop_assert!(task.priority <= last);
                last = task.priority;
                queue.complete(&task);
            }
            prop_assert!(queue.is_empty());
        }

        /// Invariant: the realtime filter only ever claims urgent, unbatched work
        #[test]
        fn realtime_claims_urgent_only(
            requests in prop::collection::vec((0usize..20, priority(), any::<bool>()), 1..60),
        ) {
            let queue = SyncQueue::with_capacity(100);
            for (table, priority, batched) in requests {
                queue.enqueue(&format!("table_{}", table), priority, batched);
            }
            while let Some(task) = queue.try_dequeue(ClaimFilter::realtime()) {
                prop_assert!(task.priority.is_urgent());
                prop_assert!(!task.batched);
            }
        }
    }
}

// ============================================================================
// RATE LIMITER TESTS
// ============================================================================

mod rate_limit_tests {
    use super::*;
    use jobmirror::config::RateLimitPolicy;
    use jobmirror::sync::RateLimiter;

    proptest! {
        /// Invariant: back-to-back attempts succeed exactly up to the tightest budget
        #[test]
        fn immediate_admissions_match_tightest_budget(
            per_minute in 1u32..50,
            per_window in 1u32..50,
            burst in 1u32..50,
            attempts in 0usize..120,
        ) {
            let limiter = RateLimiter::new(&RateLimitPolicy {
                requests_per_minute: per_minute,
                requests_per_window: per_window,
                window_seconds: 100,
                burst_limit: burst,
            });
            let admitted = (0..attempts).filter(|_| limiter.try_acquire().is_ok()).count();
            let tightest = per_minute.min(per_window).min(burst) as usize;
            prop_assert_eq!(admitted, attempts.min(tightest));
        }
    }
}

// ============================================================================
// BACKOFF TESTS
// ============================================================================

mod backoff_tests {
    use super::*;
    use std::time::Duration;

    use jobmirror::sync::{calculate_backoff, retry_delay};

    proptest! {
        /// Invariant: backoff never decreases and never passes the cap
        #[test]
        fn monotonic_and_capped(attempt in 1u32..1000) {
            let current = calculate_backoff(attempt);
            prop_assert!(current <= Duration::from_secs(60));
            prop_assert!(calculate_backoff(attempt + 1) >= current);
        }

        /// Invariant: jitter only ever adds, and stays within the cap
        #[test]
        fn jitter_bounded(attempt in 1u32..20) {
            let delay = retry_delay(attempt);
            let base = calculate_backoff(attempt);
            prop_assert!(delay >= base);
            prop_assert!(delay <= Duration::from_secs(60));
            prop_assert!(delay <= base.mul_f64(1.2) + Duration::from_millis(1));
        }
    }
}

// ============================================================================
// PRIORITY AND CELL TESTS
// ============================================================================

mod value_tests {
    use super::*;
    use jobmirror::remote::column_letter;
    use jobmirror::types::{CellValue, StoreValue};

    proptest! {
        /// Invariant: priority names parse back case-insensitively
        #[test]
        fn priority_roundtrip(priority in priority(), upper in any::<bool>()) {
            let name = if upper {
                priority.as_str().to_uppercase()
            } else {
                priority.as_str().to_string()
            };
            prop_assert_eq!(name.parse::<Priority>(), Ok(priority));
        }

        /// Invariant: unknown priority names are rejected
        #[test]
        fn unknown_priority_fails(s in "[a-z]{5,20}") {
            prop_assume!(!["medium", "critical"].contains(&s.as_str()));
            prop_assert!(s.parse::<Priority>().is_err());
        }

        /// Invariant: every cell serializes to a JSON primitive
        #[test]
        fn cells_serialize_as_primitives(
            value in prop_oneof![
                any::<i64>().prop_map(StoreValue::Integer),
                any::<f64>().prop_map(StoreValue::Real),
                "\\PC{0,40}".prop_map(StoreValue::Text),
                prop::collection::vec(any::<u8>(), 0..32).prop_map(StoreValue::Blob),
                any::<bool>().prop_map(StoreValue::Bool),
                Just(StoreValue::Null),
            ]
        ) {
            let json = serde_json::to_value(value.to_cell()).unwrap();
            prop_assert!(!json.is_array() && !json.is_object() && !json.is_null());
        }

        /// Invariant: integers survive flattening unchanged
        #[test]
        fn integers_preserved(i in any::<i64>()) {
            prop_assert_eq!(StoreValue::Integer(i).to_cell(), CellValue::Integer(i));
            prop_assert_eq!(serde_json::to_value(CellValue::Integer(i)).unwrap(), serde_json::json!(i));
        }

        /// Invariant: column letters are uppercase and grow with the index
        #[test]
        fn column_letters(index in 1usize..20000) {
            let letters = column_letter(index);
            prop_assert!(!letters.is_empty());
            prop_assert!(letters.chars().all(|c| c.is_ascii_uppercase()));
            prop_assert!(column_letter(index + 1).len() >= letters.len());
        }
    }
}

// ============================================================================
// CHECKSUM TESTS
// ============================================================================

mod checksum_tests {
    use super::*;
    use jobmirror::sync::{checksum, TableSnapshot};
    use jobmirror::types::RowFingerprint;

    fn fingerprints() -> impl Strategy<Value = Vec<RowFingerprint>> {
        prop::collection::btree_map(
            "[a-z0-9]{4,12}",
            (
                prop::option::of("pending|running|done|failed"),
                prop::option::of("2026-0[1-9]-1[0-9]"),
            ),
            0..30,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .map(|(id, (status, updated_at))| RowFingerprint {
                    id,
                    status,
                    updated_at,
                })
                .collect()
        })
    }

    proptest! {
        /// Invariant: the checksum is a deterministic 64-char hex digest
        #[test]
        fn deterministic(rows in fingerprints()) {
            let first = checksum(&rows).unwrap();
            prop_assert_eq!(first.len(), 64);
            prop_assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
            prop_assert_eq!(first, checksum(&rows).unwrap());
        }

        /// Invariant: identical snapshots diff to nothing
        #[test]
        fn self_diff_is_empty(rows in fingerprints()) {
            let snapshot = TableSnapshot::from_fingerprints(&rows).unwrap();
            let ops = snapshot.diff(&snapshot);
            prop_assert!(!ops.inserted && !ops.updated && !ops.deleted);
        }

        /// Invariant: dropping a row is reported as a delete and changes the hash
        #[test]
        fn removal_detected(rows in fingerprints()) {
            prop_assume!(!rows.is_empty());
            let before = TableSnapshot::from_fingerprints(&rows).unwrap();
            let after = TableSnapshot::from_fingerprints(&rows[1..]).unwrap();
            prop_assert!(before.diff(&after).deleted);
            prop_assert_ne!(before.checksum, after.checksum);
        }
    }
}
