//! Admission control for remote API calls
//!
//! The three budgets (per minute, per configured window, one-second burst)
//! are folded into a single GCRA quota. A GCRA limiter with burst `b` and
//! replenish period `t` admits at most `b + ceil(w / t) - 1` calls in any
//! window of length `w`. Taking the smallest limit as the burst and
//! stretching the period to `w / (limit - b + 1)` for every budget keeps each
//! sliding window at or under its limit.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota};

use crate::config::RateLimitPolicy;

const MINUTE: Duration = Duration::from_secs(60);
const BURST_WINDOW: Duration = Duration::from_secs(1);

/// A single budget: at most `limit` calls in any `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub limit: u32,
    pub window: Duration,
}

/// One quota that satisfies every budget, or None when there is nothing to
/// enforce
pub fn combined_quota(budgets: &[Budget]) -> Option<Quota> {
    let burst = budgets.iter().map(|b| b.limit).min()?;
    let period = budgets
        .iter()
        .map(|b| {
            let spread = u128::from(b.limit - burst + 1);
            // rounding down would let one extra call into the window
            let nanos = b.window.as_nanos().div_ceil(spread);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        })
        .max()?;
    let burst = NonZeroU32::new(burst)?;
    Some(Quota::with_period(period)?.allow_burst(burst))
}

pub struct RateLimiter {
    budgets: Vec<Budget>,
    quota: Option<Quota>,
    limiter: Option<DefaultDirectRateLimiter>,
    admitted: AtomicU64,
}

impl RateLimiter {
    pub fn new(policy: &RateLimitPolicy) -> Self {
        Self::with_budgets(vec![
            Budget {
                limit: policy.requests_per_minute,
                window: MINUTE,
            },
            Budget {
                limit: policy.requests_per_window,
                window: Duration::from_secs(policy.window_seconds),
            },
            Budget {
                limit: policy.burst_limit,
                window: BURST_WINDOW,
            },
        ])
    }

    pub fn with_budgets(budgets: Vec<Budget>) -> Self {
        let budgets: Vec<Budget> = budgets
            .into_iter()
            .filter(|b| !b.window.is_zero())
            .map(|b| Budget {
                limit: b.limit.max(1),
                window: b.window,
            })
            .collect();
        let quota = combined_quota(&budgets);
        Self {
            budgets,
            quota,
            limiter: quota.map(governor::RateLimiter::direct),
            admitted: AtomicU64::new(0),
        }
    }

    pub fn budgets(&self) -> &[Budget] {
        &self.budgets
    }

    pub fn quota(&self) -> Option<Quota> {
        self.quota
    }

    /// Take a slot now if one is free; otherwise report the wait
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        if let Some(limiter) = &self.limiter {
            limiter
                .check()
                .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))?;
        }
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait for a slot and take it. Returns how long the caller was held.
    pub async fn acquire(&self) -> Duration {
        let start = Instant::now();
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        self.admitted.fetch_add(1, Ordering::Relaxed);

        let waited = start.elapsed();
        if waited >= Duration::from_millis(1) {
            tracing::debug!(waited_ms = waited.as_millis() as u64, "rate_limited");
        }
        waited
    }

    /// Calls admitted since startup
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }
}
