//! Per-request wall-clock budget arithmetic.
//!
//! The budget is the total time allocated to the whole request; every
//! adapter deadline is derived from what remains.

use std::time::{Duration, Instant};

/// Remaining budget for a request started at `start`, never negative.
#[must_use]
pub fn remaining_budget(start: Instant, budget_ms: u64) -> Duration {
    let elapsed = start.elapsed();
    Duration::from_millis(budget_ms).saturating_sub(elapsed)
}

#[must_use]
pub fn budget_exceeded(start: Instant, budget_ms: u64) -> bool {
    remaining_budget(start, budget_ms).is_zero()
}

/// Remaining budget as a timeout, floored at 100ms to avoid zero timeouts.
#[must_use]
pub fn budget_timeout(start: Instant, budget_ms: u64) -> Duration {
    remaining_budget(start, budget_ms).max(Duration::from_millis(100))
}

/// Deadline for one adapter call: the vendor timeout capped by what is left
/// of the request budget.
#[must_use]
pub fn adapter_deadline(start: Instant, budget_ms: u64, vendor_timeout_ms: u64) -> Duration {
    remaining_budget(start, budget_ms).min(Duration::from_millis(vendor_timeout_ms))
}
