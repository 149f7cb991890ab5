//! Global and per-user circuit breakers.
//!
//! The global breaker gates a vendor for everyone after repeated failures in
//! a short window. The per-user breaker tracks failures per user id so one
//! user's pathological sessions do not keep hammering the local vendor.
//! Reads never mutate; probe traffic never reaches either breaker.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::routing::Vendor;
use crate::util::unix_now_secs;

const GLOBAL_CB_THRESHOLD: u32 = 3;
const GLOBAL_CB_WINDOW_SECS: u64 = 60;
const GLOBAL_CB_COOLDOWN_SECS: u64 = 120;
const USER_CB_MAP_SWEEP_LEN: usize = 1024;

#[derive(Debug, Default, Clone, Copy)]
struct GlobalState {
    failures: u32,
    last_failure_ts: u64,
    open: bool,
}

/// Circuit breaker shared by all callers of a vendor.
#[derive(Debug, Default)]
pub struct GlobalBreaker {
    primary: Mutex<GlobalState>,
    secondary: Mutex<GlobalState>,
}

impl GlobalBreaker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, vendor: Vendor) -> &Mutex<GlobalState> {
        match vendor {
            Vendor::Primary => &self.primary,
            Vendor::Secondary => &self.secondary,
        }
    }

    /// Whether the breaker currently blocks this vendor. Past the cooldown
    /// the circuit half-opens: calls flow again and the first success resets.
    #[must_use]
    pub fn is_open(&self, vendor: Vendor) -> bool {
        self.is_open_at(vendor, unix_now_secs())
    }

    #[must_use]
    pub fn is_open_at(&self, vendor: Vendor, now: u64) -> bool {
        let state = self.state(vendor).lock();
        state.open && now.saturating_sub(state.last_failure_ts) < GLOBAL_CB_COOLDOWN_SECS
    }

    pub fn record_failure(&self, vendor: Vendor) {
        self.record_failure_at(vendor, unix_now_secs());
    }

    pub fn record_failure_at(&self, vendor: Vendor, now: u64) {
        let mut state = self.state(vendor).lock();
        if now.saturating_sub(state.last_failure_ts) > GLOBAL_CB_WINDOW_SECS {
            state.failures = 1;
        } else {
            state.failures = state.failures.saturating_add(1);
        }
        state.last_failure_ts = now;
        if state.failures >= GLOBAL_CB_THRESHOLD && !state.open {
            state.open = true;
            tracing::warn!(
                vendor = %vendor,
                failures = state.failures,
                "global circuit breaker opened"
            );
        }
    }

    pub fn record_success(&self, vendor: Vendor) {
        let mut state = self.state(vendor).lock();
        if state.open || state.failures > 0 {
            tracing::info!(vendor = %vendor, "global circuit breaker reset");
        }
        *state = GlobalState::default();
    }
}

/// Per-user failure tracker. Threshold and cooldown come from the caller's
/// rules snapshot so hot reload applies immediately.
#[derive(Debug, Default)]
pub struct UserBreaker {
    entries: Mutex<FxHashMap<String, (u32, u64)>>,
}

impl UserBreaker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only check; never mutates the map.
    #[must_use]
    pub fn is_open(&self, user_id: &str, threshold: u32, cooldown_secs: u64) -> bool {
        self.is_open_at(user_id, threshold, cooldown_secs, unix_now_secs())
    }

    #[must_use]
    pub fn is_open_at(
        &self,
        user_id: &str,
        threshold: u32,
        cooldown_secs: u64,
        now: u64,
    ) -> bool {
        let entries = self.entries.lock();
        entries.get(user_id).is_some_and(|(failures, last_ts)| {
            *failures >= threshold && now.saturating_sub(*last_ts) < cooldown_secs
        })
    }

    pub fn record_failure(&self, user_id: &str, cooldown_secs: u64) {
        self.record_failure_at(user_id, cooldown_secs, unix_now_secs());
    }

    pub fn record_failure_at(&self, user_id: &str, cooldown_secs: u64, now: u64) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(user_id.to_string()).or_insert((0, now));
        // Rolling window: stale streaks restart at one.
        if now.saturating_sub(entry.1) > cooldown_secs {
            entry.0 = 1;
        } else {
            entry.0 = entry.0.saturating_add(1);
        }
        entry.1 = now;

        if entries.len() > USER_CB_MAP_SWEEP_LEN {
            entries.retain(|_, (_, last_ts)| now.saturating_sub(*last_ts) < cooldown_secs);
        }
    }

    /// A successful call for this user clears their entry entirely.
    pub fn record_success(&self, user_id: &str) {
        self.entries.lock().remove(user_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
