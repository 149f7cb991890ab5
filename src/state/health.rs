//! Per-vendor health probes with exponential backoff and post-success
//! throttle.
//!
//! Health flags are read on every routing decision, so reads are a single
//! atomic load. All mutation happens here; caller-visible failures are the
//! breakers' business, never this module's.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::routing::Vendor;
use crate::util::unix_now_secs;

const INITIAL_CHECK_DELAY_SECS: u64 = 5;
const MAX_CHECK_DELAY_SECS: u64 = 300;
const SUCCESS_THROTTLE_SECS: u64 = 60;
const PROBE_TICK_SECS: u64 = 5;

/// Point-in-time copy of one vendor's health state.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct VendorHealthSnapshot {
    pub healthy: bool,
    pub ever_succeeded: bool,
    pub last_success_ts: u64,
    pub last_check_ts: u64,
    pub consecutive_failures: u32,
    pub next_check_delay_secs: u64,
}

#[derive(Debug)]
struct ProbeState {
    ever_succeeded: bool,
    last_success_ts: u64,
    last_check_ts: u64,
    consecutive_failures: u32,
    next_check_delay_secs: u64,
}

impl Default for ProbeState {
    fn default() -> Self {
        Self {
            ever_succeeded: false,
            last_success_ts: 0,
            last_check_ts: 0,
            consecutive_failures: 0,
            next_check_delay_secs: INITIAL_CHECK_DELAY_SECS,
        }
    }
}

#[derive(Debug, Default)]
struct VendorSlot {
    // Read on every pick; vendors start healthy so a gated-off probe loop
    // never blocks routing.
    healthy_is_false: AtomicBool,
    probe: Mutex<ProbeState>,
}

/// Registry owning both vendors' health state.
#[derive(Debug, Default)]
pub struct VendorHealthRegistry {
    primary: VendorSlot,
    secondary: VendorSlot,
}

impl VendorHealthRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, vendor: Vendor) -> &VendorSlot {
        match vendor {
            Vendor::Primary => &self.primary,
            Vendor::Secondary => &self.secondary,
        }
    }

    /// Lock-free health read used by the picker.
    #[must_use]
    pub fn is_healthy(&self, vendor: Vendor) -> bool {
        !self.slot(vendor).healthy_is_false.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn snapshot(&self, vendor: Vendor) -> VendorHealthSnapshot {
        let slot = self.slot(vendor);
        let probe = slot.probe.lock();
        VendorHealthSnapshot {
            healthy: !slot.healthy_is_false.load(Ordering::Acquire),
            ever_succeeded: probe.ever_succeeded,
            last_success_ts: probe.last_success_ts,
            last_check_ts: probe.last_check_ts,
            consecutive_failures: probe.consecutive_failures,
            next_check_delay_secs: probe.next_check_delay_secs,
        }
    }

    /// Whether a probe should run now, per backoff and success throttle.
    #[must_use]
    pub fn probe_due(&self, vendor: Vendor, now: u64) -> bool {
        let probe = self.slot(vendor).probe.lock();
        if probe.ever_succeeded {
            now.saturating_sub(probe.last_success_ts) >= SUCCESS_THROTTLE_SECS
                && now.saturating_sub(probe.last_check_ts) >= SUCCESS_THROTTLE_SECS
        } else {
            now.saturating_sub(probe.last_check_ts) >= probe.next_check_delay_secs
        }
    }

    /// Record one probe outcome; toggles the health flag and advances the
    /// backoff schedule.
    pub fn record_probe_outcome(&self, vendor: Vendor, now: u64, ok: bool) {
        let slot = self.slot(vendor);
        let mut probe = slot.probe.lock();
        probe.last_check_ts = now;
        if ok {
            probe.ever_succeeded = true;
            probe.last_success_ts = now;
            probe.consecutive_failures = 0;
            probe.next_check_delay_secs = INITIAL_CHECK_DELAY_SECS;
            slot.healthy_is_false.store(false, Ordering::Release);
            tracing::debug!(vendor = %vendor, "vendor probe succeeded");
        } else {
            probe.consecutive_failures = probe.consecutive_failures.saturating_add(1);
            probe.next_check_delay_secs =
                (probe.next_check_delay_secs * 2).min(MAX_CHECK_DELAY_SECS);
            slot.healthy_is_false.store(true, Ordering::Release);
            tracing::warn!(
                vendor = %vendor,
                consecutive_failures = probe.consecutive_failures,
                next_check_in_secs = probe.next_check_delay_secs,
                "vendor probe failed"
            );
        }
    }

    /// Force-set a vendor health flag. Test and startup seam only.
    pub fn set_healthy(&self, vendor: Vendor, healthy: bool) {
        self.slot(vendor)
            .healthy_is_false
            .store(!healthy, Ordering::Release);
    }
}

/// Drive the probe loop for one vendor. Ticks on a jittered interval and
/// consults [`VendorHealthRegistry::probe_due`] before each probe, so the
/// effective cadence follows the backoff schedule, not the tick.
pub async fn run_probe_loop<P, F>(registry: Arc<VendorHealthRegistry>, vendor: Vendor, probe: P)
where
    P: Fn() -> F + Send + 'static,
    F: Future<Output = Result<(), String>> + Send,
{
    loop {
        let jitter_ms = u64::from(fastrand::u16(0..1000));
        tokio::time::sleep(Duration::from_secs(PROBE_TICK_SECS) + Duration::from_millis(jitter_ms))
            .await;

        let now = unix_now_secs();
        if !registry.probe_due(vendor, now) {
            continue;
        }
        let outcome = probe().await;
        if let Err(ref error) = outcome {
            tracing::debug!(vendor = %vendor, error = %error, "probe call returned error");
        }
        registry.record_probe_outcome(vendor, unix_now_secs(), outcome.is_ok());
    }
}
