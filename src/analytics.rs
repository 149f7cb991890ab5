//! In-process request counters and a bounded latency sample buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::routing::Vendor;

const MAX_LATENCY_SAMPLES: usize = 200;

#[derive(Debug, Default)]
pub struct Analytics {
    total: AtomicU64,
    primary: AtomicU64,
    secondary: AtomicU64,
    fallback: AtomicU64,
    cache_hits: AtomicU64,
    cache_lookups: AtomicU64,
    latency_samples: Mutex<VecDeque<u64>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AnalyticsSnapshot {
    pub total: u64,
    pub primary: u64,
    pub secondary: u64,
    pub fallback: u64,
    pub cache_hits: u64,
    pub cache_lookups: u64,
    pub cache_hit_rate: f64,
    pub latency_p95_ms: u64,
}

impl Analytics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, vendor: Vendor, used_fallback: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match vendor {
            Vendor::Primary => self.primary.fetch_add(1, Ordering::Relaxed),
            Vendor::Secondary => self.secondary.fetch_add(1, Ordering::Relaxed),
        };
        if used_fallback {
            self.fallback.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Cache-served responses count toward totals but not per-vendor counters.
    pub fn record_cache_served(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        self.cache_lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_latency(&self, duration_ms: u64) {
        let mut samples = self.latency_samples.lock();
        samples.push_back(duration_ms);
        while samples.len() > MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
    }

    #[must_use]
    pub fn latency_p95(&self) -> u64 {
        let samples = self.latency_samples.lock();
        if samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)]
    }

    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return 0.0;
        }
        let hits = self.cache_hits.load(Ordering::Relaxed);
        (hits as f64 * 100.0 / lookups as f64 * 100.0).round() / 100.0
    }

    #[must_use]
    pub fn snapshot(&self) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            primary: self.primary.load(Ordering::Relaxed),
            secondary: self.secondary.load(Ordering::Relaxed),
            fallback: self.fallback.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_lookups: self.cache_lookups.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            latency_p95_ms: self.latency_p95(),
        }
    }
}
