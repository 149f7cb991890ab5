//! Deterministic post-call bookkeeping.
//!
//! Five independent steps run after every terminal outcome: history,
//! analytics, memory extraction, claims, and cache write-through. Each step
//! is best-effort with its own bounded timeout; a failure in one never
//! aborts the others. On client cancellation only history and analytics run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::analytics::Analytics;
use crate::cache::SemanticCache;
use crate::memory::{extract_claims, extract_memory_facts, FactStore};
use crate::policy::RouterRules;
use crate::routing::Vendor;

const STEP_TIMEOUT: Duration = Duration::from_millis(750);
const HISTORY_MAX_ENTRIES: usize = 512;

/// Everything the pipeline needs about one finished request.
#[derive(Debug, Clone)]
pub struct PostCallData {
    pub request_id: String,
    pub user_id: String,
    pub prompt: String,
    pub response_text: String,
    /// "primary", "secondary", or "cache".
    pub vendor: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub latency_ms: u64,
    pub vendor_enum: Option<Vendor>,
    pub used_fallback: bool,
    pub cache_id: Option<String>,
    pub cache_hit: bool,
    pub cancelled: bool,
    pub error: bool,
}

/// Per-step success flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostCallResult {
    pub history: bool,
    pub analytics: bool,
    pub memory: bool,
    pub claims: bool,
    pub cache_write: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryRecord {
    pub ts: u64,
    pub request_id: String,
    pub user_id: String,
    pub vendor: String,
    pub model: String,
    pub prompt_len: usize,
    pub response_len: usize,
    pub latency_ms: u64,
    pub cancelled: bool,
    pub error: bool,
}

/// Bounded in-process request history.
#[derive(Debug, Default)]
pub struct HistoryStore {
    records: Mutex<VecDeque<HistoryRecord>>,
}

impl HistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: HistoryRecord) {
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > HISTORY_MAX_ENTRIES {
            records.pop_front();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn recent(&self, count: usize) -> Vec<HistoryRecord> {
        let records = self.records.lock();
        records.iter().rev().take(count).cloned().collect()
    }
}

/// Owns the stores the pipeline writes into.
pub struct PostCallPipeline {
    pub history: Arc<HistoryStore>,
    pub analytics: Arc<Analytics>,
    pub memories: Arc<FactStore>,
    pub claims: Arc<FactStore>,
    pub cache: Arc<SemanticCache>,
}

impl PostCallPipeline {
    #[must_use]
    pub fn new(analytics: Arc<Analytics>, cache: Arc<SemanticCache>) -> Self {
        Self {
            history: Arc::new(HistoryStore::new()),
            analytics,
            memories: Arc::new(FactStore::new()),
            claims: Arc::new(FactStore::new()),
            cache,
        }
    }

    /// Run every applicable step and record per-step outcomes.
    pub async fn run(&self, data: &PostCallData, rules: &RouterRules) -> PostCallResult {
        let mut result = PostCallResult::default();

        let history = Arc::clone(&self.history);
        let record = HistoryRecord {
            ts: crate::util::unix_now_secs(),
            request_id: data.request_id.clone(),
            user_id: data.user_id.clone(),
            vendor: data.vendor.clone(),
            model: data.model.clone(),
            prompt_len: data.prompt.len(),
            response_len: data.response_text.len(),
            latency_ms: data.latency_ms,
            cancelled: data.cancelled,
            error: data.error,
        };
        result.history = run_step("history", move || history.append(record)).await;

        let analytics = Arc::clone(&self.analytics);
        let vendor_enum = data.vendor_enum;
        let used_fallback = data.used_fallback;
        let latency_ms = data.latency_ms;
        result.analytics = run_step("analytics", move || {
            match vendor_enum {
                Some(vendor) => analytics.record_call(vendor, used_fallback),
                None => analytics.record_cache_served(),
            }
            analytics.record_latency(latency_ms);
        })
        .await;

        // Cancelled requests keep their bookkeeping but skip derived work.
        if data.cancelled {
            return result;
        }
        let clean_success = !data.error;

        if clean_success {
            let memories = Arc::clone(&self.memories);
            let user_id = data.user_id.clone();
            let prompt = data.prompt.clone();
            result.memory = run_step("memory", move || {
                let facts = extract_memory_facts(&prompt);
                memories.append(&user_id, &facts);
            })
            .await;

            let claim_store = Arc::clone(&self.claims);
            let user_id = data.user_id.clone();
            let response_text = data.response_text.clone();
            result.claims = run_step("claims", move || {
                let claims = extract_claims(&response_text);
                claim_store.append(&user_id, &claims);
            })
            .await;
        }

        if clean_success && !data.cache_hit {
            if let Some(cache_id) = data.cache_id.clone() {
                let cache = Arc::clone(&self.cache);
                let response_text = data.response_text.clone();
                let max_entries = rules.cache_max_entries;
                result.cache_write = run_step("cache_write", move || {
                    cache.write_through(&cache_id, &response_text, max_entries);
                })
                .await;
            }
        }

        tracing::debug!(
            rid = %data.request_id,
            history = result.history,
            analytics = result.analytics,
            memory = result.memory,
            claims = result.claims,
            cache_write = result.cache_write,
            "post-call pipeline finished"
        );
        result
    }
}

/// Execute one step on the blocking pool and bound the wait on it. A step
/// that overruns keeps running detached; only the pipeline's wait is capped,
/// so a stuck step can neither stall the runtime nor the remaining steps.
async fn run_step<F>(name: &'static str, op: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(op);
    match tokio::time::timeout(STEP_TIMEOUT, handle).await {
        Ok(Ok(())) => true,
        Ok(Err(join_err)) => {
            tracing::warn!(step = name, error = %join_err, "post-call step panicked");
            false
        }
        Err(_) => {
            tracing::warn!(step = name, "post-call step timed out");
            false
        }
    }
}
