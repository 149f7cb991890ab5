//! Golden trace: the one-per-request structured routing record.
//!
//! Emission is exactly-once by construction: the emitter owns the record and
//! emits on explicit completion, with a drop backstop for panic and early
//! return paths.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

const TRACE_STORE_MAX_ENTRIES: usize = 1024;

/// One structured routing record per request.
#[derive(Debug, Clone, Serialize)]
pub struct GoldenTrace {
    pub ts_ms: u64,
    pub request_id: String,
    pub user_id: String,
    pub path: &'static str,
    pub shape: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_from: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_in: Option<String>,
    pub intent: String,
    pub tokens_est: usize,
    pub picker_reason: String,
    pub chosen_vendor: String,
    pub chosen_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_hit: Option<String>,
    pub stream: bool,
    pub dry_run: bool,
    pub cb_user_open: bool,
    pub cb_global_open: bool,
    pub allow_fallback: bool,
    pub cache_hit: bool,
    pub latency_ms: u64,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_check_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    /// Kept for replay; never serialized to clients.
    #[serde(skip_serializing)]
    pub prompt: String,
}

impl GoldenTrace {
    /// Skeleton record created at request entry; fields fill in as the
    /// request advances through the state machine.
    #[must_use]
    pub fn begin(
        request_id: String,
        user_id: String,
        path: &'static str,
        prompt: String,
    ) -> Self {
        Self {
            ts_ms: crate::util::unix_now_millis(),
            request_id,
            user_id,
            path,
            shape: "text".to_string(),
            normalized_from: None,
            override_in: None,
            intent: "chat".to_string(),
            tokens_est: 0,
            picker_reason: String::new(),
            chosen_vendor: String::new(),
            chosen_model: String::new(),
            keyword_hit: None,
            stream: false,
            dry_run: false,
            cb_user_open: false,
            cb_global_open: false,
            allow_fallback: true,
            cache_hit: false,
            latency_ms: 0,
            timeout_ms: 0,
            fallback_reason: None,
            self_check_score: None,
            escalated: None,
            final_model: None,
            error_class: None,
            prompt,
        }
    }
}

/// Append-only bounded store of emitted traces, keyed by request id.
#[derive(Debug, Default)]
pub struct TraceStore {
    inner: Mutex<TraceStoreInner>,
}

#[derive(Debug, Default)]
struct TraceStoreInner {
    by_rid: rustc_hash::FxHashMap<String, Arc<GoldenTrace>>,
    order: VecDeque<String>,
}

impl TraceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, trace: GoldenTrace) {
        let mut inner = self.inner.lock();
        let rid = trace.request_id.clone();
        if inner.by_rid.insert(rid.clone(), Arc::new(trace)).is_none() {
            inner.order.push_back(rid);
        }
        while inner.order.len() > TRACE_STORE_MAX_ENTRIES {
            if let Some(evicted) = inner.order.pop_front() {
                inner.by_rid.remove(&evicted);
            }
        }
    }

    #[must_use]
    pub fn get(&self, request_id: &str) -> Option<Arc<GoldenTrace>> {
        self.inner.lock().by_rid.get(request_id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_rid.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII emitter guaranteeing exactly one emission per request.
pub struct TraceEmitter {
    store: Arc<TraceStore>,
    trace: Option<GoldenTrace>,
}

impl TraceEmitter {
    #[must_use]
    pub fn new(store: Arc<TraceStore>, trace: GoldenTrace) -> Self {
        Self {
            store,
            trace: Some(trace),
        }
    }

    /// Mutable access while the request is in flight.
    ///
    /// # Panics
    ///
    /// Panics if called after [`TraceEmitter::emit`]; the emitter is consumed
    /// by emission so this cannot happen outside this module.
    pub fn trace_mut(&mut self) -> &mut GoldenTrace {
        self.trace
            .as_mut()
            .expect("trace already emitted")
    }

    /// Emit now. Dropping without calling this emits too, so panics and
    /// early returns still produce the record.
    pub fn emit(mut self) {
        self.emit_inner();
    }

    fn emit_inner(&mut self) {
        let Some(trace) = self.trace.take() else {
            return;
        };
        tracing::info!(
            rid = %trace.request_id,
            user = %trace.user_id,
            path = trace.path,
            vendor = %trace.chosen_vendor,
            model = %trace.chosen_model,
            reason = %trace.picker_reason,
            intent = %trace.intent,
            cache_hit = trace.cache_hit,
            latency_ms = trace.latency_ms,
            error_class = trace.error_class.as_deref().unwrap_or(""),
            "golden_trace"
        );
        self.store.insert(trace);
    }
}

impl Drop for TraceEmitter {
    fn drop(&mut self) {
        self.emit_inner();
    }
}

/// Field-level diff between a stored trace and a re-evaluated decision.
#[derive(Debug, Clone, Serialize)]
pub struct TraceDiff {
    pub field: &'static str,
    pub stored: serde_json::Value,
    pub current: serde_json::Value,
}

/// Compare the decision-bearing fields of two traces.
#[must_use]
pub fn diff_traces(stored: &GoldenTrace, current: &GoldenTrace) -> Vec<TraceDiff> {
    let mut diffs = Vec::new();
    let mut push = |field: &'static str, a: serde_json::Value, b: serde_json::Value| {
        if a != b {
            diffs.push(TraceDiff {
                field,
                stored: a,
                current: b,
            });
        }
    };
    push(
        "chosen_vendor",
        stored.chosen_vendor.clone().into(),
        current.chosen_vendor.clone().into(),
    );
    push(
        "chosen_model",
        stored.chosen_model.clone().into(),
        current.chosen_model.clone().into(),
    );
    push(
        "picker_reason",
        stored.picker_reason.clone().into(),
        current.picker_reason.clone().into(),
    );
    push("intent", stored.intent.clone().into(), current.intent.clone().into());
    push("tokens_est", stored.tokens_est.into(), current.tokens_est.into());
    push(
        "cb_user_open",
        stored.cb_user_open.into(),
        current.cb_user_open.into(),
    );
    push(
        "cb_global_open",
        stored.cb_global_open.into(),
        current.cb_global_open.into(),
    );
    push("cache_hit", stored.cache_hit.into(), current.cache_hit.into());
    push(
        "keyword_hit",
        serde_json::to_value(&stored.keyword_hit).unwrap_or_default(),
        serde_json::to_value(&current.keyword_hit).unwrap_or_default(),
    );
    diffs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_trace(rid: &str) -> GoldenTrace {
        GoldenTrace::begin(
            rid.to_string(),
            "u1".to_string(),
            "/v1/ask",
            "hello".to_string(),
        )
    }

    #[test]
    fn emit_stores_exactly_once() {
        let store = Arc::new(TraceStore::new());
        let emitter = TraceEmitter::new(Arc::clone(&store), make_trace("r1"));
        emitter.emit();
        assert_eq!(store.len(), 1);
        assert!(store.get("r1").is_some());
    }

    #[test]
    fn drop_emits_as_backstop() {
        let store = Arc::new(TraceStore::new());
        {
            let mut emitter = TraceEmitter::new(Arc::clone(&store), make_trace("r2"));
            emitter.trace_mut().error_class = Some("downstream_error".to_string());
            // dropped without emit()
        }
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("r2").unwrap().error_class.as_deref(),
            Some("downstream_error")
        );
    }

    #[test]
    fn store_is_bounded() {
        let store = TraceStore::new();
        for i in 0..(TRACE_STORE_MAX_ENTRIES + 10) {
            store.insert(make_trace(&format!("r{i}")));
        }
        assert_eq!(store.len(), TRACE_STORE_MAX_ENTRIES);
        assert!(store.get("r0").is_none());
        assert!(store
            .get(&format!("r{}", TRACE_STORE_MAX_ENTRIES + 9))
            .is_some());
    }

    #[test]
    fn diff_reports_changed_fields_only() {
        let stored = make_trace("r3");
        let mut current = stored.clone();
        current.chosen_vendor = "primary".to_string();
        current.tokens_est = 42;
        let diffs = diff_traces(&stored, &current);
        let fields: Vec<_> = diffs.iter().map(|d| d.field).collect();
        assert!(fields.contains(&"chosen_vendor"));
        assert!(fields.contains(&"tokens_est"));
        assert!(!fields.contains(&"chosen_model"));
    }
}
