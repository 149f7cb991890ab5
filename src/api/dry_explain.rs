//! `/v1/ask/dry-explain`: the routing decision without the call.

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::cache::compose_cache_id;
use crate::error::RouterError;
use crate::intent::{count_tokens, detect_intent, Intent};
use crate::routing::picker::{pick, PickInput};
use crate::routing::{RoutingDecision, Vendor};
use crate::state::trace::{GoldenTrace, TraceEmitter};
use crate::state::AppState;

use super::ask::{gate_and_normalize, incoming_request_id, with_ids, CACHE_VENDOR_LABEL};
use super::normalize::NormalizedAsk;

/// The decision and the signals that produced it, with no side effects.
pub(crate) struct DecisionView {
    pub decision: RoutingDecision,
    pub intent: Intent,
    pub tokens_est: usize,
    pub cb_user_open: bool,
    pub cb_global_open: bool,
    pub cache_hit: bool,
}

/// Evaluate the decision path for a normalized request under current rules
/// and health. Pure: no vendor calls, no cache writes, no counters.
pub(crate) fn evaluate_decision(
    state: &Arc<AppState>,
    request_id: &str,
    user_id: &str,
    normalized: &NormalizedAsk,
    stream_hint: bool,
) -> Result<DecisionView, RouterError> {
    let rules = state.rules();

    if let Some(phrase) = rules.blocked_phrase(&normalized.prompt) {
        return Err(RouterError::BlockedByPolicy(format!(
            "blocked phrase: {phrase}"
        )));
    }

    let (intent, priority) = detect_intent(&normalized.prompt);
    let tokens_est = count_tokens(&normalized.prompt);
    let cb_user_open = state.user_cb_open(user_id, &rules);
    let cb_global_open =
        state.global_cb_open(Vendor::Primary) || state.global_cb_open(Vendor::Secondary);

    let retrieved_docs: Vec<String> = Vec::new();
    let input = PickInput {
        prompt: &normalized.prompt,
        intent,
        priority,
        tokens: tokens_est,
        override_model: normalized.override_model.as_deref(),
        stream: stream_hint,
        request_id,
        attachments_count: 0,
        retrieved_docs: &retrieved_docs,
        ops_files_count: None,
        user_cb_open: cb_user_open,
    };
    let decision = pick(&input, &rules, state.catalog(), &state.availability_view())?;

    // Cache is consulted for consistency with /ask; a hit reports
    // vendor="cache" without touching counters or contents.
    let cache_id = compose_cache_id(&decision.model, &normalized.prompt, &retrieved_docs);
    let cache_hit = state
        .semantic_cache()
        .lookup(&cache_id, rules.cache_ttl_secs)
        .is_some();

    Ok(DecisionView {
        decision,
        intent,
        tokens_est,
        cb_user_open,
        cb_global_open,
        cache_hit,
    })
}

/// `POST /v1/ask/dry-explain`
pub async fn handler(state: Arc<AppState>, headers: http::HeaderMap, body: Bytes) -> Response {
    let request_id =
        incoming_request_id(&headers).unwrap_or_else(|| state.next_request_id());
    let trace_id = state.trace_id_for(&request_id);

    let (normalized, user_id) = match gate_and_normalize(&state, &headers, &body) {
        Ok(parts) => parts,
        Err(err) => return with_ids(err.into_response(), &request_id, &trace_id),
    };

    let mut emitter = TraceEmitter::new(
        Arc::clone(state.traces()),
        GoldenTrace::begin(
            request_id.clone(),
            user_id.clone(),
            "/v1/ask/dry-explain",
            normalized.prompt.clone(),
        ),
    );
    {
        let trace = emitter.trace_mut();
        trace.dry_run = true;
        trace.shape = normalized.shape.as_str().to_string();
        trace.normalized_from = normalized.normalized_from;
        trace.override_in = normalized.override_model.clone();
        trace.stream = normalized.stream_flag;
    }

    let view = match evaluate_decision(
        &state,
        &request_id,
        &user_id,
        &normalized,
        normalized.stream_flag,
    ) {
        Ok(view) => view,
        Err(err) => {
            emitter.trace_mut().error_class = Some(err.category().to_string());
            return with_ids(err.into_response(), &request_id, &trace_id);
        }
    };

    {
        let trace = emitter.trace_mut();
        trace.intent = view.intent.as_str().to_string();
        trace.tokens_est = view.tokens_est;
        trace.picker_reason = view.decision.reason.as_str().to_string();
        trace.chosen_vendor = if view.cache_hit {
            CACHE_VENDOR_LABEL.to_string()
        } else {
            view.decision.vendor.as_str().to_string()
        };
        trace.chosen_model = view.decision.model.clone();
        trace.keyword_hit = view.decision.keyword_hit.clone();
        trace.allow_fallback = view.decision.allow_fallback;
        trace.cb_user_open = view.cb_user_open;
        trace.cb_global_open = view.cb_global_open;
        trace.cache_hit = view.cache_hit;
    }

    let mut body = serde_json::json!({
        "ts": crate::util::unix_now_millis(),
        "rid": request_id,
        "uid": user_id,
        "path": "/v1/ask/dry-explain",
        "shape": normalized.shape.as_str(),
        "normalized_from": normalized.normalized_from,
        "override_in": normalized.override_model,
        "intent": view.intent.as_str(),
        "tokens_est": view.tokens_est,
        "picker_reason": view.decision.reason.as_str(),
        "chosen_vendor": if view.cache_hit { CACHE_VENDOR_LABEL } else { view.decision.vendor.as_str() },
        "chosen_model": view.decision.model,
        "dry_run": true,
        "cb_user_open": view.cb_user_open,
        "cb_global_open": view.cb_global_open,
        "allow_fallback": view.decision.allow_fallback,
        "stream": normalized.stream_flag,
        "cache_hit": view.cache_hit,
    });
    if let Some(hit) = &view.decision.keyword_hit {
        body["keyword_hit"] = serde_json::Value::String(hit.clone());
    }

    emitter.emit();
    with_ids(
        axum::Json(body).into_response(),
        &request_id,
        &trace_id,
    )
}
