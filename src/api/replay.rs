//! `GET /v1/ask/replay/{rid}`: stored golden trace plus a pure
//! re-evaluation of its decision path under current rules and health.

use std::sync::Arc;

use axum::response::{IntoResponse, Response};

use crate::adapters::GenOptions;
use crate::error::RouterError;
use crate::state::trace::{diff_traces, GoldenTrace};
use crate::state::AppState;

use super::ask::{with_ids, CACHE_VENDOR_LABEL};
use super::dry_explain::evaluate_decision;
use super::normalize::NormalizedAsk;

/// `GET /v1/ask/replay/{rid}`
pub async fn handler(
    state: Arc<AppState>,
    headers: http::HeaderMap,
    rid: &str,
) -> Response {
    let trace_id = state.trace_id_for(rid);

    let user_id = state.resolve_user(&headers);
    if user_id == crate::auth::ANON_USER {
        return with_ids(RouterError::AuthRequired.into_response(), rid, &trace_id);
    }

    let Some(stored) = state.traces().get(rid) else {
        let body = serde_json::json!({ "detail": "trace_not_found", "rid": rid });
        return with_ids(
            (http::StatusCode::NOT_FOUND, axum::Json(body)).into_response(),
            rid,
            &trace_id,
        );
    };

    let replayed = match replay_decision(&state, &stored) {
        Ok(replayed) => replayed,
        Err(err) => {
            // The prompt now fails a gate that it previously passed; report
            // the divergence rather than an opaque error.
            let body = serde_json::json!({
                "rid": rid,
                "stored": &*stored,
                "replay_error": err.category(),
            });
            return with_ids(axum::Json(body).into_response(), rid, &trace_id);
        }
    };

    let diff = diff_traces(&stored, &replayed);
    let body = serde_json::json!({
        "rid": rid,
        "stored": &*stored,
        "replayed": replayed,
        "diff": diff,
    });
    with_ids(axum::Json(body).into_response(), rid, &trace_id)
}

/// Re-run the decision path from the stored inputs. Side-effect-free: no
/// vendor calls, no cache writes, no analytics increments, no new trace.
fn replay_decision(
    state: &Arc<AppState>,
    stored: &GoldenTrace,
) -> Result<GoldenTrace, RouterError> {
    let normalized = NormalizedAsk {
        prompt: stored.prompt.clone(),
        override_model: stored.override_in.clone(),
        stream_flag: stored.stream,
        stream_explicit: true,
        gen_opts: GenOptions::default(),
        shape: crate::routing::PromptShape::Text,
        normalized_from: None,
    };
    let view = evaluate_decision(
        state,
        &stored.request_id,
        &stored.user_id,
        &normalized,
        stored.stream,
    )?;

    let mut replayed = stored.clone();
    replayed.ts_ms = crate::util::unix_now_millis();
    replayed.intent = view.intent.as_str().to_string();
    replayed.tokens_est = view.tokens_est;
    replayed.picker_reason = view.decision.reason.as_str().to_string();
    replayed.chosen_vendor = if view.cache_hit {
        CACHE_VENDOR_LABEL.to_string()
    } else {
        view.decision.vendor.as_str().to_string()
    };
    replayed.chosen_model = view.decision.model.clone();
    replayed.keyword_hit = view.decision.keyword_hit.clone();
    replayed.allow_fallback = view.decision.allow_fallback;
    replayed.cb_user_open = view.cb_user_open;
    replayed.cb_global_open = view.cb_global_open;
    replayed.cache_hit = view.cache_hit;
    // Execution-era fields do not replay.
    replayed.latency_ms = 0;
    replayed.fallback_reason = None;
    replayed.self_check_score = None;
    replayed.escalated = None;
    replayed.final_model = None;
    replayed.error_class = None;
    Ok(replayed)
}
