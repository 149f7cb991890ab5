//! `/v1/ask`: normalization, policy gates, cache probe, routing, execution,
//! post-call handoff, and response negotiation.
//!
//! The streaming path uses an explicit producer task feeding a bounded token
//! channel; the response writer is the sole reader. Client disconnect and
//! the budget deadline cancel the same handle.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{compose_cache_id, wait_for_fill, FillGuard, FillTicket};
use crate::error::RouterError;
use crate::intent::{count_tokens, detect_intent};
use crate::postcall::PostCallData;
use crate::routing::budget::adapter_deadline;
use crate::routing::orchestrate::{execute_decision, vendor_timeout_ms, ExecuteParams};
use crate::routing::picker::{pick, PickInput};
use crate::routing::{RequestContext, RoutingDecision, Vendor};
use crate::state::trace::{GoldenTrace, TraceEmitter};
use crate::state::AppState;
use crate::stream::{done_frame, encode_data_frame};

use super::normalize::{normalize_payload, NormalizedAsk};

const TOKEN_CHANNEL_CAPACITY: usize = 64;
const POSTCALL_AWAIT: Duration = Duration::from_millis(250);

pub(crate) const CACHE_VENDOR_LABEL: &str = "cache";

/// Terminal success of the ask flow, ready for framing.
pub(crate) struct FlowSuccess {
    pub text: String,
    pub vendor_label: String,
    pub model: String,
    pub cache_hit: bool,
}

/// `POST /v1/ask`
pub async fn handler(state: Arc<AppState>, headers: http::HeaderMap, body: Bytes) -> Response {
    let request_id = incoming_request_id(&headers)
        .unwrap_or_else(|| state.next_request_id());
    let trace_id = state.trace_id_for(&request_id);

    let (normalized, user_id) = match gate_and_normalize(&state, &headers, &body) {
        Ok(parts) => parts,
        Err(err) => return with_ids(err.into_response(), &request_id, &trace_id),
    };

    let wants_sse = normalized.stream_flag
        || (!normalized.stream_explicit && accept_requests_sse(&headers));

    if wants_sse {
        let response = sse_token_response(
            Arc::clone(&state),
            request_id.clone(),
            user_id,
            "/v1/ask",
            normalized,
        );
        return with_ids(response, &request_id, &trace_id);
    }

    let cancel = CancellationToken::new();
    let result = run_ask_flow(
        state,
        request_id.clone(),
        user_id,
        "/v1/ask",
        normalized,
        None,
        cancel,
    )
    .await;

    let response = match result {
        Ok(success) => {
            axum::Json(serde_json::json!({ "response": success.text })).into_response()
        }
        Err(err) => err.into_response(),
    };
    with_ids(response, &request_id, &trace_id)
}

/// Shared entry gates: content type, JSON parse, identity, normalization.
pub(crate) fn gate_and_normalize(
    state: &Arc<AppState>,
    headers: &http::HeaderMap,
    body: &Bytes,
) -> Result<(NormalizedAsk, String), RouterError> {
    if !content_type_is_json(headers) {
        return Err(RouterError::UnsupportedMediaType);
    }
    let raw: serde_json::Value = serde_json::from_slice(body)
        .map_err(|err| RouterError::InvalidRequest(format!("invalid JSON body: {err}")))?;

    let user_id = state.resolve_user(headers);
    if user_id == crate::auth::ANON_USER {
        return Err(RouterError::AuthRequired);
    }

    let normalized = normalize_payload(&raw)?;
    Ok((normalized, user_id))
}

/// Build the SSE response for `/v1/ask`: plain `data:` token frames with a
/// terminal `[DONE]` sentinel; errors ride inline as `[error:<category>]`.
pub(crate) fn sse_token_response(
    state: Arc<AppState>,
    request_id: String,
    user_id: String,
    path: &'static str,
    normalized: NormalizedAsk,
) -> Response {
    let (token_tx, token_rx) = mpsc::channel::<String>(TOKEN_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let producer_cancel = cancel.clone();

    tokio::spawn(async move {
        let result = run_ask_flow(
            state,
            request_id,
            user_id,
            path,
            normalized,
            Some(token_tx.clone()),
            producer_cancel,
        )
        .await;
        if let Err(err) = result {
            if !matches!(err, RouterError::Cancelled) {
                let _ = token_tx.send(err.stream_token()).await;
            }
        }
        // token_tx drops here; the writer observes the closed channel.
    });

    let body_stream = token_frame_stream(token_rx, cancel.drop_guard());
    sse_response(Body::from_stream(body_stream))
}

enum WriterState {
    Open(mpsc::Receiver<String>, tokio_util::sync::DropGuard),
    Done,
}

/// Frame tokens as SSE and close with the `[DONE]` sentinel. Dropping the
/// stream (client disconnect) drops the guard, cancelling the producer.
fn token_frame_stream(
    token_rx: mpsc::Receiver<String>,
    guard: tokio_util::sync::DropGuard,
) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> {
    futures_util::stream::unfold(WriterState::Open(token_rx, guard), |state| async move {
        match state {
            WriterState::Open(mut rx, guard) => match rx.recv().await {
                Some(chunk) => Some((
                    Ok(Bytes::from(encode_data_frame(&chunk))),
                    WriterState::Open(rx, guard),
                )),
                None => Some((
                    Ok(Bytes::from_static(done_frame().as_bytes())),
                    WriterState::Done,
                )),
            },
            WriterState::Done => None,
        }
    })
}

pub(crate) fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/event-stream")
        .header(http::header::CACHE_CONTROL, "no-cache")
        .header(http::header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| http::StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// The routing state machine for one request. Emits exactly one golden
/// trace on every path, including panics (drop backstop in the emitter).
pub(crate) async fn run_ask_flow(
    state: Arc<AppState>,
    request_id: String,
    user_id: String,
    path: &'static str,
    normalized: NormalizedAsk,
    token_tx: Option<mpsc::Sender<String>>,
    cancel: CancellationToken,
) -> Result<FlowSuccess, RouterError> {
    let rules = state.rules();
    let start = Instant::now();

    let mut emitter = TraceEmitter::new(
        Arc::clone(state.traces()),
        GoldenTrace::begin(
            request_id.clone(),
            user_id.clone(),
            path,
            normalized.prompt.clone(),
        ),
    );
    {
        let trace = emitter.trace_mut();
        trace.shape = normalized.shape.as_str().to_string();
        trace.normalized_from = normalized.normalized_from;
        trace.override_in = normalized.override_model.clone();
        trace.stream = token_tx.is_some() || normalized.stream_flag;
    }

    if let Some(phrase) = rules.blocked_phrase(&normalized.prompt) {
        let err = RouterError::BlockedByPolicy(format!("blocked phrase: {phrase}"));
        emitter.trace_mut().error_class = Some(err.category().to_string());
        emitter.emit();
        return Err(err);
    }

    let (intent, priority) = detect_intent(&normalized.prompt);
    let tokens_est = count_tokens(&normalized.prompt);
    let ctx = RequestContext {
        request_id: request_id.clone(),
        user_id: user_id.clone(),
        path,
        start,
        budget_ms: rules.budget_ms,
        intent,
        tokens_est,
        shape: normalized.shape,
        normalized_from: normalized.normalized_from,
    };

    let user_cb_open = state.user_cb_open(&user_id, &rules);
    let cb_global_open =
        state.global_cb_open(Vendor::Primary) || state.global_cb_open(Vendor::Secondary);
    let availability = state.availability_view();
    {
        let trace = emitter.trace_mut();
        trace.intent = intent.as_str().to_string();
        trace.tokens_est = tokens_est;
        trace.cb_user_open = user_cb_open;
        trace.cb_global_open = cb_global_open;
    }

    // Retrieval is an external collaborator; the HTTP edge carries no docs.
    let retrieved_docs: Vec<String> = Vec::new();

    let input = PickInput {
        prompt: &normalized.prompt,
        intent,
        priority,
        tokens: tokens_est,
        override_model: normalized.override_model.as_deref(),
        stream: token_tx.is_some(),
        request_id: &request_id,
        attachments_count: 0,
        retrieved_docs: &retrieved_docs,
        ops_files_count: None,
        user_cb_open,
    };
    let decision = match pick(&input, &rules, state.catalog(), &availability) {
        Ok(decision) => decision,
        Err(err) => {
            emitter.trace_mut().error_class = Some(err.category().to_string());
            emitter.emit();
            return Err(err);
        }
    };
    {
        let trace = emitter.trace_mut();
        trace.picker_reason = decision.reason.as_str().to_string();
        trace.chosen_vendor = decision.vendor.as_str().to_string();
        trace.chosen_model = decision.model.clone();
        trace.keyword_hit = decision.keyword_hit.clone();
        trace.allow_fallback = decision.allow_fallback;
        trace.timeout_ms =
            adapter_deadline(start, rules.budget_ms, vendor_timeout_ms(&rules, decision.vendor))
                .as_millis() as u64;
    }

    // Semantic cache probe for the decided model.
    let cache_id = compose_cache_id(&decision.model, &normalized.prompt, &retrieved_docs);
    if let Some(hit) = state.semantic_cache().lookup(&cache_id, rules.cache_ttl_secs) {
        state.analytics().record_cache_lookup(true);
        return serve_cache_hit(
            &state,
            &ctx,
            &decision,
            &normalized.prompt,
            emitter,
            hit.text,
            &cache_id,
            token_tx,
        )
        .await;
    }
    state.analytics().record_cache_lookup(false);

    // Single-flight: coalesce concurrent fills of the same fingerprint.
    let mut fill_guard: Option<FillGuard> = None;
    match state.semantic_cache().begin_fill(&cache_id) {
        FillTicket::Leader(guard) => fill_guard = Some(guard),
        FillTicket::Follower(receiver) => {
            wait_for_fill(receiver).await;
            if let Some(hit) = state.semantic_cache().lookup(&cache_id, rules.cache_ttl_secs) {
                state.analytics().record_cache_lookup(true);
                return serve_cache_hit(
                    &state,
                    &ctx,
                    &decision,
                    &normalized.prompt,
                    emitter,
                    hit.text,
                    &cache_id,
                    token_tx,
                )
                .await;
            }
            // The leader's fill did not land; proceed without a guard.
        }
    }

    let params = ExecuteParams {
        system: None,
        gen_opts: normalized.gen_opts,
        retrieved_docs,
        token_tx,
        cancel,
    };
    let result = execute_decision(&state, &ctx, &decision, &normalized.prompt, &params).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(outcome) => {
            {
                let trace = emitter.trace_mut();
                trace.latency_ms = latency_ms;
                trace.fallback_reason = outcome
                    .fallback_reason
                    .map(|reason| reason.as_str().to_string());
                trace.self_check_score = outcome.self_check_score;
                trace.escalated = Some(outcome.escalated);
                trace.final_model = Some(outcome.final_model.clone());
            }
            let data = PostCallData {
                request_id,
                user_id,
                prompt: normalized.prompt,
                response_text: outcome.text.clone(),
                vendor: outcome.final_vendor.as_str().to_string(),
                model: outcome.final_model.clone(),
                prompt_tokens: outcome.prompt_tokens,
                completion_tokens: outcome.completion_tokens,
                cost: outcome.cost,
                latency_ms,
                vendor_enum: Some(outcome.final_vendor),
                used_fallback: outcome.used_fallback,
                cache_id: Some(cache_id),
                cache_hit: false,
                cancelled: false,
                error: false,
            };
            finish_with_postcall(&state, emitter, data, fill_guard).await;
            Ok(FlowSuccess {
                text: outcome.text,
                vendor_label: outcome.final_vendor.as_str().to_string(),
                model: outcome.final_model,
                cache_hit: false,
            })
        }
        Err(err) => {
            let cancelled = matches!(err, RouterError::Cancelled);
            {
                let trace = emitter.trace_mut();
                trace.latency_ms = latency_ms;
                trace.error_class = Some(err.category().to_string());
            }
            let data = PostCallData {
                request_id,
                user_id,
                prompt: normalized.prompt,
                response_text: String::new(),
                vendor: decision.vendor.as_str().to_string(),
                model: decision.model.clone(),
                prompt_tokens: 0,
                completion_tokens: 0,
                cost: 0.0,
                latency_ms,
                vendor_enum: Some(decision.vendor),
                used_fallback: false,
                cache_id: None,
                cache_hit: false,
                cancelled,
                error: !cancelled,
            };
            finish_with_postcall(&state, emitter, data, fill_guard).await;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_cache_hit(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    decision: &RoutingDecision,
    prompt: &str,
    mut emitter: TraceEmitter,
    text: String,
    cache_id: &str,
    token_tx: Option<mpsc::Sender<String>>,
) -> Result<FlowSuccess, RouterError> {
    if let Some(tx) = &token_tx {
        // Cached responses stream as a single chunk.
        let _ = tx.send(text.clone()).await;
    }
    let latency_ms = ctx.start.elapsed().as_millis() as u64;
    {
        let trace = emitter.trace_mut();
        trace.cache_hit = true;
        trace.chosen_vendor = CACHE_VENDOR_LABEL.to_string();
        trace.latency_ms = latency_ms;
        trace.final_model = Some(decision.model.clone());
    }
    let data = PostCallData {
        request_id: ctx.request_id.clone(),
        user_id: ctx.user_id.clone(),
        prompt: prompt.to_string(),
        response_text: text.clone(),
        vendor: CACHE_VENDOR_LABEL.to_string(),
        model: decision.model.clone(),
        prompt_tokens: 0,
        completion_tokens: 0,
        cost: 0.0,
        latency_ms,
        vendor_enum: None,
        used_fallback: false,
        cache_id: Some(cache_id.to_string()),
        cache_hit: true,
        cancelled: false,
        error: false,
    };
    finish_with_postcall(state, emitter, data, None).await;
    Ok(FlowSuccess {
        text,
        vendor_label: CACHE_VENDOR_LABEL.to_string(),
        model: decision.model.clone(),
        cache_hit: true,
    })
}

/// Start the post-call pipeline, wait briefly for it, then emit the trace.
/// The pipeline keeps running in the background past the grace window; the
/// single-flight guard is released only after the cache write step ran.
async fn finish_with_postcall(
    state: &Arc<AppState>,
    emitter: TraceEmitter,
    data: PostCallData,
    fill_guard: Option<FillGuard>,
) {
    let pipeline = Arc::clone(state.postcall());
    let rules = state.rules();
    let handle = tokio::spawn(async move {
        let result = pipeline.run(&data, &rules).await;
        drop(fill_guard);
        result
    });
    let _ = tokio::time::timeout(POSTCALL_AWAIT, handle).await;
    emitter.emit();
}

pub(crate) fn content_type_is_json(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_lowercase().contains("application/json"))
}

pub(crate) fn accept_requests_sse(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("text/event-stream"))
}

pub(crate) fn incoming_request_id(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 64)
        .map(str::to_string)
}

/// Echo correlation ids on every response.
pub(crate) fn with_ids(mut response: Response, request_id: &str, trace_id: &str) -> Response {
    if let Ok(value) = http::HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    if let Ok(value) = http::HeaderValue::from_str(trace_id) {
        response.headers_mut().insert("x-trace-id", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_gate() {
        let mut headers = http::HeaderMap::new();
        assert!(!content_type_is_json(&headers));
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert!(content_type_is_json(&headers));
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain"),
        );
        assert!(!content_type_is_json(&headers));
    }

    #[test]
    fn accept_negotiation() {
        let mut headers = http::HeaderMap::new();
        assert!(!accept_requests_sse(&headers));
        headers.insert(
            http::header::ACCEPT,
            http::HeaderValue::from_static("text/event-stream"),
        );
        assert!(accept_requests_sse(&headers));
    }

    #[test]
    fn request_id_passthrough_is_bounded() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-request-id", http::HeaderValue::from_static("abc-123"));
        assert_eq!(incoming_request_id(&headers).as_deref(), Some("abc-123"));

        let long = "x".repeat(65);
        headers.insert("x-request-id", http::HeaderValue::from_str(&long).unwrap());
        assert!(incoming_request_id(&headers).is_none());
    }
}
