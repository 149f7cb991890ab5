//! `/v1/ask/stream`: SSE with named events — one `route` event carrying the
//! decision, `delta` events with token content, and a terminal `done` or
//! `error` event.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RouterError;
use crate::state::AppState;
use crate::stream::encode_event_frame;

use super::ask::{
    gate_and_normalize, incoming_request_id, run_ask_flow, sse_response, with_ids,
};
use super::dry_explain::evaluate_decision;
use super::normalize::NormalizedAsk;

const FRAME_CHANNEL_CAPACITY: usize = 64;

/// `POST /v1/ask/stream`
pub async fn handler(state: Arc<AppState>, headers: http::HeaderMap, body: Bytes) -> Response {
    let request_id =
        incoming_request_id(&headers).unwrap_or_else(|| state.next_request_id());
    let trace_id = state.trace_id_for(&request_id);

    let (normalized, user_id) = match gate_and_normalize(&state, &headers, &body) {
        Ok(parts) => parts,
        Err(err) => return with_ids(err.into_response(), &request_id, &trace_id),
    };

    let route_event =
        match evaluate_decision(&state, &request_id, &user_id, &normalized, true) {
            Ok(view) => route_event_json(&request_id, &user_id, &normalized, &view),
            Err(err) => {
                // The stream has not started; policy errors surface as HTTP.
                return with_ids(err.into_response(), &request_id, &trace_id);
            }
        };

    let (frames_tx, frames_rx) = mpsc::channel::<String>(FRAME_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let producer_cancel = cancel.clone();
    let producer_state = Arc::clone(&state);
    let producer_rid = request_id.clone();

    tokio::spawn(async move {
        let _ = frames_tx
            .send(encode_event_frame("route", &route_event.to_string()))
            .await;

        let (token_tx, mut token_rx) = mpsc::channel::<String>(FRAME_CHANNEL_CAPACITY);
        let flow = tokio::spawn(run_ask_flow(
            producer_state,
            producer_rid.clone(),
            user_id,
            "/v1/ask/stream",
            normalized,
            Some(token_tx),
            producer_cancel,
        ));

        while let Some(token) = token_rx.recv().await {
            let delta = serde_json::json!({ "content": token });
            if frames_tx
                .send(encode_event_frame("delta", &delta.to_string()))
                .await
                .is_err()
            {
                // Writer gone; the flow observes cancellation on its own.
                break;
            }
        }

        let terminal = match flow.await {
            Ok(Ok(success)) => encode_event_frame(
                "done",
                &serde_json::json!({
                    "rid": producer_rid,
                    "vendor": success.vendor_label,
                    "model": success.model,
                    "cache_hit": success.cache_hit,
                })
                .to_string(),
            ),
            Ok(Err(RouterError::Cancelled)) => return,
            Ok(Err(err)) => encode_event_frame(
                "error",
                &serde_json::json!({
                    "rid": producer_rid,
                    "error_class": err.category(),
                })
                .to_string(),
            ),
            Err(join_err) => {
                tracing::error!(rid = %producer_rid, error = %join_err, "ask flow task failed");
                encode_event_frame(
                    "error",
                    &serde_json::json!({
                        "rid": producer_rid,
                        "error_class": "downstream_error",
                    })
                    .to_string(),
                )
            }
        };
        let _ = frames_tx.send(terminal).await;
    });

    let body_stream = frame_stream(frames_rx, cancel.drop_guard());
    with_ids(
        sse_response(Body::from_stream(body_stream)),
        &request_id,
        &trace_id,
    )
}

fn route_event_json(
    request_id: &str,
    user_id: &str,
    normalized: &NormalizedAsk,
    view: &super::dry_explain::DecisionView,
) -> serde_json::Value {
    let mut event = serde_json::json!({
        "ts": crate::util::unix_now_millis(),
        "rid": request_id,
        "uid": user_id,
        "path": "/v1/ask/stream",
        "shape": normalized.shape.as_str(),
        "normalized_from": normalized.normalized_from,
        "override_in": normalized.override_model.clone(),
        "intent": view.intent.as_str(),
        "tokens_est": view.tokens_est,
        "picker_reason": view.decision.reason.as_str(),
        "chosen_vendor": view.decision.vendor.as_str(),
        "chosen_model": view.decision.model.clone(),
        "dry_run": false,
        "cb_user_open": view.cb_user_open,
        "cb_global_open": view.cb_global_open,
        "allow_fallback": view.decision.allow_fallback,
        "stream": true,
    });
    if let Some(hit) = &view.decision.keyword_hit {
        event["keyword_hit"] = serde_json::Value::String(hit.clone());
    }
    event
}

fn frame_stream(
    frames_rx: mpsc::Receiver<String>,
    guard: tokio_util::sync::DropGuard,
) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> {
    futures_util::stream::unfold(
        Some((frames_rx, guard)),
        |state| async move {
            let (mut rx, guard) = state?;
            match rx.recv().await {
                Some(frame) => Some((Ok(Bytes::from(frame)), Some((rx, guard)))),
                None => None,
            }
        },
    )
}
