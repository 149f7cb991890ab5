//! Semantic cache behavior through the full flow: normalization-stable
//! hits, short-circuiting, write-through, and single-flight coalescing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use askgate::adapters::{AdapterError, VendorAdapter, VendorRequest, VendorResponse};
use askgate::cache::compose_cache_id;
use askgate::routing::Vendor;
use async_trait::async_trait;
use axum::http::StatusCode;
use common::{
    body_json, build_state, default_state, ok_body, send, settle, MockAdapter, RequestSpec,
    GOOD_TEXT,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn seeded_cache_short_circuits_routing() {
    let (state, primary, secondary) = default_state();

    // "hi" routes light_default to the secondary baseline model; seed the
    // fingerprint for a differently-spaced, differently-cased prompt.
    let cache_id = compose_cache_id("llama3:latest", "Hello World", &[]);
    state
        .semantic_cache()
        .write_through(&cache_id, "seeded answer", 256);

    let response = send(
        &state,
        RequestSpec::post("/v1/ask", json!({"prompt": "  hello   world "})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rid = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body = body_json(response).await;
    assert_eq!(body["response"], "seeded answer");

    assert_eq!(primary.call_count(), 0);
    assert_eq!(secondary.call_count(), 0);

    settle().await;
    let trace = state.traces().get(&rid).unwrap();
    assert!(trace.cache_hit);
    assert_eq!(trace.chosen_vendor, "cache");
}

#[tokio::test]
async fn success_writes_through_and_second_request_hits() {
    let primary = MockAdapter::new(Vendor::Primary, vec![]);
    let secondary = MockAdapter::new(Vendor::Secondary, vec![common::ok_text(GOOD_TEXT)]);
    let state = build_state(Arc::clone(&primary), Arc::clone(&secondary));

    let first = send(
        &state,
        RequestSpec::post("/v1/ask", json!({"prompt": "tell me about the plan"})),
    )
    .await;
    assert_eq!(first.status(), StatusCode::OK);
    settle().await;
    assert_eq!(secondary.call_count(), 1);

    let second = send(
        &state,
        RequestSpec::post("/v1/ask", json!({"prompt": "Tell me ABOUT the plan"})),
    )
    .await;
    assert_eq!(second.status(), StatusCode::OK);
    let body = body_json(second).await;
    assert_eq!(body["response"], GOOD_TEXT);
    // No second vendor call: the normalized fingerprint matched.
    assert_eq!(secondary.call_count(), 1);

    let snapshot = state.analytics().snapshot();
    assert_eq!(snapshot.cache_lookups, 2);
    assert_eq!(snapshot.cache_hits, 1);
}

#[tokio::test]
async fn errors_do_not_write_through() {
    let primary = MockAdapter::new(Vendor::Primary, vec![common::err_5xx()]);
    let secondary = MockAdapter::new(Vendor::Secondary, vec![common::err_5xx()]);
    let state = build_state(Arc::clone(&primary), Arc::clone(&secondary));

    let response = send(
        &state,
        RequestSpec::post("/v1/ask", json!({"prompt": "hi there"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    settle().await;
    assert!(state.semantic_cache().is_empty());
}

/// Adapter that stalls long enough for a second identical request to arrive,
/// counting concurrent entries.
struct SlowAdapter {
    calls: Mutex<usize>,
}

#[async_trait]
impl VendorAdapter for SlowAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Secondary
    }

    async fn call(
        &self,
        _request: VendorRequest,
        _cancel: &CancellationToken,
    ) -> Result<VendorResponse, AdapterError> {
        *self.calls.lock() += 1;
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(ok_body(GOOD_TEXT))
    }

    async fn probe(&self, _timeout: Duration) -> Result<(), String> {
        Ok(())
    }
}

#[tokio::test]
async fn concurrent_identical_misses_share_one_fill() {
    let primary = MockAdapter::new(Vendor::Primary, vec![]);
    let slow = Arc::new(SlowAdapter {
        calls: Mutex::new(0),
    });
    let state = Arc::new(askgate::state::AppState::with_adapters(
        common::test_config(),
        primary,
        Arc::clone(&slow) as Arc<dyn VendorAdapter>,
    ));

    let state_a = Arc::clone(&state);
    let state_b = Arc::clone(&state);
    let spec = || RequestSpec::post("/v1/ask", json!({"prompt": "the shared question"}));
    let (first, second) = tokio::join!(send(&state_a, spec()), send(&state_b, spec()));

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    let first_body = body_json(first).await;
    let second_body = body_json(second).await;
    assert_eq!(first_body["response"], GOOD_TEXT);
    assert_eq!(second_body["response"], GOOD_TEXT);

    // The follower coalesced onto the leader's fill.
    assert_eq!(*slow.calls.lock(), 1);
}
