use std::sync::Arc;

use axum::response::Json;
use serde_json::{json, Value};

use crate::routing::Vendor;
use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status, vendor health, and counter summary.
pub fn health_handler(state: &Arc<AppState>) -> Json<Value> {
    let analytics = state.analytics().snapshot();
    Json(json!({
        "status": "askgate is running",
        "vendors": {
            "primary": state.health().snapshot(Vendor::Primary),
            "secondary": state.health().snapshot(Vendor::Secondary),
        },
        "breakers": {
            "primary_open": state.global_cb_open(Vendor::Primary),
            "secondary_open": state.global_cb_open(Vendor::Secondary),
        },
        "analytics": analytics,
        "traces_stored": state.traces().len(),
    }))
}
