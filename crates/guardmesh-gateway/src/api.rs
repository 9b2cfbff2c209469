//! HTTP surface for the gateway.
//!
//! Four JSON endpoints under `/api/guardian`. Method mismatches return
//! 405 via axum's method routers; missing or invalid bodies return 400
//! through the `Json` extractor.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/guardian/status", get(status_handler))
        .route("/api/guardian/toggle", post(toggle_handler))
        .route("/api/guardian/stats", get(stats_handler))
        .route("/api/guardian/validate", post(validate_handler))
        .with_state(state)
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = state.store.read().await;
    let ledger = state.ledger.lock().await;
    Json(json!({
        "enabled": state.pipeline.is_enabled(),
        "nodeId": state.node_id,
        "patterns": store.total_patterns(),
        "storeVersion": store.version(),
        "chainLength": ledger.len(),
        "peers": state.gossip.as_ref().map_or(0, |g| g.peer_count()),
        "discoveryRunning": state.discovery.is_running(),
    }))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ToggleRequest>,
) -> Json<Value> {
    state.pipeline.set_enabled(body.enabled);
    Json(json!({"enabled": state.pipeline.is_enabled()}))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = state.store.read().await;
    let mut body = state.stats.snapshot();
    body["patterns"] = json!(store.total_patterns());
    body["categories"] = json!(store.category_names().len());
    body["pendingTriggers"] = json!(state.trigger.pending());
    Json(body)
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    text: String,
}

async fn validate_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ValidateRequest>,
) -> Result<Json<Value>, StatusCode> {
    let verdict = state
        .pipeline
        .validate_with_metadata(&body.text, HashMap::new())
        .await;
    state.stats.validations.fetch_add(1, Ordering::Relaxed);
    if verdict.allowed {
        state.stats.allowed.fetch_add(1, Ordering::Relaxed);
    } else {
        state.stats.blocked.fetch_add(1, Ordering::Relaxed);
    }
    serde_json::to_value(&verdict)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
