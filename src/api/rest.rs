// =============================================================================
// REST Status API — Axum 0.7
// =============================================================================
//
// A read-only status surface bound to `METRICS_ADDR` when set: health probe,
// full engine snapshot, provider safety states, and the active regime. No
// mutating endpoints — operator controls go through the CLI.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

/// Build the status router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/providers", get(providers))
        .route("/api/v1/regime", get(regime))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn providers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.safety.snapshot())
}

async fn regime(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.regime.current() {
        Some(snapshot) => Json(serde_json::json!({
            "regime": snapshot.regime,
            "confidence": snapshot.confidence,
            "stable": snapshot.stable,
            "ts": snapshot.ts.to_rfc3339(),
            "weights": snapshot.weights,
        })),
        None => Json(serde_json::json!({ "regime": null })),
    }
}
