// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// All endpoints live under `/api/v1/`. `/health` is public; everything else
// requires a valid Bearer token via the `AuthBearer` extractor. The surface
// is read-only — balance, positions, orders, session report — plus a single
// admin mutation (the kill switch), matching the teacher's `api/rest.rs`
// route table (`/api/v1/positions`, `/api/v1/trade-journal`,
// `/api/v1/trade-journal/stats`) renamed and reshaped to this engine's data
// model.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated, read-only ─────────────────────────────────
        .route("/api/v1/balance", get(balance))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/positions/closed", get(closed_positions))
        .route("/api/v1/orders", get(orders))
        .route("/api/v1/session-report", get(session_report))
        // ── Authenticated, admin ──────────────────────────────────────
        .route("/api/v1/control/kill", post(control_kill))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// =============================================================================
// Balance (authenticated)
// =============================================================================

async fn balance(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.balance_snapshot().await)
}

// =============================================================================
// Positions (authenticated)
// =============================================================================

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.open_positions())
}

async fn closed_positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.closed_positions())
}

// =============================================================================
// Orders (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct OrdersQuery {
    #[serde(default = "default_order_limit")]
    limit: usize,
}

fn default_order_limit() -> usize {
    100
}

async fn orders(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> impl IntoResponse {
    Json(state.recent_orders(query.limit).await)
}

// =============================================================================
// Session report (authenticated)
// =============================================================================

async fn session_report(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.session_report().await)
}

// =============================================================================
// Control (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    message: &'static str,
}

async fn control_kill(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    warn!("trading killed via API — liquidating all open positions");
    state.trigger_panic().await;
    info!("kill switch liquidation complete");

    Json(ControlResponse {
        message: "trading killed, all open positions liquidated",
    })
}
