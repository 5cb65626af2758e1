// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Reads return the same structures the
// WebSocket feed pushes; writes change the feed subscriptions.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::{AppState, FeedTarget};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/prices", get(prices))
        .route("/api/v1/prices/:symbol", get(price))
        .route("/api/v1/chart", get(chart).post(switch_chart))
        .route("/api/v1/watchlist", post(set_watchlist))
        .route("/api/v1/reconnect", post(reconnect))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Shared response helpers
// =============================================================================

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.version.current(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Reads
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn prices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.prices())
}

async fn price(State(state): State<Arc<AppState>>, Path(symbol): Path<String>) -> Response {
    match state.price(&symbol) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("no price for {}", symbol.to_uppercase()),
        ),
    }
}

async fn chart(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.chart_snapshot())
}

// =============================================================================
// Subscription changes
// =============================================================================

#[derive(Debug, Deserialize)]
struct ChartRequest {
    symbol: String,
    interval: String,
}

async fn switch_chart(State(state): State<Arc<AppState>>, Json(req): Json<ChartRequest>) -> Response {
    match state.switch_chart(&req.symbol, &req.interval) {
        Ok(key) => {
            info!(key = %key, "chart switched via API");
            Json(serde_json::json!({
                "status": "ok",
                "symbol": key.symbol,
                "interval": key.interval,
            }))
            .into_response()
        }
        Err(e) => {
            warn!(error = %e, "chart switch rejected");
            error_response(StatusCode::BAD_REQUEST, format!("{e:#}"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct WatchlistRequest {
    symbols: Vec<String>,
}

async fn set_watchlist(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WatchlistRequest>,
) -> Response {
    match state.set_watchlist(&req.symbols) {
        Ok(symbols) => {
            info!(symbols = ?symbols, "watchlist updated via API");
            Json(serde_json::json!({ "status": "ok", "symbols": symbols })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "watchlist update rejected");
            error_response(StatusCode::BAD_REQUEST, format!("{e:#}"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReconnectRequest {
    target: FeedTarget,
}

async fn reconnect(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReconnectRequest>,
) -> impl IntoResponse {
    state.reconnect(req.target);
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "reconnecting", "target": req.target })),
    )
}
