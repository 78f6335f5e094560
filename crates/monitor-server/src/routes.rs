use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use monitor_analytics::DashboardPayload;
use serde::Deserialize;

use crate::state::ServiceContext;
use crate::ws::ws_handler;

// ── Health ──────────────────────────────────────────────────────────────

pub fn health_routes() -> Router<ServiceContext> {
    Router::new().route("/health", get(health))
}

async fn health(State(ctx): State<ServiceContext>) -> impl IntoResponse {
    let last = ctx.store.current();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "refresh_state": ctx.refresh_state(),
        "time_scale": ctx.store.granularity(),
        "clients": ctx.fanout.client_count(),
        "sequence": last.as_ref().map(|p| p.sequence).unwrap_or(0),
        "last_publish": last.as_ref().map(|p| p.published_at),
    }))
}

// ── Metrics ─────────────────────────────────────────────────────────────

pub fn metrics_routes() -> Router<ServiceContext> {
    Router::new()
        .route("/api/metrics", get(metrics))
        .route("/api/dashboard", get(dashboard))
        .route("/api/time-scale", post(set_time_scale))
}

fn not_ready() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "no snapshot published yet" })),
    )
}

async fn metrics(
    State(ctx): State<ServiceContext>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let published = ctx.store.current().ok_or_else(not_ready)?;
    Ok(Json(published.as_ref().clone()))
}

async fn dashboard(
    State(ctx): State<ServiceContext>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let published = ctx.store.current().ok_or_else(not_ready)?;
    Ok(Json(DashboardPayload::from_snapshot(&published.snapshot)))
}

#[derive(Debug, Deserialize)]
struct TimeScaleRequest {
    scale: String,
}

async fn set_time_scale(
    State(ctx): State<ServiceContext>,
    Json(req): Json<TimeScaleRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let scale = ctx.change_granularity(None, &req.scale).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "time_scale": scale })),
    ))
}

// ── Live channel ────────────────────────────────────────────────────────

pub fn live_routes() -> Router<ServiceContext> {
    Router::new().route("/ws", get(ws_handler))
}
