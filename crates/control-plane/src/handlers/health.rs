//! Health check handlers.

use axum::{extract::State, Json};
use serde_json::json;

use crate::db::pool::health_check as db_health_check;
use crate::state::AppState;

/// Liveness probe.
///
/// `GET /health`
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Readiness probe with database connectivity.
///
/// `GET /api/health`
pub async fn api_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db_healthy = db_health_check(&state.db).await;

    Json(json!({
        "status": if db_healthy { "ok" } else { "degraded" },
        "server": state.config.server_name,
        "database": if db_healthy { "up" } else { "down" },
        "uptime_seconds": state.uptime_seconds(),
    }))
}
