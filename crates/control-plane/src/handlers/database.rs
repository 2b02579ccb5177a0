//! Database schema handlers.

use axum::{extract::State, Json};
use serde_json::json;

use crate::db::{schema, DbPool};
use crate::error::AppResult;

/// Create the schema, tables, and indexes if missing.
///
/// `POST /api/db/init`
pub async fn init(State(pool): State<DbPool>) -> AppResult<Json<serde_json::Value>> {
    schema::ensure_schema(&pool).await?;

    Ok(Json(json!({
        "status": "ok",
        "message": "Schema ensured",
    })))
}

/// Validate that the required tables exist.
///
/// `GET /api/db/validate`
pub async fn validate(State(pool): State<DbPool>) -> AppResult<Json<serde_json::Value>> {
    let missing = schema::validate_schema(&pool).await?;

    Ok(Json(json!({
        "status": "ok",
        "valid": missing.is_empty(),
        "missing": missing,
    })))
}
