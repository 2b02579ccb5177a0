//! Execution inspection handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::error::AppResult;
use crate::services::execution::{ExecutionDetail, ExecutionService, ExecutionSummary};

/// Query parameters for execution listings.
#[derive(Debug, Deserialize, Default)]
pub struct ExecutionsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// List recent executions.
///
/// `GET /api/executions`
pub async fn list(
    State(service): State<ExecutionService>,
    Query(query): Query<ExecutionsQuery>,
) -> AppResult<Json<Vec<ExecutionSummary>>> {
    let executions = service
        .list(query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(executions))
}

/// Projected execution view: status, workload, result, and event trace.
///
/// `GET /api/executions/{execution_id}`
pub async fn get(
    State(service): State<ExecutionService>,
    Path(execution_id): Path<i64>,
) -> AppResult<Json<ExecutionDetail>> {
    let detail = service.get(execution_id).await?;
    Ok(Json(detail))
}
