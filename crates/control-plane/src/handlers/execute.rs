//! Execution start handler.

use axum::{extract::State, Json};
use tracing::info;

use crate::engine::broker::Broker;
use crate::error::{AppError, AppResult};
use crate::services::execution::{ExecuteRequest, ExecuteResponse, ExecutionService};

/// State for the execute route.
#[derive(Clone)]
pub struct ExecuteState {
    pub executions: ExecutionService,
    pub broker: Broker,
}

/// Start a new playbook execution.
///
/// `POST /api/execute`
///
/// Resolves the catalog entry, materializes the workload, processes the
/// keychain, emits `execution_start`, and dispatches the first actionable
/// step. Returns `{"execution_id": "..."}`.
pub async fn execute(
    State(state): State<ExecuteState>,
    Json(request): Json<ExecuteRequest>,
) -> AppResult<Json<ExecuteResponse>> {
    request.validate().map_err(AppError::Validation)?;

    let execution_id = state.executions.execute(request).await?;

    // Control-flow-only entry points are routed through the broker.
    state.broker.evaluate_execution(execution_id).await?;

    info!(execution_id, "Execution accepted");

    Ok(Json(ExecuteResponse {
        execution_id: execution_id.to_string(),
        status: "started".to_string(),
    }))
}
