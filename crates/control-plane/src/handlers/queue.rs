//! Job queue handlers for workers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::db::models::{
    FailRequest, HeartbeatRequest, LeaseRequest, LeaseResponse, QueueAckResponse, QueueEntry,
    QueueSizeResponse,
};
use crate::error::AppResult;
use crate::services::QueueService;

/// Query parameters for queue inspection.
#[derive(Debug, Deserialize, Default)]
pub struct QueueQuery {
    pub status: Option<String>,
    pub execution_id: Option<i64>,
    pub limit: Option<i64>,
}

/// Lease the next ready job.
///
/// `POST /api/queue/lease`
///
/// Body: `{"worker_id": "...", "lease_seconds": 60}`. Returns
/// `{"status": "empty"}` when nothing is ready.
pub async fn lease(
    State(service): State<QueueService>,
    Json(request): Json<LeaseRequest>,
) -> AppResult<Json<LeaseResponse>> {
    let response = service
        .lease(&request.worker_id, request.lease_seconds)
        .await?;
    Ok(Json(response))
}

/// Heartbeat a leased job, optionally extending the lease.
///
/// `POST /api/queue/{queue_id}/heartbeat`
pub async fn heartbeat(
    State(service): State<QueueService>,
    Path(queue_id): Path<i64>,
    Json(request): Json<HeartbeatRequest>,
) -> AppResult<Json<QueueAckResponse>> {
    let response = service.heartbeat(queue_id, request.extend_seconds).await?;
    Ok(Json(response))
}

/// Mark a job done and advance the execution.
///
/// `POST /api/queue/{queue_id}/complete`
pub async fn complete(
    State(service): State<QueueService>,
    Path(queue_id): Path<i64>,
) -> AppResult<Json<QueueAckResponse>> {
    let response = service.complete(queue_id).await?;
    Ok(Json(response))
}

/// Mark a job failed: retry with backoff or dead-letter.
///
/// `POST /api/queue/{queue_id}/fail`
pub async fn fail(
    State(service): State<QueueService>,
    Path(queue_id): Path<i64>,
    Json(request): Json<FailRequest>,
) -> AppResult<Json<QueueAckResponse>> {
    let response = service.fail(queue_id, request).await?;
    Ok(Json(response))
}

/// Count queue entries with a status.
///
/// `GET /api/queue/size?status=queued`
pub async fn size(
    State(service): State<QueueService>,
    Query(query): Query<QueueQuery>,
) -> AppResult<Json<QueueSizeResponse>> {
    let status = query.status.as_deref().unwrap_or("queued");
    let response = service.size(status).await?;
    Ok(Json(response))
}

/// List queue entries for inspection.
///
/// `GET /api/queue/list?status=...&execution_id=...`
pub async fn list(
    State(service): State<QueueService>,
    Query(query): Query<QueueQuery>,
) -> AppResult<Json<Vec<QueueEntry>>> {
    let entries = service
        .list(
            query.status.as_deref(),
            query.execution_id,
            query.limit.unwrap_or(100),
        )
        .await?;
    Ok(Json(entries))
}
