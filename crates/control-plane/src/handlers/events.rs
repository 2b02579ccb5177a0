//! Event ingest and query handlers.
//!
//! Workers report progress by posting events; every completion event
//! triggers broker evaluation, and per-iteration completions run the loop
//! fan-in check first.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use tracing::debug;

use crate::db::models::{EventIngestRequest, EventIngestResponse, EventResponse};
use crate::engine::broker::Broker;
use crate::error::AppResult;
use crate::services::EventService;

/// State for event routes.
#[derive(Clone)]
pub struct EventsState {
    pub events: EventService,
    pub broker: Broker,
}

/// Query parameters for event listings.
#[derive(Debug, Deserialize, Default)]
pub struct EventQuery {
    /// Filter by event type.
    pub event_type: Option<String>,

    /// Maximum number of events.
    pub limit: Option<i64>,
}

/// Ingest a worker event.
///
/// `POST /api/events`
///
/// Unknown event types are rejected. Completion events advance the
/// execution through the broker.
pub async fn ingest(
    State(state): State<EventsState>,
    Json(request): Json<EventIngestRequest>,
) -> AppResult<Json<EventIngestResponse>> {
    let execution_id = request.execution_id;
    let event_type = request.event_type.clone();
    let node_id = request.node_id.clone();
    let node_name = request.node_name.clone();
    let status = request.status.to_uppercase();
    let loop_completed = request
        .context
        .as_ref()
        .and_then(|c| c.get("loop_completed"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let response = state.events.ingest(request).await?;

    let completed = matches!(status.as_str(), "COMPLETED" | "SUCCESS");
    let is_iteration = node_id
        .as_deref()
        .map(|id| id.contains("-iter-"))
        .unwrap_or(false)
        && !loop_completed;

    match event_type.as_str() {
        "action_completed" | "result" | "step_result" if completed && is_iteration => {
            // Per-iteration completion: run fan-in, then advance if the
            // aggregate landed.
            if let Some(step_name) = node_name {
                if state
                    .broker
                    .check_loop_aggregation(execution_id, &step_name)
                    .await?
                {
                    state.broker.evaluate_execution(execution_id).await?;
                }
            }
        }
        "action_completed" | "step_result" if completed => {
            state.broker.evaluate_execution(execution_id).await?;
        }
        other => {
            debug!(event_type = %other, "Event recorded without broker trigger");
        }
    }

    Ok(Json(response))
}

/// Read the event log for an execution.
///
/// `GET /api/events/by-execution/{execution_id}`
pub async fn by_execution(
    State(state): State<EventsState>,
    Path(execution_id): Path<i64>,
    Query(query): Query<EventQuery>,
) -> AppResult<Json<Vec<EventResponse>>> {
    let events = state
        .events
        .get_events(execution_id, query.event_type.as_deref(), query.limit)
        .await?;

    Ok(Json(events.into_iter().map(EventResponse::from).collect()))
}
