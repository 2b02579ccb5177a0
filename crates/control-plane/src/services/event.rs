//! Event service for event-sourcing operations.
//!
//! SECURITY: event context, result, and metadata are sanitized before
//! storage so credentials passed through worker payloads never reach the
//! event log.

use chrono::Utc;

use crate::db::models::{Event, EventIngestRequest, EventIngestResponse, EventType};
use crate::db::queries::event as queries;
use crate::db::DbPool;
use crate::engine::broker::EventDraft;
use crate::error::{AppError, AppResult};
use crate::sanitize::sanitize_sensitive_data;
use crate::snowflake::SnowflakeGenerator;

/// Service for event log operations.
#[derive(Clone)]
pub struct EventService {
    pool: DbPool,
    ids: SnowflakeGenerator,
}

impl EventService {
    /// Create a new event service.
    pub fn new(pool: DbPool, ids: SnowflakeGenerator) -> Self {
        Self { pool, ids }
    }

    /// Persist a worker-submitted event.
    ///
    /// Rejects unknown event types and missing execution ids; the
    /// catalog_id is derived from the execution's history when absent.
    pub async fn ingest(&self, request: EventIngestRequest) -> AppResult<EventIngestResponse> {
        let event_type = EventType::parse(&request.event_type).ok_or_else(|| {
            AppError::BadRequest(format!("Unknown event type: {}", request.event_type))
        })?;

        if request.execution_id == 0 {
            return Err(AppError::BadRequest("Missing execution_id".to_string()));
        }

        let catalog_id = match request.catalog_id {
            Some(id) => id,
            None => queries::get_catalog_id(&self.pool, request.execution_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "Execution not found: {}",
                        request.execution_id
                    ))
                })?,
        };

        let event_id = self.ids.next_id();

        let event = Event {
            execution_id: request.execution_id,
            event_id,
            catalog_id,
            parent_event_id: request.parent_event_id,
            parent_execution_id: request.parent_execution_id,
            event_type: event_type.as_str().to_string(),
            node_id: request.node_id,
            node_name: request.node_name,
            node_type: request.node_type,
            status: request.status,
            result: request.result.as_ref().map(sanitize_sensitive_data),
            error: request.error,
            context: request.context.as_ref().map(sanitize_sensitive_data),
            meta: request.meta.as_ref().map(sanitize_sensitive_data),
            current_index: request.current_index,
            current_item: request.current_item,
            loop_id: request.loop_id,
            loop_name: request.loop_name,
            worker_id: request.worker_id,
            duration: request.duration,
            created_at: Utc::now(),
        };

        queries::insert_event(&self.pool, &event).await?;

        Ok(EventIngestResponse {
            status: "ok".to_string(),
            event_id,
        })
    }

    /// Persist a broker decision event.
    ///
    /// Duplicate terminal events per node (`step_started`,
    /// `step_completed`, `execution_complete`, `execution_failed`) are
    /// silently dropped and reported as `None`.
    pub async fn emit_draft(
        &self,
        execution_id: i64,
        catalog_id: i64,
        draft: &EventDraft,
    ) -> AppResult<Option<i64>> {
        let deduped = match draft.event_type {
            EventType::StepStarted | EventType::StepCompleted => {
                let node = draft.node_name.as_deref().unwrap_or_default();
                queries::has_node_event(&self.pool, execution_id, node, draft.event_type.as_str())
                    .await?
            }
            EventType::ExecutionComplete | EventType::ExecutionFailed => {
                queries::is_execution_terminal(&self.pool, execution_id).await?
            }
            _ => false,
        };

        if deduped {
            tracing::debug!(
                execution_id,
                event_type = %draft.event_type,
                node = ?draft.node_name,
                "Duplicate terminal event dropped"
            );
            return Ok(None);
        }

        let event_id = self.ids.next_id();

        let event = Event {
            execution_id,
            event_id,
            catalog_id,
            parent_event_id: draft.parent_event_id,
            parent_execution_id: None,
            event_type: draft.event_type.as_str().to_string(),
            node_id: draft.node_id.clone(),
            node_name: draft.node_name.clone(),
            node_type: draft.node_type.clone(),
            status: draft.status.as_str().to_string(),
            result: draft.result.as_ref().map(sanitize_sensitive_data),
            error: draft.error.clone(),
            context: draft.context.clone(),
            meta: None,
            current_index: draft.current_index,
            current_item: draft.current_item.clone(),
            loop_id: draft.loop_id.clone(),
            loop_name: draft.loop_name.clone(),
            worker_id: None,
            duration: None,
            created_at: Utc::now(),
        };

        queries::insert_event(&self.pool, &event).await?;

        Ok(Some(event_id))
    }

    /// Events for an execution, ordered by event_id.
    pub async fn get_events(
        &self,
        execution_id: i64,
        event_type: Option<&str>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Event>> {
        queries::get_events_by_execution(&self.pool, execution_id, event_type, limit).await
    }

}
