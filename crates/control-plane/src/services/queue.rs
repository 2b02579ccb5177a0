//! Job queue service.
//!
//! Wraps the transactional queue operations and wires completions into the
//! broker: every `complete` triggers evaluation for the job's execution,
//! and child-execution completions are mapped back into the parent loop's
//! per-iteration `result` events.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::models::{
    Event, FailRequest, LeaseResponse, LeasedJob, QueueAckResponse, QueueEntry, QueueSizeResponse,
};
use crate::db::queries;
use crate::db::DbPool;
use crate::engine::broker::Broker;
use crate::engine::context::flatten_result_envelope;
use crate::error::{AppError, AppResult};
use crate::snowflake::SnowflakeGenerator;

/// Service for queue operations.
#[derive(Clone)]
pub struct QueueService {
    pool: DbPool,
    ids: SnowflakeGenerator,
    broker: Broker,
    default_lease_seconds: i64,
}

impl QueueService {
    /// Create a new queue service.
    pub fn new(
        pool: DbPool,
        ids: SnowflakeGenerator,
        broker: Broker,
        default_lease_seconds: i64,
    ) -> Self {
        Self {
            pool,
            ids,
            broker,
            default_lease_seconds,
        }
    }

    /// Atomically lease the next ready job for a worker.
    pub async fn lease(
        &self,
        worker_id: &str,
        lease_seconds: Option<i64>,
    ) -> AppResult<LeaseResponse> {
        let lease_seconds = lease_seconds.unwrap_or(self.default_lease_seconds);

        match queries::queue::lease(&self.pool, worker_id, lease_seconds).await? {
            Some(entry) => {
                debug!(queue_id = entry.queue_id, worker_id, "Job leased");
                Ok(LeaseResponse {
                    status: "ok".to_string(),
                    job: Some(LeasedJob::from(entry)),
                })
            }
            None => Ok(LeaseResponse {
                status: "empty".to_string(),
                job: None,
            }),
        }
    }

    /// Refresh a lease heartbeat, optionally extending it.
    pub async fn heartbeat(
        &self,
        queue_id: i64,
        extend_seconds: Option<i64>,
    ) -> AppResult<QueueAckResponse> {
        if !queries::queue::heartbeat(&self.pool, queue_id, extend_seconds).await? {
            return Err(AppError::NotFound(format!("Queue entry not found: {}", queue_id)));
        }

        Ok(QueueAckResponse {
            status: "ok".to_string(),
            queue_id,
        })
    }

    /// Mark a job done and advance the execution.
    ///
    /// When the completed job belongs to a child execution spawned by a
    /// loop, the child's final result is recorded against the parent as a
    /// per-iteration `result` event and the loop fan-in check runs.
    pub async fn complete(&self, queue_id: i64) -> AppResult<QueueAckResponse> {
        let entry = queries::queue::mark_done(&self.pool, queue_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Queue entry not found: {}", queue_id)))?;

        let execution_id = entry.execution_id;

        // Advance this execution first; a finished child reaches
        // execution_complete here before its result is mapped upward.
        self.broker.evaluate_execution(execution_id).await?;

        let parent = self.map_child_result(&entry).await.unwrap_or_else(|e| {
            warn!(queue_id, error = %e, "Loop result mapping failed");
            None
        });

        // Fan-in for in-process iterations of this execution.
        if let Some(loop_name) = iteration_loop_name(&entry) {
            if self
                .broker
                .check_loop_aggregation(execution_id, &loop_name)
                .await?
            {
                self.broker.evaluate_execution(execution_id).await?;
            }
        }

        if let Some(parent_execution_id) = parent {
            self.broker.evaluate_execution(parent_execution_id).await?;
        }

        Ok(QueueAckResponse {
            status: "ok".to_string(),
            queue_id,
        })
    }

    /// Mark a job failed: retry with backoff while attempts remain, dead
    /// otherwise. A dead entry fails its step and the whole execution.
    pub async fn fail(&self, queue_id: i64, request: FailRequest) -> AppResult<QueueAckResponse> {
        let entry = queries::queue::get_by_id(&self.pool, queue_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Queue entry not found: {}", queue_id)))?;

        match failure_outcome(entry.attempts, entry.max_attempts, request.retry) {
            FailureOutcome::Dead => {
                queries::queue::mark_dead(&self.pool, queue_id).await?;
                info!(
                    queue_id,
                    attempts = entry.attempts,
                    "Job dead-lettered; failing execution"
                );
                self.emit_final_failure(&entry, request.error.as_deref())
                    .await?;
            }
            FailureOutcome::Retry => {
                queries::queue::mark_retry(&self.pool, queue_id, request.retry_delay_seconds)
                    .await?;
                debug!(
                    queue_id,
                    attempts = entry.attempts,
                    max_attempts = entry.max_attempts,
                    "Job scheduled for retry"
                );
            }
        }

        Ok(QueueAckResponse {
            status: "ok".to_string(),
            queue_id,
        })
    }

    /// Reset expired leases back to `queued`. Run periodically.
    pub async fn reap(&self) -> AppResult<u64> {
        let reclaimed = queries::queue::reap_expired(&self.pool).await?;
        if reclaimed > 0 {
            info!(reclaimed, "Expired leases reclaimed");
        }
        Ok(reclaimed)
    }

    /// Count entries with a status.
    pub async fn size(&self, status: &str) -> AppResult<QueueSizeResponse> {
        let count = queries::queue::count_by_status(&self.pool, status).await?;
        Ok(QueueSizeResponse {
            status: "ok".to_string(),
            count,
        })
    }

    /// List queue entries for inspection.
    pub async fn list(
        &self,
        status: Option<&str>,
        execution_id: Option<i64>,
        limit: i64,
    ) -> AppResult<Vec<QueueEntry>> {
        queries::queue::list(&self.pool, status, execution_id, limit).await
    }

    /// Map a completed child execution's result into its parent loop.
    ///
    /// Returns the parent execution id when mapping happened.
    async fn map_child_result(&self, entry: &QueueEntry) -> AppResult<Option<i64>> {
        let Some(meta) = job_meta(entry) else {
            return Ok(None);
        };

        let Some(parent_execution_id) = read_i64(&meta, "parent_execution_id") else {
            return Ok(None);
        };
        let Some(parent_step) = meta.get("parent_step").and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        if parent_execution_id == entry.execution_id {
            return Ok(None);
        }

        info!(
            child = entry.execution_id,
            parent = parent_execution_id,
            step = %parent_step,
            "Recording child execution result for parent loop"
        );

        let return_step = entry
            .action
            .get("with")
            .and_then(|w| w.get("return_step"))
            .or_else(|| entry.action.get("return_step"))
            .and_then(|v| v.as_str());

        let child_result = self
            .child_final_result(entry.execution_id, return_step)
            .await?;

        // Iteration attribution: job meta first, loop_iteration event as
        // fallback.
        let iteration = meta.get("iteration").cloned();
        let (node_id, current_index, current_item, loop_id, loop_name) = match &iteration {
            Some(iter) => (
                iter.get("node_id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| format!("{}-iter-{}", parent_execution_id, entry.execution_id)),
                iter.get("current_index").and_then(|v| v.as_i64()).map(|i| i as i32),
                iter.get("current_item").cloned(),
                iter.get("loop_id").and_then(|v| v.as_str()).map(String::from),
                iter.get("loop_name").and_then(|v| v.as_str()).map(String::from),
            ),
            None => {
                let event = queries::event::find_iteration_for_child(
                    &self.pool,
                    parent_execution_id,
                    parent_step,
                    entry.execution_id,
                )
                .await?;
                match event {
                    Some(e) => (
                        e.node_id.unwrap_or_else(|| {
                            format!("{}-iter-{}", parent_execution_id, entry.execution_id)
                        }),
                        e.current_index,
                        e.current_item,
                        e.loop_id,
                        e.loop_name,
                    ),
                    None => (
                        format!("{}-iter-{}", parent_execution_id, entry.execution_id),
                        None,
                        None,
                        None,
                        None,
                    ),
                }
            }
        };

        let catalog_id = queries::event::get_catalog_id(&self.pool, parent_execution_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("No events for execution {}", parent_execution_id))
            })?;

        let event = Event {
            execution_id: parent_execution_id,
            event_id: self.ids.next_id(),
            catalog_id,
            parent_event_id: None,
            parent_execution_id: None,
            event_type: "result".to_string(),
            node_id: Some(node_id),
            node_name: Some(parent_step.to_string()),
            node_type: Some("task".to_string()),
            status: "COMPLETED".to_string(),
            result: child_result,
            error: None,
            context: Some(serde_json::json!({
                "child_execution_id": entry.execution_id.to_string(),
                "parent_step": parent_step,
                "return_step": return_step,
            })),
            meta: None,
            current_index,
            current_item,
            loop_id,
            loop_name,
            worker_id: None,
            duration: None,
            created_at: chrono::Utc::now(),
        };
        queries::event::insert_event(&self.pool, &event).await?;

        if self
            .broker
            .check_loop_aggregation(parent_execution_id, parent_step)
            .await?
        {
            debug!(parent = parent_execution_id, step = %parent_step, "Loop aggregate emitted");
        }

        Ok(Some(parent_execution_id))
    }

    /// The child execution's final result: `execution_complete` first, the
    /// configured return step next, the last meaningful action result last.
    async fn child_final_result(
        &self,
        child_execution_id: i64,
        return_step: Option<&str>,
    ) -> AppResult<Option<Value>> {
        if let Some(event) =
            queries::event::get_latest_event(&self.pool, child_execution_id, None, "execution_complete")
                .await?
        {
            if let Some(result) = event.result {
                return Ok(Some(flatten_result_envelope(&result)));
            }
        }

        if let Some(step) = return_step {
            if let Some(result) =
                queries::event::get_last_meaningful_result(&self.pool, child_execution_id, Some(step))
                    .await?
            {
                return Ok(Some(flatten_result_envelope(&result)));
            }
        }

        Ok(
            queries::event::get_last_meaningful_result(&self.pool, child_execution_id, None)
                .await?
                .map(|r| flatten_result_envelope(&r)),
        )
    }

    /// Emit `step_failed` and `execution_failed` for a dead entry, carrying
    /// the last worker-reported error.
    async fn emit_final_failure(
        &self,
        entry: &QueueEntry,
        request_error: Option<&str>,
    ) -> AppResult<()> {
        let step_name = entry
            .context
            .as_ref()
            .and_then(|c| c.get("step_name"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| {
                entry
                    .node_id
                    .split(':')
                    .next_back()
                    .unwrap_or("unknown")
                    .to_string()
            });

        let last_error = match request_error {
            Some(error) => Some(error.to_string()),
            None => queries::event::get_latest_event(
                &self.pool,
                entry.execution_id,
                Some(&step_name),
                "action_error",
            )
            .await?
            .and_then(|e| e.error),
        }
        .unwrap_or_else(|| "Task failed after all retry attempts".to_string());

        let step_failed = Event {
            execution_id: entry.execution_id,
            event_id: self.ids.next_id(),
            catalog_id: entry.catalog_id,
            parent_event_id: None,
            parent_execution_id: None,
            event_type: "step_failed".to_string(),
            node_id: Some(entry.node_id.clone()),
            node_name: Some(step_name.clone()),
            node_type: Some("step".to_string()),
            status: "FAILED".to_string(),
            result: None,
            error: Some(last_error.clone()),
            context: None,
            meta: None,
            current_index: None,
            current_item: None,
            loop_id: None,
            loop_name: None,
            worker_id: entry.worker_id.clone(),
            duration: None,
            created_at: chrono::Utc::now(),
        };
        queries::event::insert_event(&self.pool, &step_failed).await?;

        let execution_failed = Event {
            execution_id: entry.execution_id,
            event_id: self.ids.next_id(),
            catalog_id: entry.catalog_id,
            parent_event_id: Some(step_failed.event_id),
            parent_execution_id: None,
            event_type: "execution_failed".to_string(),
            node_id: Some(entry.execution_id.to_string()),
            node_name: Some(step_name.clone()),
            node_type: Some("playbook".to_string()),
            status: "FAILED".to_string(),
            result: Some(serde_json::json!({
                "failed_step": step_name,
                "reason": last_error,
            })),
            error: Some(format!(
                "Execution failed at step '{}': {}",
                step_name, last_error
            )),
            context: None,
            meta: None,
            current_index: None,
            current_item: None,
            loop_id: None,
            loop_name: None,
            worker_id: None,
            duration: None,
            created_at: chrono::Utc::now(),
        };
        queries::event::insert_event(&self.pool, &execution_failed).await?;

        Ok(())
    }
}

/// Outcome of a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureOutcome {
    Retry,
    Dead,
}

/// Failure transition: dead when the caller forbids retry or attempts are
/// exhausted, retry otherwise.
fn failure_outcome(attempts: i32, max_attempts: i32, retry: bool) -> FailureOutcome {
    if !retry || attempts >= max_attempts {
        FailureOutcome::Dead
    } else {
        FailureOutcome::Retry
    }
}

/// The `_meta` block of a job's context.
fn job_meta(entry: &QueueEntry) -> Option<Value> {
    entry.context.as_ref()?.get("_meta").cloned()
}

/// The loop step name when a queue entry is one in-process iteration.
fn iteration_loop_name(entry: &QueueEntry) -> Option<String> {
    if !entry.node_id.contains("-iter-") {
        return None;
    }

    job_meta(entry)?
        .get("iteration")?
        .get("loop_name")?
        .as_str()
        .map(String::from)
}

/// Parse an i64 that may be encoded as a JSON number or string.
fn read_i64(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn entry_with_context(context: Option<Value>) -> QueueEntry {
        QueueEntry {
            queue_id: 1,
            execution_id: 100,
            catalog_id: 7,
            node_id: "100:step".to_string(),
            action: json!({"type": "python"}),
            context,
            priority: 5,
            status: "leased".to_string(),
            attempts: 1,
            max_attempts: 3,
            available_at: Utc::now(),
            worker_id: Some("w1".to_string()),
            lease_until: None,
            last_heartbeat: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_job_meta_extraction() {
        let entry = entry_with_context(Some(json!({
            "_meta": {"parent_execution_id": "42", "parent_step": "fan"}
        })));

        let meta = job_meta(&entry).unwrap();
        assert_eq!(read_i64(&meta, "parent_execution_id"), Some(42));
        assert_eq!(meta["parent_step"], "fan");
    }

    #[test]
    fn test_read_i64_accepts_number_and_string() {
        let value = json!({"a": 5, "b": "6", "c": true});
        assert_eq!(read_i64(&value, "a"), Some(5));
        assert_eq!(read_i64(&value, "b"), Some(6));
        assert_eq!(read_i64(&value, "c"), None);
        assert_eq!(read_i64(&value, "missing"), None);
    }

    #[test]
    fn test_failure_outcome_retry_then_dead() {
        // Three attempts allowed: first two failures retry, the third is
        // terminal.
        assert_eq!(failure_outcome(1, 3, true), FailureOutcome::Retry);
        assert_eq!(failure_outcome(2, 3, true), FailureOutcome::Retry);
        assert_eq!(failure_outcome(3, 3, true), FailureOutcome::Dead);
    }

    #[test]
    fn test_failure_outcome_non_retryable() {
        assert_eq!(failure_outcome(1, 3, false), FailureOutcome::Dead);
    }

    #[test]
    fn test_iteration_loop_name() {
        let mut entry = entry_with_context(Some(json!({
            "_meta": {"iteration": {"loop_name": "fan", "current_index": 0}}
        })));
        entry.node_id = "100-step-2-iter-0".to_string();

        assert_eq!(iteration_loop_name(&entry), Some("fan".to_string()));

        entry.node_id = "100:fan".to_string();
        assert_eq!(iteration_loop_name(&entry), None);
    }
}
