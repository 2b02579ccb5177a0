//! Execution management service.
//!
//! The initializer resolves the catalog entry, materializes the workload,
//! processes the keychain, emits `execution_start`, and dispatches the
//! first actionable step. Projections over the event log provide the
//! execution listing and status views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::db::models::{Event, EventResponse};
use crate::db::queries;
use crate::db::DbPool;
use crate::engine::context::deep_merge;
use crate::engine::transition::{build_task, retry_policy};
use crate::error::{AppError, AppResult};
use crate::playbook::parser::ensure_terminal_step;
use crate::playbook::types::{Playbook, Step, Transition};
use crate::playbook::parse_playbook;
use crate::sanitize::sanitize_sensitive_data;
use crate::services::keychain_processor::KeychainProcessor;
use crate::snowflake::SnowflakeGenerator;

/// Request to start a playbook execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Playbook catalog path (latest version).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Specific playbook version (with `path`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Catalog ID (alternative to path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<i64>,

    /// Caller-supplied inputs, deep-merged over the playbook workload.
    #[serde(default)]
    pub payload: Value,

    /// Requestor identity recorded on the start event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requestor: Option<Value>,
}

impl ExecuteRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.path.is_none() && self.catalog_id.is_none() {
            return Err("Either 'path' or 'catalog_id' must be provided".to_string());
        }
        Ok(())
    }
}

/// Response for starting an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    pub status: String,
}

/// Parent linkage for child executions spawned by loop fan-out.
#[derive(Debug, Clone)]
pub struct ChildLink {
    pub parent_execution_id: i64,
    pub parent_event_id: Option<i64>,
    pub parent_step: String,
    /// Iteration attribution passed through to the child's job contexts.
    pub iteration: Option<Value>,
}

/// Execution summary for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub catalog_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub event_count: i64,
}

/// Detailed execution view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub execution_id: String,
    pub catalog_id: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_execution_id: Option<String>,
    pub workload: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub events: Vec<EventResponse>,
}

/// Execution management service.
#[derive(Clone)]
pub struct ExecutionService {
    pool: DbPool,
    ids: SnowflakeGenerator,
    keychain: KeychainProcessor,
}

impl ExecutionService {
    /// Create a new execution service.
    pub fn new(pool: DbPool, ids: SnowflakeGenerator, keychain: KeychainProcessor) -> Self {
        Self {
            pool,
            ids,
            keychain,
        }
    }

    /// Start a new execution from an API request.
    pub async fn execute(&self, request: ExecuteRequest) -> AppResult<i64> {
        request.validate().map_err(AppError::Validation)?;

        let entry = if let Some(catalog_id) = request.catalog_id {
            queries::catalog::get_catalog_by_id(&self.pool, catalog_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Catalog entry not found: {}", catalog_id))
                })?
        } else {
            let path = request.path.as_deref().unwrap_or_default();
            match request.version.as_deref() {
                Some(version) if version != "latest" => {
                    let version: i32 = version.parse().map_err(|_| {
                        AppError::Validation("Invalid version number".to_string())
                    })?;
                    queries::catalog::get_catalog_by_path_version(&self.pool, path, version)
                        .await?
                        .ok_or_else(|| {
                            AppError::NotFound(format!(
                                "Playbook '{}' version {} not found",
                                path, version
                            ))
                        })?
                }
                _ => queries::catalog::get_catalog_latest(&self.pool, path)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("Playbook not found: {}", path)))?,
            }
        };

        self.start_execution(entry, request.payload, request.requestor, None)
            .await
    }

    /// Start an execution by path (used for sub-playbook iterations).
    pub async fn execute_path(
        &self,
        path: &str,
        version: Option<&str>,
        payload: Value,
        link: Option<ChildLink>,
    ) -> AppResult<i64> {
        let entry = match version {
            Some(v) if v != "latest" => {
                let version: i32 = v
                    .parse()
                    .map_err(|_| AppError::Validation("Invalid version number".to_string()))?;
                queries::catalog::get_catalog_by_path_version(&self.pool, path, version)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("Playbook '{}' version {} not found", path, v))
                    })?
            }
            _ => queries::catalog::get_catalog_latest(&self.pool, path)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Playbook not found: {}", path)))?,
        };

        self.start_execution(entry, payload, None, link).await
    }

    async fn start_execution(
        &self,
        entry: crate::db::models::CatalogEntry,
        payload: Value,
        requestor: Option<Value>,
        link: Option<ChildLink>,
    ) -> AppResult<i64> {
        let playbook = load_playbook_entry(&entry)?;
        let catalog_id = entry.id;

        let execution_id = self.ids.next_id();

        // Merge default inputs with the caller payload; caller wins.
        let defaults = playbook
            .workload
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let workload = if payload.is_null() {
            defaults
        } else {
            deep_merge(&defaults, &payload)
        };

        // Keychain resolution is strict: a failed entry aborts the start.
        if let Some(defs) = &playbook.keychain {
            self.keychain
                .process(defs, catalog_id, execution_id, &workload)
                .await?;
        }

        queries::workload::insert_workload(&self.pool, execution_id, &workload).await?;

        let start_event_id = self
            .emit_execution_start(
                execution_id,
                catalog_id,
                &entry.path,
                entry.version,
                &workload,
                requestor.as_ref(),
                link.as_ref(),
            )
            .await?;

        info!(execution_id, catalog_id, path = %entry.path, "Execution started");

        self.dispatch_initial(
            &playbook,
            execution_id,
            catalog_id,
            &entry.path,
            entry.version,
            &workload,
            start_event_id,
            link.as_ref(),
        )
        .await?;

        Ok(execution_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_execution_start(
        &self,
        execution_id: i64,
        catalog_id: i64,
        path: &str,
        version: i32,
        workload: &Value,
        requestor: Option<&Value>,
        link: Option<&ChildLink>,
    ) -> AppResult<i64> {
        let mut context = Map::new();
        context.insert("catalog_id".to_string(), Value::String(catalog_id.to_string()));
        context.insert(
            "execution_id".to_string(),
            Value::String(execution_id.to_string()),
        );
        context.insert("path".to_string(), Value::String(path.to_string()));
        context.insert("version".to_string(), Value::String(version.to_string()));
        context.insert("workload".to_string(), sanitize_sensitive_data(workload));

        if let Some(link) = link {
            let mut meta = Map::new();
            meta.insert(
                "parent_step".to_string(),
                Value::String(link.parent_step.clone()),
            );
            if let Some(iteration) = &link.iteration {
                meta.insert("iteration".to_string(), iteration.clone());
            }
            context.insert("_meta".to_string(), Value::Object(meta));
        }

        let mut meta = Map::new();
        meta.insert("emitter".to_string(), Value::String("control_plane".into()));
        if let Some(requestor) = requestor {
            meta.insert("requestor".to_string(), sanitize_sensitive_data(requestor));
        }

        let event_id = self.ids.next_id();
        let event = Event {
            execution_id,
            event_id,
            catalog_id,
            parent_event_id: link.and_then(|l| l.parent_event_id),
            parent_execution_id: link.map(|l| l.parent_execution_id),
            event_type: "execution_start".to_string(),
            node_id: Some("playbook".to_string()),
            node_name: Some(path.to_string()),
            node_type: Some("playbook".to_string()),
            status: "STARTED".to_string(),
            result: None,
            error: None,
            context: Some(Value::Object(context)),
            meta: Some(Value::Object(meta)),
            current_index: None,
            current_item: None,
            loop_id: None,
            loop_name: None,
            worker_id: None,
            duration: None,
            created_at: Utc::now(),
        };

        queries::event::insert_event(&self.pool, &event).await?;
        Ok(event_id)
    }

    /// Locate and dispatch the first actionable step.
    ///
    /// If the start step is itself a plain action, it runs directly.
    /// Otherwise the unconditional first transition out of `start` names
    /// the entry step. Iterator and control targets are routed through
    /// the broker: a synthetic `step_result` completes the start step,
    /// and the next evaluation fans out.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_initial(
        &self,
        playbook: &Playbook,
        execution_id: i64,
        catalog_id: i64,
        path: &str,
        version: i32,
        workload: &Value,
        start_event_id: i64,
        link: Option<&ChildLink>,
    ) -> AppResult<()> {
        let Some(start) = playbook.get_step("start") else {
            return Err(AppError::InvalidPlaybook(
                "Workflow must have a step named 'start'".to_string(),
            ));
        };

        if start.is_actionable() && start.kind() != "iterator" {
            return self
                .dispatch_step(
                    start,
                    &Map::new(),
                    execution_id,
                    catalog_id,
                    path,
                    version,
                    workload,
                    start_event_id,
                    link,
                )
                .await;
        }

        let Some((transition, target)) = first_transition_target(start, playbook) else {
            warn!(execution_id, "No dispatchable step from 'start'");
            return Ok(());
        };

        if target.is_actionable() && target.kind() != "iterator" {
            return self
                .dispatch_step(
                    target,
                    &transition.edge_data(),
                    execution_id,
                    catalog_id,
                    path,
                    version,
                    workload,
                    start_event_id,
                    link,
                )
                .await;
        }

        // Iterator or control target: complete the start step so broker
        // evaluation takes over routing.
        let event = Event {
            execution_id,
            event_id: self.ids.next_id(),
            catalog_id,
            parent_event_id: Some(start_event_id),
            parent_execution_id: None,
            event_type: "step_result".to_string(),
            node_id: Some(format!("{}:start", execution_id)),
            node_name: Some("start".to_string()),
            node_type: Some("step".to_string()),
            status: "COMPLETED".to_string(),
            result: Some(Value::Object(Map::new())),
            error: None,
            context: None,
            meta: None,
            current_index: None,
            current_item: None,
            loop_id: None,
            loop_name: None,
            worker_id: None,
            duration: None,
            created_at: Utc::now(),
        };
        queries::event::insert_event(&self.pool, &event).await?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_step(
        &self,
        step: &Step,
        edge_data: &Map<String, Value>,
        execution_id: i64,
        catalog_id: i64,
        path: &str,
        version: i32,
        workload: &Value,
        parent_event_id: i64,
        link: Option<&ChildLink>,
    ) -> AppResult<()> {
        let node_id = format!("{}:{}", execution_id, step.step);

        let started = Event {
            execution_id,
            event_id: self.ids.next_id(),
            catalog_id,
            parent_event_id: Some(parent_event_id),
            parent_execution_id: None,
            event_type: "step_started".to_string(),
            node_id: Some(node_id.clone()),
            node_name: Some(step.step.clone()),
            node_type: Some("step".to_string()),
            status: "RUNNING".to_string(),
            result: None,
            error: None,
            context: (!edge_data.is_empty()).then(|| Value::Object(edge_data.clone())),
            meta: None,
            current_index: None,
            current_item: None,
            loop_id: None,
            loop_name: None,
            worker_id: None,
            duration: None,
            created_at: Utc::now(),
        };
        queries::event::insert_event(&self.pool, &started).await?;

        let task = build_task(step, edge_data);
        let (max_attempts, _) = retry_policy(&task);

        let mut context = Map::new();
        context.insert("workload".to_string(), workload.clone());
        context.insert("step_name".to_string(), Value::String(step.step.clone()));
        context.insert("path".to_string(), Value::String(path.to_string()));
        context.insert("version".to_string(), Value::String(version.to_string()));
        context.insert(
            "catalog_id".to_string(),
            Value::String(catalog_id.to_string()),
        );
        for (k, v) in edge_data {
            context.insert(k.clone(), v.clone());
        }
        if let Some(link) = link {
            let mut meta = Map::new();
            meta.insert(
                "parent_execution_id".to_string(),
                Value::String(link.parent_execution_id.to_string()),
            );
            meta.insert(
                "parent_step".to_string(),
                Value::String(link.parent_step.clone()),
            );
            if let Some(iteration) = &link.iteration {
                meta.insert("iteration".to_string(), iteration.clone());
            }
            context.insert("_meta".to_string(), Value::Object(meta));
        }

        queries::queue::enqueue(
            &self.pool,
            execution_id,
            catalog_id,
            &node_id,
            &task,
            &Value::Object(context),
            5,
            max_attempts,
            "queued",
            None,
        )
        .await?;

        info!(execution_id, step = %step.step, "First step enqueued");
        Ok(())
    }

    /// List recent executions.
    pub async fn list(&self, limit: i64, offset: i64) -> AppResult<Vec<ExecutionSummary>> {
        let rows: Vec<(i64, i64, DateTime<Utc>, Option<DateTime<Utc>>, i64, String)> =
            sqlx::query_as(
                r#"
                SELECT
                    execution_id,
                    MIN(catalog_id) AS catalog_id,
                    MIN(created_at) AS started_at,
                    MAX(created_at) FILTER (
                        WHERE event_type IN ('execution_complete', 'execution_failed')
                    ) AS completed_at,
                    COUNT(*) AS event_count,
                    CASE
                        WHEN bool_or(event_type = 'execution_failed') THEN 'FAILED'
                        WHEN bool_or(event_type = 'execution_complete') THEN 'COMPLETED'
                        ELSE 'RUNNING'
                    END AS status
                FROM noetl.event
                GROUP BY execution_id
                ORDER BY MIN(event_id) DESC
                LIMIT $1 OFFSET $2
                "#,
            )
            .bind(limit.min(100))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(execution_id, catalog_id, started_at, completed_at, event_count, status)| {
                    ExecutionSummary {
                        execution_id: execution_id.to_string(),
                        catalog_id: catalog_id.to_string(),
                        status,
                        started_at,
                        completed_at,
                        event_count,
                    }
                },
            )
            .collect())
    }

    /// Detailed execution view projected from the event log.
    pub async fn get(&self, execution_id: i64) -> AppResult<ExecutionDetail> {
        let events =
            queries::event::get_events_by_execution(&self.pool, execution_id, None, None).await?;

        if events.is_empty() {
            return Err(AppError::NotFound(format!(
                "Execution not found: {}",
                execution_id
            )));
        }

        let catalog_id = events[0].catalog_id;
        let start = events.iter().find(|e| e.event_type == "execution_start");
        let terminal = events.iter().rev().find(|e| {
            matches!(
                e.event_type.as_str(),
                "execution_complete" | "execution_failed"
            )
        });

        let status = match terminal.map(|e| e.event_type.as_str()) {
            Some("execution_complete") => "COMPLETED",
            Some("execution_failed") => "FAILED",
            _ => "RUNNING",
        }
        .to_string();

        let workload = queries::workload::get_workload(&self.pool, execution_id).await?;

        Ok(ExecutionDetail {
            execution_id: execution_id.to_string(),
            catalog_id: catalog_id.to_string(),
            status,
            started_at: start.map(|e| e.created_at),
            completed_at: terminal.map(|e| e.created_at),
            parent_execution_id: start
                .and_then(|e| e.parent_execution_id)
                .map(|id| id.to_string()),
            workload,
            result: terminal.and_then(|e| e.result.clone()),
            error: terminal.and_then(|e| e.error.clone()),
            events: events.into_iter().map(EventResponse::from).collect(),
        })
    }
}

/// Load the playbook for a catalog entry, preferring the parsed payload.
fn load_playbook_entry(entry: &crate::db::models::CatalogEntry) -> AppResult<Playbook> {
    if let Some(payload) = &entry.payload {
        if let Ok(pb) = serde_json::from_value::<Playbook>(payload.clone()) {
            return Ok(ensure_terminal_step(pb));
        }
    }

    Ok(ensure_terminal_step(parse_playbook(&entry.content)?))
}

/// First transition out of `start`, taken by position, resolved to its
/// target step. Conditions on start transitions are not evaluated at
/// dispatch time; they belong to broker evaluation.
fn first_transition_target<'a>(
    start: &'a Step,
    playbook: &'a Playbook,
) -> Option<(&'a Transition, &'a Step)> {
    let transition = start.transitions().into_iter().next()?;
    match playbook.get_step(transition.step_name()) {
        Some(target) => Some((transition, target)),
        None => {
            warn!(step = %transition.step_name(), "First transition target not found");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_validation() {
        let request = ExecuteRequest {
            path: None,
            version: None,
            catalog_id: None,
            payload: Value::Null,
            requestor: None,
        };
        assert!(request.validate().is_err());

        let request = ExecuteRequest {
            path: Some("examples/weather".to_string()),
            version: None,
            catalog_id: None,
            payload: Value::Null,
            requestor: None,
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_first_transition_target_is_positional() {
        // Conditions are evaluated later, not at initial dispatch: the
        // first transition wins by position even when it carries a when.
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: t
workflow:
  - step: start
    next:
      - step: first
        when: "{{ workload.go }}"
      - step: second
  - step: first
    type: python
    code: "def main(): return 1"
  - step: second
    type: python
    code: "def main(): return 2"
"#;
        let pb: Playbook = parse_playbook(yaml).unwrap();
        let start = pb.get_step("start").unwrap();

        let (transition, target) = first_transition_target(start, &pb).unwrap();
        assert_eq!(target.step, "first");
        assert!(transition.when().is_some());
    }

    #[test]
    fn test_first_transition_target_empty_next() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: t
workflow:
  - step: start
"#;
        let pb: Playbook = parse_playbook(yaml).unwrap();
        let start = pb.get_step("start").unwrap();

        assert!(first_transition_target(start, &pb).is_none());
    }

    #[test]
    fn test_load_playbook_entry_parses_content() {
        let entry = crate::db::models::CatalogEntry {
            id: 1,
            path: "t".to_string(),
            kind: "Playbook".to_string(),
            version: 1,
            content: r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: t
workflow:
  - step: start
"#
            .to_string(),
            payload: None,
            meta: None,
            created_at: Utc::now(),
        };

        let pb = load_playbook_entry(&entry).unwrap();
        assert!(pb.get_step("end").is_some(), "implicit end is appended");
    }
}
