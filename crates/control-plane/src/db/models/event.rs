//! Event model for execution event sourcing.
//!
//! All execution state is derived from events stored in the event table.
//! The table is append-only; events are never updated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Closed set of event types accepted by the event log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStart,
    StepStarted,
    ActionStarted,
    ActionCompleted,
    ActionError,
    ActionFailed,
    StepCompleted,
    StepFailed,
    StepResult,
    LoopIteration,
    LoopCompleted,
    Result,
    ExecutionComplete,
    ExecutionFailed,
}

impl EventType {
    /// Parse an event type; unknown names are rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execution_start" => Some(Self::ExecutionStart),
            "step_started" => Some(Self::StepStarted),
            "action_started" => Some(Self::ActionStarted),
            "action_completed" => Some(Self::ActionCompleted),
            "action_error" => Some(Self::ActionError),
            "action_failed" => Some(Self::ActionFailed),
            "step_completed" => Some(Self::StepCompleted),
            "step_failed" => Some(Self::StepFailed),
            "step_result" => Some(Self::StepResult),
            "loop_iteration" => Some(Self::LoopIteration),
            "loop_completed" => Some(Self::LoopCompleted),
            "result" => Some(Self::Result),
            "execution_complete" => Some(Self::ExecutionComplete),
            "execution_failed" => Some(Self::ExecutionFailed),
            _ => None,
        }
    }

    /// The wire name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStart => "execution_start",
            Self::StepStarted => "step_started",
            Self::ActionStarted => "action_started",
            Self::ActionCompleted => "action_completed",
            Self::ActionError => "action_error",
            Self::ActionFailed => "action_failed",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepResult => "step_result",
            Self::LoopIteration => "loop_iteration",
            Self::LoopCompleted => "loop_completed",
            Self::Result => "result",
            Self::ExecutionComplete => "execution_complete",
            Self::ExecutionFailed => "execution_failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event status values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Started,
    Running,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Database event record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Event {
    /// Execution identifier.
    pub execution_id: i64,

    /// Event identifier (Snowflake); monotonic within an execution.
    pub event_id: i64,

    /// Catalog entry ID.
    pub catalog_id: i64,

    /// Causal parent event.
    pub parent_event_id: Option<i64>,

    /// Parent execution ID (for child executions spawned by loops).
    pub parent_execution_id: Option<i64>,

    /// Event type.
    pub event_type: String,

    /// Node identifier (e.g., "{execution_id}:{step_name}").
    pub node_id: Option<String>,

    /// Node name (step name).
    pub node_name: Option<String>,

    /// Node type (step, action, loop, playbook).
    pub node_type: Option<String>,

    /// Event status (RUNNING / COMPLETED / FAILED).
    pub status: String,

    /// Result data (JSON).
    pub result: Option<serde_json::Value>,

    /// Error message.
    pub error: Option<String>,

    /// Event context (JSON).
    pub context: Option<serde_json::Value>,

    /// Event metadata (JSON).
    pub meta: Option<serde_json::Value>,

    /// Iteration index (loop events).
    pub current_index: Option<i32>,

    /// Iteration item (loop events).
    pub current_item: Option<serde_json::Value>,

    /// Loop identifier ("{execution_id}:{step_name}").
    pub loop_id: Option<String>,

    /// Loop step name.
    pub loop_name: Option<String>,

    /// Worker that produced the event.
    pub worker_id: Option<String>,

    /// Action duration in seconds.
    pub duration: Option<f64>,

    /// When the event was created.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Whether this event records a per-iteration completion rather than a
    /// whole-step completion. Iteration node ids carry an `-iter-` marker;
    /// the final aggregate sets `loop_completed` in its context.
    pub fn is_iteration_event(&self) -> bool {
        let iter_node = self
            .node_id
            .as_deref()
            .map(|id| id.contains("-iter-"))
            .unwrap_or(false);

        if !iter_node {
            return false;
        }

        !self
            .context
            .as_ref()
            .and_then(|c| c.get("loop_completed"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Wire-format event payload accepted from workers on `POST /api/events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventIngestRequest {
    /// Execution identifier.
    pub execution_id: i64,

    /// Catalog entry ID (derived from the execution when absent).
    #[serde(default)]
    pub catalog_id: Option<i64>,

    /// Event type (must be in the closed set).
    pub event_type: String,

    /// Causal parent event.
    #[serde(default)]
    pub parent_event_id: Option<i64>,

    /// Parent execution for child executions.
    #[serde(default)]
    pub parent_execution_id: Option<i64>,

    /// Node identifier.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Node name (step name).
    #[serde(default)]
    pub node_name: Option<String>,

    /// Node type.
    #[serde(default)]
    pub node_type: Option<String>,

    /// Event status.
    #[serde(default = "default_status")]
    pub status: String,

    /// Result data.
    #[serde(default)]
    pub result: Option<serde_json::Value>,

    /// Error message.
    #[serde(default)]
    pub error: Option<String>,

    /// Event context.
    #[serde(default)]
    pub context: Option<serde_json::Value>,

    /// Event metadata.
    #[serde(default)]
    pub meta: Option<serde_json::Value>,

    /// Iteration index.
    #[serde(default)]
    pub current_index: Option<i32>,

    /// Iteration item.
    #[serde(default)]
    pub current_item: Option<serde_json::Value>,

    /// Loop identifier.
    #[serde(default)]
    pub loop_id: Option<String>,

    /// Loop step name.
    #[serde(default)]
    pub loop_name: Option<String>,

    /// Worker that produced the event.
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Action duration in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
}

fn default_status() -> String {
    "RUNNING".to_string()
}

/// Response after emitting an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventIngestResponse {
    /// Operation status.
    pub status: String,

    /// Assigned event ID.
    pub event_id: i64,
}

/// Event response for API listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub event_id: String,
    pub execution_id: String,
    pub event_type: String,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub status: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub current_index: Option<i32>,
    pub loop_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Event> for EventResponse {
    fn from(e: Event) -> Self {
        Self {
            event_id: e.event_id.to_string(),
            execution_id: e.execution_id.to_string(),
            event_type: e.event_type,
            node_id: e.node_id,
            node_name: e.node_name,
            status: e.status,
            result: e.result,
            error: e.error,
            current_index: e.current_index,
            loop_name: e.loop_name,
            created_at: e.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        for name in [
            "execution_start",
            "step_started",
            "action_started",
            "action_completed",
            "action_error",
            "action_failed",
            "step_completed",
            "step_failed",
            "step_result",
            "loop_iteration",
            "loop_completed",
            "result",
            "execution_complete",
            "execution_failed",
        ] {
            let parsed = EventType::parse(name).expect(name);
            assert_eq!(parsed.as_str(), name);
        }
    }

    #[test]
    fn test_event_type_rejects_unknown() {
        assert!(EventType::parse("command.issued").is_none());
        assert!(EventType::parse("").is_none());
    }

    #[test]
    fn test_iteration_event_detection() {
        let mut event = Event {
            execution_id: 1,
            event_id: 2,
            catalog_id: 3,
            parent_event_id: None,
            parent_execution_id: None,
            event_type: "action_completed".to_string(),
            node_id: Some("1-step-2-iter-0".to_string()),
            node_name: Some("fanout".to_string()),
            node_type: Some("task".to_string()),
            status: "COMPLETED".to_string(),
            result: None,
            error: None,
            context: None,
            meta: None,
            current_index: Some(0),
            current_item: None,
            loop_id: None,
            loop_name: None,
            worker_id: None,
            duration: None,
            created_at: Utc::now(),
        };

        assert!(event.is_iteration_event());

        // The final aggregate is a step-level completion
        event.context = Some(serde_json::json!({"loop_completed": true}));
        assert!(!event.is_iteration_event());

        event.context = None;
        event.node_id = Some("1:fanout".to_string());
        assert!(!event.is_iteration_event());
    }

    #[test]
    fn test_ingest_request_defaults() {
        let json = r#"{"execution_id": 1, "event_type": "action_completed"}"#;
        let request: EventIngestRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.status, "RUNNING");
        assert!(request.node_name.is_none());
    }
}
