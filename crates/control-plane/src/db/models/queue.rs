//! Job queue database model.
//!
//! One row per unit of work assigned to one worker. The unique
//! `(execution_id, node_id)` constraint is the idempotency mechanism that
//! makes broker evaluation safe to re-run: a duplicate enqueue is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Queue entry statuses form a fixed DAG:
/// `queued -> leased -> (done | retry | dead)`; `retry -> queued` via lease
/// once `available_at` passes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Leased,
    Retry,
    Done,
    Dead,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Retry => "retry",
            Self::Done => "done",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queue entry row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Queue entry ID.
    pub queue_id: i64,

    /// Execution this job belongs to.
    pub execution_id: i64,

    /// Catalog entry of the playbook.
    pub catalog_id: i64,

    /// Node identifier; unique per execution.
    pub node_id: String,

    /// Encoded task JSON.
    pub action: serde_json::Value,

    /// Rendered template context for the worker.
    pub context: Option<serde_json::Value>,

    /// Priority; higher drains first.
    pub priority: i32,

    /// Current status.
    pub status: String,

    /// Lease attempts so far.
    pub attempts: i32,

    /// Attempts allowed before the entry goes dead.
    pub max_attempts: i32,

    /// Earliest time the entry may be leased.
    pub available_at: DateTime<Utc>,

    /// Worker currently holding the lease.
    pub worker_id: Option<String>,

    /// Lease expiry; the reaper reclaims entries past this.
    pub lease_until: Option<DateTime<Utc>>,

    /// Last worker heartbeat.
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Request to lease a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Worker identifier.
    pub worker_id: String,

    /// Lease duration in seconds.
    #[serde(default)]
    pub lease_seconds: Option<i64>,
}

/// Leased job returned to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedJob {
    pub queue_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub node_id: String,
    pub action: serde_json::Value,
    pub context: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
}

impl From<QueueEntry> for LeasedJob {
    fn from(entry: QueueEntry) -> Self {
        Self {
            queue_id: entry.queue_id,
            execution_id: entry.execution_id,
            catalog_id: entry.catalog_id,
            node_id: entry.node_id,
            action: entry.action,
            context: entry.context.unwrap_or(serde_json::Value::Null),
            attempts: entry.attempts,
            max_attempts: entry.max_attempts,
        }
    }
}

/// Response for a lease request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    /// "ok" when a job was leased, "empty" otherwise.
    pub status: String,

    /// The leased job, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<LeasedJob>,
}

/// Request to heartbeat a leased job.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatRequest {
    /// Extend the lease by this many seconds.
    #[serde(default)]
    pub extend_seconds: Option<i64>,
}

/// Request to fail a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    /// Whether the failure is retryable.
    #[serde(default = "default_retry")]
    pub retry: bool,

    /// Delay before the retry becomes available.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: i64,

    /// Worker-reported error message.
    #[serde(default)]
    pub error: Option<String>,
}

fn default_retry() -> bool {
    true
}

fn default_retry_delay() -> i64 {
    60
}

impl Default for FailRequest {
    fn default() -> Self {
        Self {
            retry: default_retry(),
            retry_delay_seconds: default_retry_delay(),
            error: None,
        }
    }
}

/// Generic queue operation acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueAckResponse {
    pub status: String,
    pub queue_id: i64,
}

/// Queue size response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSizeResponse {
    pub status: String,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(QueueStatus::Queued.to_string(), "queued");
        assert_eq!(QueueStatus::Dead.to_string(), "dead");
    }

    #[test]
    fn test_fail_request_defaults() {
        let request: FailRequest = serde_json::from_str("{}").unwrap();
        assert!(request.retry);
        assert_eq!(request.retry_delay_seconds, 60);
        assert!(request.error.is_none());
    }

    #[test]
    fn test_lease_response_empty_omits_job() {
        let response = LeaseResponse {
            status: "empty".to_string(),
            job: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("job"));
    }
}
