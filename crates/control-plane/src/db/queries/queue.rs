//! Job queue database queries.
//!
//! All mutations are single statements, so every operation is atomic from
//! the workers' point of view. Leasing uses `FOR UPDATE SKIP LOCKED` so any
//! number of workers can poll concurrently without contention.

use chrono::{DateTime, Utc};

use crate::db::models::QueueEntry;
use crate::db::DbPool;
use crate::error::AppResult;

const QUEUE_COLUMNS: &str = r#"
    queue_id, execution_id, catalog_id, node_id, action, context, priority,
    status, attempts, max_attempts, available_at, worker_id, lease_until,
    last_heartbeat, created_at
"#;

/// Insert a queue entry.
///
/// `ON CONFLICT (execution_id, node_id) DO NOTHING`: a `None` return means
/// the step is already queued, which makes repeated broker evaluation safe.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue(
    pool: &DbPool,
    execution_id: i64,
    catalog_id: i64,
    node_id: &str,
    action: &serde_json::Value,
    context: &serde_json::Value,
    priority: i32,
    max_attempts: i32,
    status: &str,
    available_at: Option<DateTime<Utc>>,
) -> AppResult<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO noetl.queue (
            execution_id, catalog_id, node_id, action, context,
            priority, max_attempts, status, available_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, COALESCE($9, now()))
        ON CONFLICT (execution_id, node_id) DO NOTHING
        RETURNING queue_id
        "#,
    )
    .bind(execution_id)
    .bind(catalog_id)
    .bind(node_id)
    .bind(action)
    .bind(context)
    .bind(priority)
    .bind(max_attempts)
    .bind(status)
    .bind(available_at)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id,)| id))
}

/// Atomically lease the highest-priority ready entry.
///
/// Picks from `queued`/`retry` rows whose `available_at` has passed,
/// priority DESC then queue_id (FIFO by insertion), and increments
/// `attempts`.
pub async fn lease(
    pool: &DbPool,
    worker_id: &str,
    lease_seconds: i64,
) -> AppResult<Option<QueueEntry>> {
    let entry = sqlx::query_as::<_, QueueEntry>(&format!(
        r#"
        WITH ready AS (
            SELECT queue_id FROM noetl.queue
            WHERE status IN ('queued', 'retry') AND available_at <= now()
            ORDER BY priority DESC, queue_id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE noetl.queue q
        SET status = 'leased',
            worker_id = $1,
            lease_until = now() + ($2 || ' seconds')::interval,
            last_heartbeat = now(),
            attempts = q.attempts + 1
        FROM ready
        WHERE q.queue_id = ready.queue_id
        RETURNING {QUEUE_COLUMNS}
        "#
    ))
    .bind(worker_id)
    .bind(lease_seconds.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// Get a queue entry by ID.
pub async fn get_by_id(pool: &DbPool, queue_id: i64) -> AppResult<Option<QueueEntry>> {
    let entry = sqlx::query_as::<_, QueueEntry>(&format!(
        r#"
        SELECT {QUEUE_COLUMNS}
        FROM noetl.queue
        WHERE queue_id = $1
        "#
    ))
    .bind(queue_id)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// Update heartbeat and optionally extend the lease.
pub async fn heartbeat(
    pool: &DbPool,
    queue_id: i64,
    extend_seconds: Option<i64>,
) -> AppResult<bool> {
    let rows = if let Some(extend) = extend_seconds {
        sqlx::query(
            r#"
            UPDATE noetl.queue
            SET last_heartbeat = now(),
                lease_until = now() + ($1 || ' seconds')::interval
            WHERE queue_id = $2 AND status = 'leased'
            "#,
        )
        .bind(extend.to_string())
        .bind(queue_id)
        .execute(pool)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE noetl.queue
            SET last_heartbeat = now()
            WHERE queue_id = $1
            "#,
        )
        .bind(queue_id)
        .execute(pool)
        .await?
    };

    Ok(rows.rows_affected() > 0)
}

/// Mark an entry done. Returns the updated row.
pub async fn mark_done(pool: &DbPool, queue_id: i64) -> AppResult<Option<QueueEntry>> {
    let entry = sqlx::query_as::<_, QueueEntry>(&format!(
        r#"
        UPDATE noetl.queue
        SET status = 'done', lease_until = NULL
        WHERE queue_id = $1
        RETURNING {QUEUE_COLUMNS}
        "#
    ))
    .bind(queue_id)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// Mark an entry dead.
pub async fn mark_dead(pool: &DbPool, queue_id: i64) -> AppResult<()> {
    sqlx::query("UPDATE noetl.queue SET status = 'dead', lease_until = NULL WHERE queue_id = $1")
        .bind(queue_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Schedule an entry for retry after a delay.
pub async fn mark_retry(pool: &DbPool, queue_id: i64, retry_delay_seconds: i64) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE noetl.queue
        SET status = 'retry',
            worker_id = NULL,
            lease_until = NULL,
            available_at = now() + ($1 || ' seconds')::interval
        WHERE queue_id = $2
        "#,
    )
    .bind(retry_delay_seconds.to_string())
    .bind(queue_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark the in-flight iterator entry for a step done.
pub async fn mark_iterator_done(
    pool: &DbPool,
    execution_id: i64,
    node_id: &str,
) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE noetl.queue
        SET status = 'done', lease_until = NULL
        WHERE execution_id = $1 AND node_id = $2 AND status = 'leased'
        "#,
    )
    .bind(execution_id)
    .bind(node_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Reset expired leases back to queued.
pub async fn reap_expired(pool: &DbPool) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE noetl.queue
        SET status = 'queued', worker_id = NULL, lease_until = NULL
        WHERE status = 'leased' AND lease_until IS NOT NULL AND lease_until < now()
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Count entries with a given status.
pub async fn count_by_status(pool: &DbPool, status: &str) -> AppResult<i64> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM noetl.queue WHERE status = $1")
        .bind(status)
        .fetch_one(pool)
        .await?;

    Ok(count.0)
}

/// List queue entries, optionally filtered by status and execution.
pub async fn list(
    pool: &DbPool,
    status: Option<&str>,
    execution_id: Option<i64>,
    limit: i64,
) -> AppResult<Vec<QueueEntry>> {
    let entries = match (status, execution_id) {
        (Some(st), Some(exec)) => {
            sqlx::query_as::<_, QueueEntry>(&format!(
                r#"
                SELECT {QUEUE_COLUMNS} FROM noetl.queue
                WHERE status = $1 AND execution_id = $2
                ORDER BY priority DESC, queue_id
                LIMIT $3
                "#
            ))
            .bind(st)
            .bind(exec)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (Some(st), None) => {
            sqlx::query_as::<_, QueueEntry>(&format!(
                r#"
                SELECT {QUEUE_COLUMNS} FROM noetl.queue
                WHERE status = $1
                ORDER BY priority DESC, queue_id
                LIMIT $2
                "#
            ))
            .bind(st)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (None, Some(exec)) => {
            sqlx::query_as::<_, QueueEntry>(&format!(
                r#"
                SELECT {QUEUE_COLUMNS} FROM noetl.queue
                WHERE execution_id = $1
                ORDER BY priority DESC, queue_id
                LIMIT $2
                "#
            ))
            .bind(exec)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (None, None) => {
            sqlx::query_as::<_, QueueEntry>(&format!(
                r#"
                SELECT {QUEUE_COLUMNS} FROM noetl.queue
                ORDER BY priority DESC, queue_id
                LIMIT $1
                "#
            ))
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(entries)
}
