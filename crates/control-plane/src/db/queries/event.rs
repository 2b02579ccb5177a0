//! Event log database queries.
//!
//! The event table is append-only; every helper here either inserts or
//! reads. Ordering is by `event_id` (Snowflake, monotonic within an
//! execution).

use crate::db::models::Event;
use crate::db::DbPool;
use crate::error::AppResult;

const EVENT_COLUMNS: &str = r#"
    execution_id, event_id, catalog_id, parent_event_id, parent_execution_id,
    event_type, node_id, node_name, node_type, status, result, error,
    context, meta, current_index, current_item, loop_id, loop_name,
    worker_id, duration, created_at
"#;

/// Insert a new event. Returns the event_id.
#[allow(clippy::too_many_arguments)]
pub async fn insert_event(pool: &DbPool, event: &Event) -> AppResult<i64> {
    sqlx::query(
        r#"
        INSERT INTO noetl.event (
            execution_id, event_id, catalog_id, parent_event_id, parent_execution_id,
            event_type, node_id, node_name, node_type, status, result, error,
            context, meta, current_index, current_item, loop_id, loop_name,
            worker_id, duration, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21)
        "#,
    )
    .bind(event.execution_id)
    .bind(event.event_id)
    .bind(event.catalog_id)
    .bind(event.parent_event_id)
    .bind(event.parent_execution_id)
    .bind(&event.event_type)
    .bind(&event.node_id)
    .bind(&event.node_name)
    .bind(&event.node_type)
    .bind(&event.status)
    .bind(&event.result)
    .bind(&event.error)
    .bind(&event.context)
    .bind(&event.meta)
    .bind(event.current_index)
    .bind(&event.current_item)
    .bind(&event.loop_id)
    .bind(&event.loop_name)
    .bind(&event.worker_id)
    .bind(event.duration)
    .bind(event.created_at)
    .execute(pool)
    .await?;

    Ok(event.event_id)
}

/// Get all events for an execution, ordered by event_id.
pub async fn get_events_by_execution(
    pool: &DbPool,
    execution_id: i64,
    event_type: Option<&str>,
    limit: Option<i64>,
) -> AppResult<Vec<Event>> {
    let events = if let Some(et) = event_type {
        sqlx::query_as::<_, Event>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM noetl.event
            WHERE execution_id = $1 AND event_type = $2
            ORDER BY event_id ASC
            LIMIT $3
            "#
        ))
        .bind(execution_id)
        .bind(et)
        .bind(limit.unwrap_or(10000))
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, Event>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM noetl.event
            WHERE execution_id = $1
            ORDER BY event_id ASC
            LIMIT $2
            "#
        ))
        .bind(execution_id)
        .bind(limit.unwrap_or(10000))
        .fetch_all(pool)
        .await?
    };

    Ok(events)
}

/// Get the latest event of a type for a node within an execution.
pub async fn get_latest_event(
    pool: &DbPool,
    execution_id: i64,
    node_name: Option<&str>,
    event_type: &str,
) -> AppResult<Option<Event>> {
    let event = if let Some(node) = node_name {
        sqlx::query_as::<_, Event>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM noetl.event
            WHERE execution_id = $1 AND node_name = $2 AND event_type = $3
            ORDER BY event_id DESC
            LIMIT 1
            "#
        ))
        .bind(execution_id)
        .bind(node)
        .bind(event_type)
        .fetch_optional(pool)
        .await?
    } else {
        sqlx::query_as::<_, Event>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM noetl.event
            WHERE execution_id = $1 AND event_type = $2
            ORDER BY event_id DESC
            LIMIT 1
            "#
        ))
        .bind(execution_id)
        .bind(event_type)
        .fetch_optional(pool)
        .await?
    };

    Ok(event)
}

/// Check whether a node already has an event of a type.
pub async fn has_node_event(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
    event_type: &str,
) -> AppResult<bool> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        SELECT 1
        FROM noetl.event
        WHERE execution_id = $1 AND node_name = $2 AND event_type = $3
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .bind(node_name)
    .bind(event_type)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// Project the most recent non-empty result per node.
///
/// Scans `action_completed`/`result` events with a completed status and
/// returns one `(node_name, result)` pair per node.
pub async fn get_all_node_results(
    pool: &DbPool,
    execution_id: i64,
) -> AppResult<Vec<(String, serde_json::Value)>> {
    let rows: Vec<(Option<String>, Option<serde_json::Value>)> = sqlx::query_as(
        r#"
        SELECT DISTINCT ON (node_name) node_name, result
        FROM noetl.event
        WHERE execution_id = $1
          AND event_type IN ('action_completed', 'result', 'step_result')
          AND upper(status) IN ('COMPLETED', 'SUCCESS')
          AND result IS NOT NULL
          AND result::text <> '{}'
        ORDER BY node_name, event_id DESC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(name, result)| name.zip(result))
        .collect())
}

/// Catalog ID from the execution's first event.
pub async fn get_catalog_id(pool: &DbPool, execution_id: i64) -> AppResult<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT catalog_id FROM noetl.event
        WHERE execution_id = $1
        ORDER BY event_id ASC
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id,)| id))
}

/// Whether the execution has reached a terminal event.
pub async fn is_execution_terminal(pool: &DbPool, execution_id: i64) -> AppResult<bool> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        SELECT 1
        FROM noetl.event
        WHERE execution_id = $1
          AND event_type IN ('execution_complete', 'execution_failed')
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// Per-iteration results for a loop step, one row per index, in index
/// order. The latest result wins when an iteration reported twice.
pub async fn get_iteration_results(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
) -> AppResult<Vec<(Option<i32>, serde_json::Value)>> {
    let rows: Vec<(Option<i32>, Option<serde_json::Value>)> = sqlx::query_as(
        r#"
        SELECT DISTINCT ON (current_index) current_index, result
        FROM noetl.event
        WHERE execution_id = $1
          AND node_name = $2
          AND event_type IN ('result', 'action_completed')
          AND node_id LIKE '%-iter-%'
          AND upper(status) IN ('COMPLETED', 'SUCCESS')
          AND result IS NOT NULL
          AND result::text <> '{}'
        ORDER BY current_index ASC NULLS LAST, event_id DESC
        "#,
    )
    .bind(execution_id)
    .bind(node_name)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(idx, result)| result.map(|r| (idx, r)))
        .collect())
}

/// Count per-iteration results recorded for a loop step.
pub async fn count_iteration_results(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
) -> AppResult<i64> {
    let count: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(DISTINCT current_index)
        FROM noetl.event
        WHERE execution_id = $1
          AND node_name = $2
          AND event_type IN ('result', 'action_completed')
          AND node_id LIKE '%-iter-%'
          AND upper(status) IN ('COMPLETED', 'SUCCESS')
          AND result IS NOT NULL
          AND result::text <> '{}'
        "#,
    )
    .bind(execution_id)
    .bind(node_name)
    .fetch_one(pool)
    .await?;

    Ok(count.0)
}

/// Loop iteration events for a step, in index order.
pub async fn get_loop_iterations(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
) -> AppResult<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(&format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM noetl.event
        WHERE execution_id = $1 AND node_name = $2 AND event_type = 'loop_iteration'
        ORDER BY current_index ASC
        "#
    ))
    .bind(execution_id)
    .bind(node_name)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

/// Whether the loop aggregate has already been emitted for a step.
pub async fn has_loop_aggregate(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
) -> AppResult<bool> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        SELECT 1
        FROM noetl.event
        WHERE execution_id = $1
          AND node_name = $2
          AND event_type = 'action_completed'
          AND COALESCE((context->>'loop_completed')::boolean, false)
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .bind(node_name)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// Find the loop_iteration event for a given child execution.
pub async fn find_iteration_for_child(
    pool: &DbPool,
    parent_execution_id: i64,
    parent_step: &str,
    child_execution_id: i64,
) -> AppResult<Option<Event>> {
    let event = sqlx::query_as::<_, Event>(&format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM noetl.event
        WHERE execution_id = $1
          AND node_name = $2
          AND event_type = 'loop_iteration'
          AND context->>'child_execution_id' = $3
        ORDER BY event_id DESC
        LIMIT 1
        "#
    ))
    .bind(parent_execution_id)
    .bind(parent_step)
    .bind(child_execution_id.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(event)
}

/// The last meaningful `action_completed` result for an execution, used as
/// the child-result fallback when no `execution_complete` exists yet.
pub async fn get_last_meaningful_result(
    pool: &DbPool,
    execution_id: i64,
    node_name: Option<&str>,
) -> AppResult<Option<serde_json::Value>> {
    let row: Option<(Option<serde_json::Value>,)> = if let Some(node) = node_name {
        sqlx::query_as(
            r#"
            SELECT result FROM noetl.event
            WHERE execution_id = $1
              AND node_name = $2
              AND event_type = 'action_completed'
              AND upper(status) IN ('COMPLETED', 'SUCCESS')
              AND result IS NOT NULL
              AND result::text <> '{}'
            ORDER BY event_id DESC
            LIMIT 1
            "#,
        )
        .bind(execution_id)
        .bind(node)
        .fetch_optional(pool)
        .await?
    } else {
        sqlx::query_as(
            r#"
            SELECT result FROM noetl.event
            WHERE execution_id = $1
              AND event_type = 'action_completed'
              AND upper(status) IN ('COMPLETED', 'SUCCESS')
              AND result IS NOT NULL
              AND result::text <> '{}'
            ORDER BY event_id DESC
            LIMIT 1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(pool)
        .await?
    };

    Ok(row.and_then(|(r,)| r))
}
