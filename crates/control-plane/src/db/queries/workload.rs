//! Workload database queries.
//!
//! One row per execution holding the merged `workload:` block plus caller
//! overrides. Written once by the execution initializer, read-only after.

use crate::db::DbPool;
use crate::error::AppResult;

/// Insert the workload row for an execution.
pub async fn insert_workload(
    pool: &DbPool,
    execution_id: i64,
    data: &serde_json::Value,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.workload (execution_id, data)
        VALUES ($1, $2)
        ON CONFLICT (execution_id) DO NOTHING
        "#,
    )
    .bind(execution_id)
    .bind(data)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get the workload for an execution.
pub async fn get_workload(
    pool: &DbPool,
    execution_id: i64,
) -> AppResult<Option<serde_json::Value>> {
    let row: Option<(serde_json::Value,)> =
        sqlx::query_as("SELECT data FROM noetl.workload WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(data,)| data))
}
