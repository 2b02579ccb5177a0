//! Database schema management.
//!
//! All tables live in the `noetl` schema. The event table is range
//! partitioned on `execution_id`; because execution IDs are Snowflake
//! (time-prefix bits), partitions correspond to time ranges and old
//! partitions can be detached without rewriting. A DEFAULT partition keeps
//! inserts working before any explicit partitions are carved out.

use crate::db::DbPool;
use crate::error::AppResult;

/// DDL statements, in dependency order. Every statement is idempotent.
const DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS noetl",
    r#"
    CREATE TABLE IF NOT EXISTS noetl.catalog (
        id          BIGINT PRIMARY KEY,
        path        TEXT NOT NULL,
        kind        TEXT NOT NULL,
        version     INT NOT NULL,
        content     TEXT NOT NULL,
        payload     JSONB,
        meta        JSONB,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (path, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS noetl.workload (
        execution_id BIGINT PRIMARY KEY,
        data         JSONB NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS noetl.event (
        execution_id        BIGINT NOT NULL,
        event_id            BIGINT NOT NULL,
        catalog_id          BIGINT NOT NULL,
        parent_event_id     BIGINT,
        parent_execution_id BIGINT,
        event_type          TEXT NOT NULL,
        node_id             TEXT,
        node_name           TEXT,
        node_type           TEXT,
        status              TEXT NOT NULL,
        result              JSONB,
        error               TEXT,
        context             JSONB,
        meta                JSONB,
        current_index       INT,
        current_item        JSONB,
        loop_id             TEXT,
        loop_name           TEXT,
        worker_id           TEXT,
        duration            DOUBLE PRECISION,
        created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (execution_id, event_id)
    ) PARTITION BY RANGE (execution_id)
    "#,
    "CREATE TABLE IF NOT EXISTS noetl.event_default PARTITION OF noetl.event DEFAULT",
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_execution_event
        ON noetl.event (execution_id, event_id DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_execution_type
        ON noetl.event (execution_id, event_type, event_id DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_execution_start
        ON noetl.event (event_id) WHERE event_type = 'execution_start'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS noetl.queue (
        queue_id        BIGSERIAL PRIMARY KEY,
        execution_id    BIGINT NOT NULL,
        catalog_id      BIGINT NOT NULL,
        node_id         TEXT NOT NULL,
        action          JSONB NOT NULL,
        context         JSONB,
        priority        INT NOT NULL DEFAULT 5,
        status          TEXT NOT NULL DEFAULT 'queued',
        attempts        INT NOT NULL DEFAULT 0,
        max_attempts    INT NOT NULL DEFAULT 3,
        available_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        worker_id       TEXT,
        lease_until     TIMESTAMPTZ,
        last_heartbeat  TIMESTAMPTZ,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (execution_id, node_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_queue_ready
        ON noetl.queue (priority DESC, queue_id)
        WHERE status IN ('queued', 'retry')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS noetl.keychain (
        id              BIGSERIAL PRIMARY KEY,
        cache_key       TEXT NOT NULL UNIQUE,
        catalog_id      BIGINT NOT NULL,
        keychain_name   TEXT NOT NULL,
        credential_type TEXT NOT NULL DEFAULT 'unknown',
        cache_type      TEXT NOT NULL DEFAULT 'token',
        scope_type      TEXT NOT NULL DEFAULT 'global',
        execution_id    BIGINT,
        data            BYTEA NOT NULL,
        expires_at      TIMESTAMPTZ,
        auto_renew      BOOLEAN NOT NULL DEFAULT FALSE,
        renew_config    JSONB,
        access_count    INT NOT NULL DEFAULT 0,
        accessed_at     TIMESTAMPTZ,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS noetl.credential (
        id          BIGINT PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        type        TEXT NOT NULL,
        data        BYTEA NOT NULL,
        meta        JSONB,
        tags        TEXT[],
        description TEXT,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// Create the schema, tables, and indexes if they do not exist.
pub async fn ensure_schema(pool: &DbPool) -> AppResult<()> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!("Database schema ensured");
    Ok(())
}

/// Check that the required tables exist.
pub async fn validate_schema(pool: &DbPool) -> AppResult<Vec<String>> {
    let required = ["catalog", "workload", "event", "queue", "keychain", "credential"];

    let existing: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables WHERE table_schema = 'noetl'",
    )
    .fetch_all(pool)
    .await?;

    let missing: Vec<String> = required
        .iter()
        .filter(|t| !existing.contains(&t.to_string()))
        .map(|s| s.to_string())
        .collect();

    Ok(missing)
}
