//! Credential database queries.

use crate::db::models::CredentialEntry;
use crate::db::DbPool;
use crate::error::AppResult;

const CREDENTIAL_COLUMNS: &str = r#"
    id, name, type, data, meta, tags, description, created_at, updated_at
"#;

/// Insert a new credential.
#[allow(clippy::too_many_arguments)]
pub async fn insert_credential(
    pool: &DbPool,
    id: i64,
    name: &str,
    credential_type: &str,
    data: &[u8],
    meta: Option<&serde_json::Value>,
    tags: Option<&[String]>,
    description: Option<&str>,
) -> AppResult<i64> {
    let result: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO noetl.credential (id, name, type, data, meta, tags, description)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(credential_type)
    .bind(data)
    .bind(meta)
    .bind(tags)
    .bind(description)
    .fetch_one(pool)
    .await?;

    Ok(result.0)
}

/// Update an existing credential.
pub async fn update_credential(
    pool: &DbPool,
    id: i64,
    credential_type: &str,
    data: &[u8],
    meta: Option<&serde_json::Value>,
    tags: Option<&[String]>,
    description: Option<&str>,
) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE noetl.credential
        SET type = $2, data = $3, meta = $4, tags = $5, description = $6, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(credential_type)
    .bind(data)
    .bind(meta)
    .bind(tags)
    .bind(description)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a credential by ID.
pub async fn get_credential_by_id(pool: &DbPool, id: i64) -> AppResult<Option<CredentialEntry>> {
    let entry = sqlx::query_as::<_, CredentialEntry>(&format!(
        r#"
        SELECT {CREDENTIAL_COLUMNS}
        FROM noetl.credential
        WHERE id = $1
        "#
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// Get a credential by name.
pub async fn get_credential_by_name(
    pool: &DbPool,
    name: &str,
) -> AppResult<Option<CredentialEntry>> {
    let entry = sqlx::query_as::<_, CredentialEntry>(&format!(
        r#"
        SELECT {CREDENTIAL_COLUMNS}
        FROM noetl.credential
        WHERE name = $1
        "#
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// List credentials, optionally filtered by type.
pub async fn list_credentials(
    pool: &DbPool,
    credential_type: Option<&str>,
) -> AppResult<Vec<CredentialEntry>> {
    let entries = if let Some(ct) = credential_type {
        sqlx::query_as::<_, CredentialEntry>(&format!(
            r#"
            SELECT {CREDENTIAL_COLUMNS}
            FROM noetl.credential
            WHERE type = $1
            ORDER BY name
            "#
        ))
        .bind(ct)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, CredentialEntry>(&format!(
            r#"
            SELECT {CREDENTIAL_COLUMNS}
            FROM noetl.credential
            ORDER BY name
            "#
        ))
        .fetch_all(pool)
        .await?
    };

    Ok(entries)
}

/// Delete a credential by ID.
pub async fn delete_credential_by_id(pool: &DbPool, id: i64) -> AppResult<bool> {
    let result = sqlx::query("DELETE FROM noetl.credential WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
