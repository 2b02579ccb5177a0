//! Keychain database queries.

use crate::db::models::KeychainEntry;
use crate::db::DbPool;
use crate::error::AppResult;
use chrono::{DateTime, Utc};

const KEYCHAIN_COLUMNS: &str = r#"
    id, cache_key, catalog_id, keychain_name, credential_type, cache_type,
    scope_type, execution_id, data, expires_at, auto_renew, renew_config,
    access_count, accessed_at, created_at, updated_at
"#;

/// Build the cache key for a keychain entry.
///
/// `local` entries are bound to one execution; `catalog` entries persist
/// across executions of one playbook; `shared` entries are keyed on name
/// alone; everything else is `global` per catalog.
pub fn build_cache_key(
    keychain_name: &str,
    catalog_id: i64,
    scope_type: &str,
    execution_id: Option<i64>,
) -> String {
    match scope_type {
        "local" => match execution_id {
            Some(exec_id) => format!("{}:{}:{}", keychain_name, catalog_id, exec_id),
            None => format!("{}:{}:local", keychain_name, catalog_id),
        },
        "shared" => format!("{}:shared", keychain_name),
        "catalog" => format!("{}:{}:catalog", keychain_name, catalog_id),
        _ => format!("{}:{}:global", keychain_name, catalog_id),
    }
}

/// Insert or update a keychain entry.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_keychain_entry(
    pool: &DbPool,
    cache_key: &str,
    catalog_id: i64,
    keychain_name: &str,
    credential_type: &str,
    cache_type: &str,
    scope_type: &str,
    execution_id: Option<i64>,
    data: &[u8],
    expires_at: Option<DateTime<Utc>>,
    auto_renew: bool,
    renew_config: Option<&serde_json::Value>,
) -> AppResult<i64> {
    let result: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO noetl.keychain (
            cache_key, catalog_id, keychain_name, credential_type, cache_type,
            scope_type, execution_id, data, expires_at, auto_renew, renew_config
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (cache_key) DO UPDATE SET
            data = EXCLUDED.data,
            credential_type = EXCLUDED.credential_type,
            cache_type = EXCLUDED.cache_type,
            expires_at = EXCLUDED.expires_at,
            auto_renew = EXCLUDED.auto_renew,
            renew_config = EXCLUDED.renew_config,
            updated_at = now()
        RETURNING id
        "#,
    )
    .bind(cache_key)
    .bind(catalog_id)
    .bind(keychain_name)
    .bind(credential_type)
    .bind(cache_type)
    .bind(scope_type)
    .bind(execution_id)
    .bind(data)
    .bind(expires_at)
    .bind(auto_renew)
    .bind(renew_config)
    .fetch_one(pool)
    .await?;

    Ok(result.0)
}

/// Get a keychain entry by cache key.
pub async fn get_keychain_by_cache_key(
    pool: &DbPool,
    cache_key: &str,
) -> AppResult<Option<KeychainEntry>> {
    let entry = sqlx::query_as::<_, KeychainEntry>(&format!(
        r#"
        SELECT {KEYCHAIN_COLUMNS}
        FROM noetl.keychain
        WHERE cache_key = $1
        "#
    ))
    .bind(cache_key)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// Increment access count and update accessed_at.
pub async fn increment_access_count(pool: &DbPool, id: i64) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE noetl.keychain
        SET access_count = access_count + 1, accessed_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// List all keychain entries for a catalog.
pub async fn list_keychain_by_catalog(
    pool: &DbPool,
    catalog_id: i64,
) -> AppResult<Vec<KeychainEntry>> {
    let entries = sqlx::query_as::<_, KeychainEntry>(&format!(
        r#"
        SELECT {KEYCHAIN_COLUMNS}
        FROM noetl.keychain
        WHERE catalog_id = $1
        ORDER BY created_at DESC
        "#
    ))
    .bind(catalog_id)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

/// Delete all expired entries that are not auto-renewed.
pub async fn delete_expired_entries(pool: &DbPool) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM noetl.keychain
        WHERE expires_at IS NOT NULL AND expires_at < now() AND auto_renew = false
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Delete all keychain entries bound to an execution.
pub async fn delete_keychain_by_execution(pool: &DbPool, execution_id: i64) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM noetl.keychain
        WHERE execution_id = $1
        "#,
    )
    .bind(execution_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Auto-renewable entries expiring within the window.
pub async fn list_renewable_entries(
    pool: &DbPool,
    within_seconds: i64,
) -> AppResult<Vec<KeychainEntry>> {
    let entries = sqlx::query_as::<_, KeychainEntry>(&format!(
        r#"
        SELECT {KEYCHAIN_COLUMNS}
        FROM noetl.keychain
        WHERE auto_renew = true
          AND renew_config IS NOT NULL
          AND expires_at IS NOT NULL
          AND expires_at < now() + ($1 || ' seconds')::interval
        "#
    ))
    .bind(within_seconds.to_string())
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_scopes() {
        assert_eq!(build_cache_key("tok", 7, "global", None), "tok:7:global");
        assert_eq!(build_cache_key("tok", 7, "catalog", None), "tok:7:catalog");
        assert_eq!(build_cache_key("tok", 7, "shared", None), "tok:shared");
        assert_eq!(build_cache_key("tok", 7, "local", Some(42)), "tok:7:42");
        assert_eq!(build_cache_key("tok", 7, "local", None), "tok:7:local");
    }
}
