//! Keychain database model.
//!
//! The keychain caches resolved tokens and secrets per playbook, with scope
//! support: `global` (bucket default TTL), `catalog` (across executions of
//! one playbook), `shared` (cross-playbook), `local` (bound to one
//! execution).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Keychain entry for cached tokens/credentials.
#[derive(Debug, Clone, FromRow)]
pub struct KeychainEntry {
    /// Unique keychain entry ID
    pub id: i64,

    /// Cache key (scope-dependent, see `build_cache_key`)
    pub cache_key: String,

    /// Catalog ID
    pub catalog_id: i64,

    /// Keychain entry name
    pub keychain_name: String,

    /// Source credential type (bearer, oauth2_client_credentials, ...)
    pub credential_type: String,

    /// Cache class: token or secret
    pub cache_type: String,

    /// Scope type (global, catalog, shared, local)
    pub scope_type: String,

    /// Execution ID (local scope)
    #[sqlx(default)]
    pub execution_id: Option<i64>,

    /// Encrypted token/credential data
    pub data: Vec<u8>,

    /// Entry expiry time
    #[sqlx(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Auto-renewal enabled
    #[sqlx(default)]
    pub auto_renew: bool,

    /// Renewal configuration (JSON)
    #[sqlx(default)]
    pub renew_config: Option<serde_json::Value>,

    /// Access count
    #[sqlx(default)]
    pub access_count: i32,

    /// Last accessed timestamp
    #[sqlx(default)]
    pub accessed_at: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Request to store a keychain entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainSetRequest {
    /// Token/credential data
    pub token_data: serde_json::Value,

    /// Source credential type
    #[serde(default = "default_credential_type")]
    pub credential_type: String,

    /// Cache class: token or secret
    #[serde(default = "default_cache_type")]
    pub cache_type: String,

    /// Scope type (global, catalog, shared, local)
    #[serde(default = "default_scope")]
    pub scope_type: String,

    /// Execution ID (required for local scope)
    #[serde(default)]
    pub execution_id: Option<i64>,

    /// Entry expiry time
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Expiry in seconds from now (alternative to expires_at)
    #[serde(default)]
    pub expires_in: Option<i64>,

    /// Enable auto-renewal
    #[serde(default)]
    pub auto_renew: bool,

    /// Renewal configuration
    #[serde(default)]
    pub renew_config: Option<serde_json::Value>,
}

fn default_scope() -> String {
    "global".to_string()
}

fn default_credential_type() -> String {
    "unknown".to_string()
}

fn default_cache_type() -> String {
    "token".to_string()
}

/// Response after storing a keychain entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainSetResponse {
    /// Operation status
    pub status: String,

    /// Cache key
    pub cache_key: String,

    /// Expiry time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Response when fetching a keychain entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainGetResponse {
    /// Operation status (found, expired, not_found)
    pub status: String,

    /// Token/credential data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Expiry time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Auto-renewal enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_renew: Option<bool>,
}

/// Summary of a keychain entry for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainEntrySummary {
    /// Keychain entry name
    pub keychain_name: String,

    /// Scope type
    pub scope_type: String,

    /// Execution ID (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,

    /// Expiry time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Whether expired
    pub expired: bool,

    /// Access count
    pub access_count: i32,

    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Keychain listing for a catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainListResponse {
    /// Catalog ID
    pub catalog_id: String,

    /// Entries
    pub entries: Vec<KeychainEntrySummary>,
}
