//! Keychain API handlers.
//!
//! Workers resolve per-execution credentials here; the set endpoint is
//! internal (used by the keychain processor and renewal sweep).

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::db::models::{
    KeychainGetResponse, KeychainListResponse, KeychainSetRequest, KeychainSetResponse,
};
use crate::error::AppResult;
use crate::services::KeychainService;

/// Query parameters for keychain lookups.
#[derive(Debug, Deserialize, Default)]
pub struct KeychainQuery {
    /// Execution ID for local scope
    pub execution_id: Option<i64>,

    /// Scope type: global, catalog, shared, local
    #[serde(default = "default_scope")]
    pub scope_type: String,
}

fn default_scope() -> String {
    "global".to_string()
}

/// Resolve a keychain entry.
///
/// `GET /api/keychain/{catalog_id}/{keychain_name}`
pub async fn get(
    State(service): State<KeychainService>,
    Path((catalog_id, keychain_name)): Path<(i64, String)>,
    Query(query): Query<KeychainQuery>,
) -> AppResult<Json<KeychainGetResponse>> {
    let response = service
        .get(
            catalog_id,
            &keychain_name,
            query.execution_id,
            &query.scope_type,
        )
        .await?;
    Ok(Json(response))
}

/// Store a keychain entry (internal).
///
/// `POST /api/keychain/{catalog_id}/{keychain_name}`
pub async fn set(
    State(service): State<KeychainService>,
    Path((catalog_id, keychain_name)): Path<(i64, String)>,
    Json(request): Json<KeychainSetRequest>,
) -> AppResult<Json<KeychainSetResponse>> {
    let response = service.set(catalog_id, &keychain_name, request).await?;
    Ok(Json(response))
}

/// List keychain entries for a catalog.
///
/// `GET /api/keychain/catalog/{catalog_id}`
pub async fn list_by_catalog(
    State(service): State<KeychainService>,
    Path(catalog_id): Path<i64>,
) -> AppResult<Json<KeychainListResponse>> {
    let response = service.list_by_catalog(catalog_id).await?;
    Ok(Json(response))
}
