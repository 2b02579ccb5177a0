//! Credential API handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::db::models::{CredentialCreateRequest, CredentialListResponse, CredentialResponse};
use crate::error::AppResult;
use crate::services::CredentialService;

/// Query parameters for credential lookups.
#[derive(Debug, Deserialize, Default)]
pub struct CredentialQuery {
    /// Include decrypted data in the response.
    #[serde(default)]
    pub include_data: bool,

    /// Filter listings by credential type.
    #[serde(rename = "type")]
    pub credential_type: Option<String>,
}

/// Create or update a credential.
///
/// `POST /api/credentials`
pub async fn create_or_update(
    State(service): State<CredentialService>,
    Json(request): Json<CredentialCreateRequest>,
) -> AppResult<Json<CredentialResponse>> {
    let response = service.create_or_update(request).await?;
    Ok(Json(response))
}

/// List credentials (metadata only).
///
/// `GET /api/credentials`
pub async fn list(
    State(service): State<CredentialService>,
    Query(query): Query<CredentialQuery>,
) -> AppResult<Json<CredentialListResponse>> {
    let response = service.list(query.credential_type.as_deref()).await?;
    Ok(Json(response))
}

/// Resolve a stored credential by id or name.
///
/// `GET /api/credentials/{identifier}?include_data=true`
pub async fn get(
    State(service): State<CredentialService>,
    Path(identifier): Path<String>,
    Query(query): Query<CredentialQuery>,
) -> AppResult<Json<CredentialResponse>> {
    let response = service.get(&identifier, query.include_data).await?;
    Ok(Json(response))
}

/// Delete a credential.
///
/// `DELETE /api/credentials/{identifier}`
pub async fn delete(
    State(service): State<CredentialService>,
    Path(identifier): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let id = service.delete(&identifier).await?;
    Ok(Json(json!({"status": "deleted", "id": id})))
}
