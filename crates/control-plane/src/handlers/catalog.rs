//! Catalog API handlers.
//!
//! Endpoints for registering and fetching playbooks and other resources.

use axum::{extract::State, Json};

use crate::db::models::{
    CatalogEntries, CatalogEntriesRequest, CatalogEntryRequest, CatalogEntryResponse,
    CatalogRegisterRequest, CatalogRegisterResponse,
};
use crate::error::AppResult;
use crate::services::CatalogService;

/// Register a new catalog resource.
///
/// `POST /api/catalog/register`
///
/// Body: `{"content": "<yaml or base64 yaml>", "resource_type": "Playbook"}`.
/// Re-registering a path produces a strictly greater version.
pub async fn register(
    State(service): State<CatalogService>,
    Json(request): Json<CatalogRegisterRequest>,
) -> AppResult<Json<CatalogRegisterResponse>> {
    let response = service.register(request).await?;
    Ok(Json(response))
}

/// List catalog resources, optionally filtered by type.
///
/// `POST /api/catalog/list`
pub async fn list(
    State(service): State<CatalogService>,
    Json(request): Json<CatalogEntriesRequest>,
) -> AppResult<Json<CatalogEntries>> {
    let entries = service.list(request.resource_type.as_deref()).await?;
    Ok(Json(entries))
}

/// Fetch one catalog resource by `catalog_id` or `(path, version|"latest")`.
///
/// `POST /api/catalog/resource`
pub async fn get_resource(
    State(service): State<CatalogService>,
    Json(request): Json<CatalogEntryRequest>,
) -> AppResult<Json<CatalogEntryResponse>> {
    let entry = service.get_resource(request).await?;
    Ok(Json(entry.into()))
}
