//! Catalog service for managing playbooks and resources.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::db::models::{
    CatalogEntries, CatalogEntry, CatalogEntryRequest, CatalogEntryResponse,
    CatalogRegisterRequest, CatalogRegisterResponse,
};
use crate::db::queries::catalog as queries;
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::playbook::parser::{ensure_terminal_step, extract_kind_and_path, parse_playbook};
use crate::snowflake::SnowflakeGenerator;

/// Service for catalog operations.
#[derive(Clone)]
pub struct CatalogService {
    pool: DbPool,
    ids: SnowflakeGenerator,
}

impl CatalogService {
    /// Create a new catalog service.
    pub fn new(pool: DbPool, ids: SnowflakeGenerator) -> Self {
        Self { pool, ids }
    }

    /// Register a new resource in the catalog.
    ///
    /// The raw YAML is stored byte-exact; for playbooks the parsed payload
    /// carries the implicit terminal step when the author omitted one.
    /// Re-registering a path inserts a new row with the next version.
    pub async fn register(
        &self,
        request: CatalogRegisterRequest,
    ) -> AppResult<CatalogRegisterResponse> {
        let content = decode_content(&request.content);

        let (kind, path) = extract_kind_and_path(&content)?;
        let kind = kind.unwrap_or(request.resource_type);

        // Playbooks get full validation (start step, unique names, known
        // transition targets, acyclic graph) at register time.
        let payload = if kind == "Playbook" {
            let playbook = ensure_terminal_step(parse_playbook(&content)?);
            Some(serde_json::to_value(&playbook)?)
        } else {
            serde_yaml::from_str::<serde_json::Value>(&content).ok()
        };

        let meta = payload
            .as_ref()
            .and_then(|p| p.get("metadata"))
            .and_then(|m| m.get("labels"))
            .cloned();

        let version = queries::get_next_version(&self.pool, &path).await?;
        let catalog_id = self.ids.next_id();

        queries::insert_catalog_entry(
            &self.pool,
            catalog_id,
            &path,
            &kind,
            version,
            &content,
            payload.as_ref(),
            meta.as_ref(),
        )
        .await?;

        tracing::info!(path = %path, version, catalog_id, kind = %kind, "Resource registered");

        Ok(CatalogRegisterResponse {
            status: "success".to_string(),
            message: format!("Resource '{}' version '{}' registered.", path, version),
            path,
            version,
            catalog_id: catalog_id.to_string(),
            kind,
        })
    }

    /// List catalog entries.
    pub async fn list(&self, resource_type: Option<&str>) -> AppResult<CatalogEntries> {
        let entries = queries::list_catalog_entries(&self.pool, resource_type).await?;

        let responses: Vec<CatalogEntryResponse> = entries.into_iter().map(|e| e.into()).collect();

        Ok(CatalogEntries { entries: responses })
    }

    /// Fetch a specific catalog resource by id, or by path and version
    /// (`"latest"` resolves to the highest version).
    pub async fn get_resource(&self, request: CatalogEntryRequest) -> AppResult<CatalogEntry> {
        if let Some(catalog_id) = &request.catalog_id {
            let id: i64 = catalog_id
                .parse()
                .map_err(|_| AppError::Validation("Invalid catalog_id".to_string()))?;

            return queries::get_catalog_by_id(&self.pool, id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Catalog entry '{}' not found", catalog_id))
                });
        }

        if let Some(path) = &request.path {
            if let Some(version_str) = &request.version {
                if version_str != "latest" {
                    let version: i32 = version_str
                        .parse()
                        .map_err(|_| AppError::Validation("Invalid version number".to_string()))?;

                    return queries::get_catalog_by_path_version(&self.pool, path, version)
                        .await?
                        .ok_or_else(|| {
                            AppError::NotFound(format!(
                                "Catalog entry '{}' version {} not found",
                                path, version
                            ))
                        });
                }
            }

            return queries::get_catalog_latest(&self.pool, path)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Catalog entry '{}' not found", path)));
        }

        Err(AppError::Validation(
            "Either 'catalog_id' or 'path' must be provided".to_string(),
        ))
    }
}

/// Decode content that may be base64 encoded.
fn decode_content(content: &str) -> String {
    if let Ok(decoded) = BASE64.decode(content.trim()) {
        if let Ok(s) = String::from_utf8(decoded) {
            // Registered documents are YAML; a decode that yields binary
            // noise means the input was plain text that happened to be
            // valid base64.
            if s.contains('\n') || s.contains(':') {
                return s;
            }
        }
    }

    content.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_content_passthrough() {
        let yaml = "apiVersion: noetl.io/v1\nkind: Playbook\n";
        assert_eq!(decode_content(yaml), yaml);
    }

    #[test]
    fn test_decode_base64_content() {
        let yaml = "apiVersion: noetl.io/v1\nkind: Playbook\n";
        let encoded = BASE64.encode(yaml);
        assert_eq!(decode_content(&encoded), yaml);
    }
}
