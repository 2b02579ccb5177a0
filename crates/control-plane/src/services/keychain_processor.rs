//! Keychain processing at execution start.
//!
//! Walks the playbook's `keychain:` block and resolves each entry into a
//! stored, TTL'd credential scoped to the catalog (and execution for local
//! scope). Entries render against `{workload, keychain}` so later entries
//! can reference earlier ones; the list order is the dependency order.
//!
//! Resolution is strict: a failed entry aborts the execution start, since
//! downstream steps would fail anyway.

use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::db::models::KeychainSetRequest;
use crate::error::{AppError, AppResult};
use crate::playbook::types::KeychainDef;
use crate::services::credential::CredentialService;
use crate::services::keychain::KeychainService;
use crate::template::TemplateRenderer;

/// Scopes requested when minting Google service-account tokens.
const GCP_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// Default TTLs by scope when the entry and token carry none.
const DEFAULT_TTL_SHARED: i64 = 86_400;
const DEFAULT_TTL_LOCAL: i64 = 3_600;

/// Keychain resolver.
#[derive(Clone)]
pub struct KeychainProcessor {
    http: reqwest::Client,
    keychain: KeychainService,
    credentials: CredentialService,
}

impl KeychainProcessor {
    /// Create a new processor. Outbound credential lookups use a 10s
    /// timeout.
    pub fn new(keychain: KeychainService, credentials: CredentialService) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            http,
            keychain,
            credentials,
        }
    }

    /// Resolve and store every keychain entry for an execution.
    pub async fn process(
        &self,
        entries: &[KeychainDef],
        catalog_id: i64,
        execution_id: i64,
        workload: &Value,
    ) -> AppResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let renderer = TemplateRenderer::new();
        let mut resolved: Map<String, Value> = Map::new();

        for entry in entries {
            info!(name = %entry.name, kind = %entry.kind, "Resolving keychain entry");

            let ctx = render_context(workload, &resolved);

            let data = match entry.kind.as_str() {
                "static" => self.resolve_static(entry, &ctx, &renderer)?,
                "bearer" => self.resolve_bearer(entry, &ctx, &renderer)?,
                "oauth2" => self.resolve_oauth2(entry, &ctx, &renderer).await?,
                "secret_manager" => self.resolve_secret_manager(entry, &ctx, &renderer).await?,
                "credential" | "credential_ref" | "google_oauth" | "google_service_account"
                | "google" => self.resolve_credential_ref(entry, &ctx, &renderer).await?,
                other => {
                    warn!(name = %entry.name, kind = %other, "Unknown keychain kind; skipping");
                    continue;
                }
            };

            self.store(entry, catalog_id, execution_id, &data).await?;
            resolved.insert(entry.name.clone(), data);
        }

        info!(
            count = resolved.len(),
            execution_id, "Keychain processing complete"
        );
        Ok(())
    }

    /// `static`: render each value in `map:` against the context.
    fn resolve_static(
        &self,
        entry: &KeychainDef,
        ctx: &HashMap<String, Value>,
        renderer: &TemplateRenderer,
    ) -> AppResult<Value> {
        let map = require_map(entry, "map")?;

        let mut data = Map::new();
        for (key, template) in map {
            data.insert(key.clone(), renderer.render_value(template, ctx)?);
        }

        Ok(Value::Object(data))
    }

    /// `bearer`: render `token:` and wrap as a bearer token.
    fn resolve_bearer(
        &self,
        entry: &KeychainDef,
        ctx: &HashMap<String, Value>,
        renderer: &TemplateRenderer,
    ) -> AppResult<Value> {
        let token = entry
            .extra
            .get("token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| keychain_error(entry, "bearer requires a 'token' field"))?;

        let rendered = renderer.render(token, ctx)?;

        Ok(serde_json::json!({
            "access_token": rendered,
            "token_type": "Bearer",
        }))
    }

    /// `oauth2`: client-credentials token request against the rendered
    /// endpoint; the response (access_token, expires_in, ...) is stored.
    async fn resolve_oauth2(
        &self,
        entry: &KeychainDef,
        ctx: &HashMap<String, Value>,
        renderer: &TemplateRenderer,
    ) -> AppResult<Value> {
        let endpoint = entry
            .extra
            .get("endpoint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| keychain_error(entry, "oauth2 requires an 'endpoint' field"))?;
        let endpoint = renderer.render(endpoint, ctx)?;

        let method = entry
            .extra
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("POST")
            .to_uppercase();

        let headers = render_string_map(entry.extra.get("headers"), ctx, renderer)?;
        let form = render_string_map(entry.extra.get("data"), ctx, renderer)?;

        info!(endpoint = %endpoint, "Issuing OAuth2 token request");

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| keychain_error(entry, "invalid HTTP method"))?;

        let mut request = self.http.request(method, &endpoint);
        for (k, v) in &headers {
            request = request.header(k, v);
        }

        let response = request
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("OAuth2 request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalService(format!(
                "OAuth2 endpoint returned {} for keychain entry '{}'",
                response.status(),
                entry.name
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::ExternalService(format!("OAuth2 response not JSON: {}", e)))
    }

    /// `secret_manager`: resolve the referenced auth credential, obtain a
    /// provider access token, and fetch each secret in `map:`.
    async fn resolve_secret_manager(
        &self,
        entry: &KeychainDef,
        ctx: &HashMap<String, Value>,
        renderer: &TemplateRenderer,
    ) -> AppResult<Value> {
        let auth_ref = entry
            .extra
            .get("auth")
            .and_then(|v| v.as_str())
            .ok_or_else(|| keychain_error(entry, "secret_manager requires an 'auth' field"))?;
        let auth_name = renderer.render(auth_ref, ctx)?;

        let map = require_map(entry, "map")?.clone();

        let credential = self.credentials.get(&auth_name, true).await?;
        let cred_data = credential
            .data
            .ok_or_else(|| keychain_error(entry, "auth credential has no data"))?;

        let access_token = match credential.credential_type.as_str() {
            "oauth2" => cred_data
                .get("access_token")
                .and_then(|v| v.as_str())
                .map(String::from),
            "google_oauth" | "google_service_account" | "gcp" => {
                Some(mint_service_account_token(&cred_data).await?)
            }
            _ => cred_data
                .get("access_token")
                .and_then(|v| v.as_str())
                .map(String::from),
        }
        .ok_or_else(|| keychain_error(entry, "no access token available from auth credential"))?;

        let mut data = Map::new();
        for (key, path_template) in &map {
            let secret_path = renderer.render(
                path_template.as_str().unwrap_or_default(),
                ctx,
            )?;

            let url = format!("https://secretmanager.googleapis.com/v1/{}:access", secret_path);
            let response = self
                .http
                .get(&url)
                .bearer_auth(&access_token)
                .send()
                .await
                .map_err(|e| {
                    AppError::ExternalService(format!("Secret access failed for '{}': {}", key, e))
                })?;

            if !response.status().is_success() {
                return Err(AppError::ExternalService(format!(
                    "Secret manager returned {} for '{}'",
                    response.status(),
                    key
                )));
            }

            let body: Value = response.json().await.map_err(|e| {
                AppError::ExternalService(format!("Secret response not JSON: {}", e))
            })?;

            let payload = body
                .get("payload")
                .and_then(|p| p.get("data"))
                .and_then(|d| d.as_str())
                .ok_or_else(|| keychain_error(entry, "empty secret payload"))?;

            let decoded = BASE64
                .decode(payload)
                .map_err(|e| keychain_error(entry, &format!("secret payload decode: {}", e)))?;
            let secret = String::from_utf8(decoded)
                .map_err(|e| keychain_error(entry, &format!("secret payload utf8: {}", e)))?;

            let value = serde_json::from_str::<Value>(&secret)
                .unwrap_or(Value::String(secret));
            data.insert(key.clone(), value);
        }

        Ok(Value::Object(data))
    }

    /// `credential` family: fetch the stored credential; Google
    /// service-account keys are exchanged for a fresh access token via the
    /// JWT-bearer grant.
    async fn resolve_credential_ref(
        &self,
        entry: &KeychainDef,
        ctx: &HashMap<String, Value>,
        renderer: &TemplateRenderer,
    ) -> AppResult<Value> {
        let reference = entry
            .extra
            .get("ref")
            .or_else(|| entry.extra.get("credential"))
            .and_then(|v| v.as_str())
            .unwrap_or(&entry.name);
        let name = renderer.render(reference, ctx)?;

        let credential = self.credentials.get(&name, true).await?;
        let data = credential.data.ok_or_else(|| {
            keychain_error(entry, &format!("credential '{}' has no data", name))
        })?;

        if matches!(
            credential.credential_type.as_str(),
            "google_oauth" | "google_service_account" | "gcp"
        ) {
            let access_token = mint_service_account_token(&data).await?;
            return Ok(serde_json::json!({
                "access_token": access_token,
                "token_type": "Bearer",
            }));
        }

        Ok(data)
    }

    /// Refresh auto-renew entries whose expiry falls inside the window.
    ///
    /// Only OAuth2 entries carry a `renew_config`; the stored request is
    /// replayed and the entry re-stored under its existing cache key.
    pub async fn renew_due(&self, within_seconds: i64) -> AppResult<u64> {
        let due = self.keychain.list_renewable(within_seconds).await?;
        let mut renewed = 0u64;

        for entry in due {
            let Some(config) = &entry.renew_config else {
                continue;
            };
            let Some(endpoint) = config.get("endpoint").and_then(|v| v.as_str()) else {
                continue;
            };

            let headers = config
                .get("headers")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            let form = config
                .get("data")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();

            let mut request = self.http.post(endpoint);
            for (k, v) in &headers {
                request = request.header(k, v.as_str().unwrap_or_default());
            }
            let form: HashMap<String, String> = form
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect();

            let token_data: Value = match request.form(&form).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json().await {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(entry = %entry.keychain_name, error = %e, "Renewal response not JSON");
                            continue;
                        }
                    }
                }
                Ok(response) => {
                    warn!(entry = %entry.keychain_name, status = %response.status(), "Renewal request rejected");
                    continue;
                }
                Err(e) => {
                    warn!(entry = %entry.keychain_name, error = %e, "Renewal request failed");
                    continue;
                }
            };

            let ttl = token_data
                .get("expires_in")
                .and_then(|v| v.as_i64())
                .unwrap_or(DEFAULT_TTL_LOCAL);

            self.keychain
                .set(
                    entry.catalog_id,
                    &entry.keychain_name,
                    KeychainSetRequest {
                        token_data,
                        credential_type: entry.credential_type.clone(),
                        cache_type: entry.cache_type.clone(),
                        scope_type: entry.scope_type.clone(),
                        execution_id: entry.execution_id,
                        expires_at: Some(Utc::now() + chrono::Duration::seconds(ttl)),
                        expires_in: None,
                        auto_renew: true,
                        renew_config: entry.renew_config.clone(),
                    },
                )
                .await?;

            renewed += 1;
        }

        Ok(renewed)
    }

    /// Store the resolved entry with scope and TTL rules.
    async fn store(
        &self,
        entry: &KeychainDef,
        catalog_id: i64,
        execution_id: i64,
        data: &Value,
    ) -> AppResult<()> {
        let scope = entry.scope.as_str();

        // TTL priority: explicit ttl_seconds, the token's own expires_in,
        // then the scope default.
        let ttl = entry
            .ttl_seconds
            .or_else(|| data.get("expires_in").and_then(|v| v.as_i64()))
            .unwrap_or(if scope == "local" {
                DEFAULT_TTL_LOCAL
            } else {
                DEFAULT_TTL_SHARED
            });

        let renew_config = if entry.auto_renew && entry.kind == "oauth2" {
            Some(serde_json::json!({
                "endpoint": entry.extra.get("endpoint"),
                "method": entry.extra.get("method").cloned().unwrap_or(Value::String("POST".into())),
                "headers": entry.extra.get("headers").cloned().unwrap_or(Value::Object(Map::new())),
                "data": entry.extra.get("data").cloned().unwrap_or(Value::Object(Map::new())),
            }))
        } else {
            None
        };

        let credential_type = match entry.kind.as_str() {
            "oauth2" => "oauth2_client_credentials".to_string(),
            other => other.to_string(),
        };
        let cache_type = if matches!(credential_type.as_str(), "oauth2_client_credentials" | "bearer")
        {
            "token"
        } else {
            "secret"
        };

        self.keychain
            .set(
                catalog_id,
                &entry.name,
                KeychainSetRequest {
                    token_data: data.clone(),
                    credential_type,
                    cache_type: cache_type.to_string(),
                    scope_type: scope.to_string(),
                    execution_id: (scope == "local").then_some(execution_id),
                    expires_at: Some(Utc::now() + chrono::Duration::seconds(ttl)),
                    expires_in: None,
                    auto_renew: entry.auto_renew,
                    renew_config,
                },
            )
            .await?;

        Ok(())
    }
}

/// Mint a Google access token from a service-account key via the standard
/// JWT-bearer grant.
async fn mint_service_account_token(credential_data: &Value) -> AppResult<String> {
    let json = serde_json::to_string(credential_data)?;

    let account = CustomServiceAccount::from_json(&json)
        .map_err(|e| AppError::ExternalService(format!("Invalid service account key: {}", e)))?;

    let token = account
        .token(GCP_SCOPES)
        .await
        .map_err(|e| AppError::ExternalService(format!("Token mint failed: {}", e)))?;

    Ok(token.as_str().to_string())
}

/// Rendering context for keychain templates.
fn render_context(workload: &Value, resolved: &Map<String, Value>) -> HashMap<String, Value> {
    let mut ctx = HashMap::new();
    ctx.insert("workload".to_string(), workload.clone());
    ctx.insert("keychain".to_string(), Value::Object(resolved.clone()));
    ctx
}

/// Render each value of an optional string map.
fn render_string_map(
    block: Option<&Value>,
    ctx: &HashMap<String, Value>,
    renderer: &TemplateRenderer,
) -> AppResult<HashMap<String, String>> {
    let mut out = HashMap::new();
    if let Some(Value::Object(map)) = block {
        for (k, v) in map {
            let raw = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.insert(k.clone(), renderer.render(&raw, ctx)?);
        }
    }
    Ok(out)
}

fn require_map<'a>(
    entry: &'a KeychainDef,
    field: &str,
) -> AppResult<&'a Map<String, Value>> {
    entry
        .extra
        .get(field)
        .and_then(|v| v.as_object())
        .ok_or_else(|| keychain_error(entry, &format!("{} requires a '{}' mapping", entry.kind, field)))
}

fn keychain_error(entry: &KeychainDef, message: &str) -> AppError {
    AppError::Validation(format!("Keychain entry '{}': {}", entry.name, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new()
    }

    fn def(yaml: &str) -> KeychainDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_render_context_exposes_prior_entries() {
        let workload = serde_json::json!({"project": "demo"});
        let mut resolved = Map::new();
        resolved.insert(
            "svc".to_string(),
            serde_json::json!({"token_uri": "https://oauth2.example/token"}),
        );

        let ctx = render_context(&workload, &resolved);
        let rendered = renderer()
            .render("{{ keychain.svc.token_uri }}", &ctx)
            .unwrap();
        assert_eq!(rendered, "https://oauth2.example/token");
    }

    #[test]
    fn test_render_string_map() {
        let block = serde_json::json!({
            "client_id": "{{ workload.client }}",
            "grant_type": "client_credentials"
        });
        let mut ctx = HashMap::new();
        ctx.insert("workload".to_string(), serde_json::json!({"client": "abc"}));

        let rendered = render_string_map(Some(&block), &ctx, &renderer()).unwrap();
        assert_eq!(rendered["client_id"], "abc");
        assert_eq!(rendered["grant_type"], "client_credentials");
    }

    #[test]
    fn test_require_map_missing() {
        let entry = def("name: s\nkind: static\n");
        assert!(require_map(&entry, "map").is_err());
    }

    #[test]
    fn test_ttl_fallback_order() {
        // explicit ttl_seconds wins
        let entry = def("name: t\nkind: bearer\ntoken: x\nttl_seconds: 120\n");
        let data = serde_json::json!({"expires_in": 300});
        let ttl = entry
            .ttl_seconds
            .or_else(|| data.get("expires_in").and_then(|v| v.as_i64()))
            .unwrap_or(DEFAULT_TTL_SHARED);
        assert_eq!(ttl, 120);

        // token expires_in next
        let entry = def("name: t\nkind: bearer\ntoken: x\n");
        let ttl = entry
            .ttl_seconds
            .or_else(|| data.get("expires_in").and_then(|v| v.as_i64()))
            .unwrap_or(DEFAULT_TTL_SHARED);
        assert_eq!(ttl, 300);
    }
}
