pub mod sign;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::app::App;
use crate::auth::Identity;
use crate::proxy::GatewayError;
use crate::proxy::resolve::SUPPORTED_SERVICES;
use crate::secrets::{API_KEY_SUFFIX, BASE_URL_SUFFIX, SecretCatalog};
use crate::telemetry::sanitize;

static X_GATEWAY_API_KEY: HeaderName = HeaderName::from_static("x-gateway-api-key");
static X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
static MAGIC_USER_ID: HeaderName = HeaderName::from_static("magic-user-id");
static MAGIC_ORGANIZATION_CODE: HeaderName = HeaderName::from_static("magic-organization-code");

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
	headers
		.get(name)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default()
}

/// `POST /auth` — exchange the shared gateway secret for a bearer token.
pub async fn issue_token(
	State(app): State<Arc<App>>,
	headers: HeaderMap,
) -> Result<Json<Value>, GatewayError> {
	let presented = header_str(&headers, &X_GATEWAY_API_KEY);
	if !app.tokens.verify_gateway_key(presented) {
		return Err(GatewayError::GatewayKeyBad);
	}

	let magic_user_id = header_str(&headers, &MAGIC_USER_ID);
	let organization_code = header_str(&headers, &MAGIC_ORGANIZATION_CODE);
	let mut user_id = header_str(&headers, &X_USER_ID);
	if user_id.is_empty() {
		user_id = magic_user_id;
	}
	if user_id.is_empty() {
		user_id = "default-user";
	}

	let token = app
		.tokens
		.issue(user_id, magic_user_id, organization_code)
		.map_err(|e| GatewayError::Internal(anyhow::anyhow!("token issuance failed: {e}")))?;
	info!(
		user = %sanitize(user_id),
		org = %sanitize(organization_code),
		key_id = %app.tokens.key_id(),
		"issued gateway token"
	);

	Ok(Json(json!({
		"token": token,
		"header": "Magic-Authorization",
		"example": format!("Magic-Authorization: Bearer {token}"),
		"note": "Use the token with a Bearer prefix; the gateway adds one when it is missing",
		"security": "Tokens carry replay protection and key versioning",
	})))
}

/// Services with both a base URL and an API key configured.
pub fn services_available(catalog: &SecretCatalog) -> Vec<String> {
	SUPPORTED_SERVICES
		.iter()
		.filter(|s| {
			catalog.contains(&format!("{s}{BASE_URL_SUFFIX}"))
				&& catalog.contains(&format!("{s}{API_KEY_SUFFIX}"))
		})
		.map(|s| s.to_string())
		.collect()
}

/// `GET /status` — unauthenticated health and configuration summary.
/// Names only; never values.
pub async fn status(State(app): State<Arc<App>>) -> Json<Value> {
	Json(json!({
		"status": "ok",
		"version": app.cfg.version,
		"auth_mode": "stateless_jwt",
		"token_validity": "30d",
		"env_vars_available": app.catalog.visible_names(),
		"services_available": services_available(&app.catalog),
		"current_token_version": app.tokens.issued_count(),
		"global_revoke_timestamp": app.tokens.revoke_epoch(),
		"jwt_key_id": app.tokens.key_id(),
		"jwt_algorithm": "HS256",
	}))
}

#[derive(Deserialize)]
struct RevokeRequest {
	#[serde(default)]
	token_id: String,
}

/// `POST /revoke` — single-token revocation is impossible with stateless
/// tokens; acknowledge and point at `/revoke-all`.
pub async fn revoke(body: Bytes) -> Response {
	let parsed: Result<RevokeRequest, _> = serde_json::from_slice(&body);
	let Ok(req) = parsed else {
		return (StatusCode::BAD_REQUEST, "invalid request body").into_response();
	};
	debug!(token_id = %sanitize(&req.token_id), "single-token revoke requested (no-op)");
	Json(json!({
		"success": true,
		"message": "stateless tokens cannot be revoked individually; use /revoke-all",
	}))
	.into_response()
}

/// `POST /revoke-all` — advance the revocation epoch, invalidating every
/// token minted before now.
pub async fn revoke_all(State(app): State<Arc<App>>) -> Json<Value> {
	let epoch = app.tokens.revoke_all();
	info!(epoch, "revoked all outstanding tokens");
	Json(json!({
		"success": true,
		"message": "all tokens have been revoked",
		"revoke_timestamp": epoch,
	}))
}

/// `GET /services` — configured upstream services, exposing only the domain
/// part of each base URL.
pub async fn services(
	State(app): State<Arc<App>>,
	identity: axum::Extension<Identity>,
) -> Json<Value> {
	debug!(user = %sanitize(&identity.user_id), "service list requested");
	let mut services = Vec::new();
	for name in services_available(&app.catalog) {
		let base = app
			.catalog
			.get(&format!("{name}{BASE_URL_SUFFIX}"))
			.unwrap_or_default();
		let domain = base.split('/').nth(2).unwrap_or_default();
		let mut entry = json!({"name": name, "base_url": domain});
		if let Some(model) = app.catalog.get(&format!("{name}_MODEL")) {
			entry["default_model"] = Value::String(model.to_string());
		}
		services.push(entry);
	}
	Json(json!({
		"available_services": services,
		"message": "Call these through the proxy as /{service}/path or via env: references",
	}))
}

#[derive(Deserialize)]
pub struct EnvQuery {
	#[serde(default)]
	vars: Option<String>,
}

/// `GET /env` — externally visible environment *names* (never values), or
/// per-name availability when `?vars=a,b` is given.
pub async fn env_names(
	State(app): State<Arc<App>>,
	identity: axum::Extension<Identity>,
	Query(query): Query<EnvQuery>,
) -> Json<Value> {
	let visible = app.catalog.visible_names();
	debug!(
		user = %sanitize(&identity.user_id),
		count = visible.len(),
		"environment name listing requested"
	);

	let message = "Values are never returned; reference these names through proxied requests";
	match query.vars.as_deref().filter(|v| !v.is_empty()) {
		None => Json(json!({
			"available_vars": visible,
			"message": message,
		})),
		Some(requested) => {
			let availability: HashMap<&str, bool> = requested
				.split(',')
				.map(str::trim)
				.filter(|name| !name.is_empty())
				.map(|name| (name, visible.iter().any(|v| v == name)))
				.collect();
			Json(json!({
				"available_status": availability,
				"message": message,
			}))
		},
	}
}
