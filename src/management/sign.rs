use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::app::App;
use crate::auth::Identity;
use crate::telemetry::sanitize;

const SIGNATURE_LEN: usize = 16;

/// Keyed BLAKE3 MAC over caller-supplied data. The 16-byte digest is the
/// truncated extended output, base64 encoded.
#[derive(Clone)]
pub struct DataSigner {
	key: [u8; blake3::KEY_LEN],
}

impl std::fmt::Debug for DataSigner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DataSigner").finish()
	}
}

impl DataSigner {
	pub fn new(key: &[u8]) -> Option<Self> {
		let key: [u8; blake3::KEY_LEN] = key.try_into().ok()?;
		Some(DataSigner { key })
	}

	pub fn sign(&self, data: &str) -> String {
		let mut hasher = blake3::Hasher::new_keyed(&self.key);
		hasher.update(data.as_bytes());
		let mut out = [0u8; SIGNATURE_LEN];
		hasher.finalize_xof().fill(&mut out);
		BASE64.encode(out)
	}
}

#[derive(Deserialize)]
struct SignRequest {
	#[serde(default)]
	data: String,
	// Accepted for compatibility; only the keyed-hash scheme exists.
	#[serde(default, rename = "sign_type")]
	_sign_type: Option<String>,
}

/// `POST /api/ai-generated/sign`
pub async fn sign_data(State(app): State<Arc<App>>, body: Bytes) -> Response {
	let Some(signer) = &app.signer else {
		return (StatusCode::NOT_FOUND, "Not Found").into_response();
	};
	let Ok(req) = serde_json::from_slice::<SignRequest>(&body) else {
		return (StatusCode::BAD_REQUEST, "invalid request body").into_response();
	};
	if req.data.is_empty() {
		return (StatusCode::BAD_REQUEST, "data is required").into_response();
	}
	Json(json!({"signature": signer.sign(&req.data)})).into_response()
}

/// `GET /api/user/info` — echo the verified identity claims.
pub async fn user_info(identity: axum::Extension<Identity>) -> Json<serde_json::Value> {
	debug!(user = %sanitize(&identity.user_id), "user info requested");
	let user_id = if identity.magic_user_id.is_empty() {
		&identity.user_id
	} else {
		&identity.magic_user_id
	};
	Json(json!({
		"user_id": user_id,
		"organization_code": identity.magic_organization_code,
	}))
}
