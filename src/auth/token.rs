use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The only scope the gateway mints or accepts.
pub const SCOPE: &str = "api_gateway";

const TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Signed token payload. Field names are wire-stable: clients and sibling
/// services deserialize these claims directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
	pub jti: String,
	pub iat: u64,
	pub nbf: u64,
	pub exp: u64,
	pub container_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub magic_user_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub magic_organization_code: String,
	pub token_version: i64,
	pub created_at: i64,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub kid: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub nonce: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub scope: String,
}

impl Claims {
	pub fn user_id(&self) -> &str {
		&self.container_id
	}
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
	#[error("no bearer token found")]
	Missing,
	#[error("the token header is malformed: {0}")]
	InvalidHeader(jsonwebtoken::errors::Error),
	#[error("unexpected signing algorithm {0:?}")]
	BadAlgorithm(Algorithm),
	#[error("token key id {0:?} does not match the current key")]
	KeyIdMismatch(String),
	#[error("the token is invalid or expired: {0}")]
	Invalid(jsonwebtoken::errors::Error),
	#[error("token scope {0:?} is not accepted")]
	BadScope(String),
	#[error("token was created before the revocation epoch")]
	Revoked,
}

/// Mints and verifies gateway bearer tokens against a fixed process-lifetime
/// secret. The only mutable state are two atomics: the monotonic issue
/// counter and the revocation epoch.
pub struct TokenAuthority {
	secret: SecretString,
	key_id: String,
	encoding: EncodingKey,
	decoding: DecodingKey,
	issue_counter: AtomicI64,
	revoke_epoch: AtomicI64,
}

impl fmt::Debug for TokenAuthority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TokenAuthority")
			.field("key_id", &self.key_id)
			.finish()
	}
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("clock before unix epoch")
		.as_secs()
}

fn unix_now_nanos() -> u128 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("clock before unix epoch")
		.as_nanos()
}

impl TokenAuthority {
	pub fn new(secret: SecretString) -> Self {
		let bytes = secret.expose_secret().as_bytes();
		// The key id ties every token to the secret it was minted with:
		// first eight bytes of SHA-256, hex encoded.
		let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
		let key_id = hex::encode(&digest.as_ref()[..8]);
		TokenAuthority {
			key_id,
			encoding: EncodingKey::from_secret(bytes),
			decoding: DecodingKey::from_secret(bytes),
			secret,
			issue_counter: AtomicI64::new(0),
			revoke_epoch: AtomicI64::new(0),
		}
	}

	pub fn key_id(&self) -> &str {
		&self.key_id
	}

	pub fn issued_count(&self) -> i64 {
		self.issue_counter.load(Ordering::SeqCst)
	}

	pub fn revoke_epoch(&self) -> i64 {
		self.revoke_epoch.load(Ordering::SeqCst)
	}

	/// Constant-time check of the shared gateway secret presented on `/auth`.
	pub fn verify_gateway_key(&self, presented: &str) -> bool {
		!presented.is_empty()
			&& ring::constant_time::verify_slices_are_equal(
				presented.as_bytes(),
				self.secret.expose_secret().as_bytes(),
			)
			.is_ok()
	}

	pub fn issue(
		&self,
		user_id: &str,
		magic_user_id: &str,
		magic_organization_code: &str,
	) -> Result<String, TokenError> {
		self.issue_at(unix_now(), user_id, magic_user_id, magic_organization_code)
	}

	fn issue_at(
		&self,
		now: u64,
		user_id: &str,
		magic_user_id: &str,
		magic_organization_code: &str,
	) -> Result<String, TokenError> {
		let version = self.issue_counter.fetch_add(1, Ordering::SeqCst) + 1;
		let nonce: [u8; 16] = rand::rng().random();
		let claims = Claims {
			jti: format!("{}-{}", unix_now_nanos(), user_id),
			iat: now,
			nbf: now,
			exp: now + TOKEN_TTL_SECS,
			container_id: user_id.to_string(),
			magic_user_id: magic_user_id.to_string(),
			magic_organization_code: magic_organization_code.to_string(),
			token_version: version,
			created_at: now as i64,
			kid: self.key_id.clone(),
			nonce: hex::encode(nonce),
			scope: SCOPE.to_string(),
		};
		let mut header = Header::new(Algorithm::HS256);
		header.kid = Some(self.key_id.clone());
		jsonwebtoken::encode(&header, &claims, &self.encoding).map_err(TokenError::Invalid)
	}

	/// Verify a presented token. Accepts either a bare token or one with a
	/// `Bearer ` prefix (any case).
	pub fn verify(&self, presented: &str) -> Result<Claims, TokenError> {
		let token = strip_bearer(presented);
		if token.is_empty() {
			return Err(TokenError::Missing);
		}

		let header = decode_header(token).map_err(TokenError::InvalidHeader)?;
		match header.alg {
			Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {},
			other => return Err(TokenError::BadAlgorithm(other)),
		}
		match header.kid.as_deref() {
			Some(kid) if kid == self.key_id => {},
			other => return Err(TokenError::KeyIdMismatch(other.unwrap_or("").to_string())),
		}

		let mut validation = Validation::new(Algorithm::HS256);
		validation.validate_nbf = true;
		validation.set_required_spec_claims(&["exp"]);
		let data =
			decode::<Claims>(token, &self.decoding, &validation).map_err(TokenError::Invalid)?;
		let claims = data.claims;

		if claims.scope != SCOPE {
			return Err(TokenError::BadScope(claims.scope));
		}
		if claims.kid != self.key_id {
			return Err(TokenError::KeyIdMismatch(claims.kid));
		}
		if claims.created_at < self.revoke_epoch.load(Ordering::SeqCst) {
			debug!(jti = %claims.jti, "token predates the revocation epoch");
			return Err(TokenError::Revoked);
		}
		Ok(claims)
	}

	/// Invalidate every previously issued token. Returns the new epoch.
	pub fn revoke_all(&self) -> i64 {
		let now = unix_now() as i64;
		self.revoke_epoch.store(now, Ordering::SeqCst);
		now
	}
}

fn strip_bearer(s: &str) -> &str {
	let trimmed = s.trim();
	if trimmed.eq_ignore_ascii_case("bearer") {
		return "";
	}
	match trimmed.split_at_checked(7) {
		Some((prefix, rest)) if prefix.eq_ignore_ascii_case("bearer ") => rest.trim_start(),
		_ => trimmed,
	}
}
