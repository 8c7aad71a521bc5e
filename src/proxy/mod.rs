pub mod forward;
pub mod resolve;

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use tracing::{debug, warn};

use crate::admission::AdmitError;
use crate::auth::TokenError;

/// Every failure the gateway surfaces at the HTTP boundary. Variants carry
/// the internal detail for logging; the wire mapping deliberately collapses
/// admission failures to a plain 404 so callers cannot probe the allowlist.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
	#[error("authorization required")]
	AuthMissing,
	#[error("invalid or expired token: {0}")]
	AuthBad(TokenError),
	#[error("invalid gateway API key")]
	GatewayKeyBad,
	#[error("request body exceeds the 10MiB limit")]
	BodyTooLarge,
	#[error("reserved path")]
	ReservedPath,
	#[error("no upstream target resolved")]
	TargetResolutionMiss,
	#[error("environment variable is not visible")]
	EnvNotVisible,
	#[error("target rejected: {0}")]
	Rejected(#[from] AdmitError),
	#[error("upstream call failed: {0}")]
	Upstream(reqwest::Error),
	#[error("upstream request exceeded the end-to-end timeout")]
	UpstreamTimeout,
	#[error("redirect blocked: {0}")]
	RedirectBlocked(AdmitError),
	#[error("too many redirects")]
	TooManyRedirects,
	#[error("OTLP bridge failed: {0}")]
	OtlpBridge(crate::otlp::BridgeError),
	#[error("internal error: {0}")]
	Internal(anyhow::Error),
}

impl GatewayError {
	fn status(&self) -> StatusCode {
		match self {
			GatewayError::AuthMissing | GatewayError::AuthBad(_) | GatewayError::GatewayKeyBad => {
				StatusCode::UNAUTHORIZED
			},
			GatewayError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			GatewayError::ReservedPath
			| GatewayError::TargetResolutionMiss
			| GatewayError::EnvNotVisible
			| GatewayError::Rejected(_) => StatusCode::NOT_FOUND,
			GatewayError::Upstream(_)
			| GatewayError::UpstreamTimeout
			| GatewayError::RedirectBlocked(_)
			| GatewayError::TooManyRedirects
			| GatewayError::OtlpBridge(_) => StatusCode::BAD_GATEWAY,
			GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// What the caller sees. Admission detail stays server-side.
	fn public_message(&self) -> String {
		match self {
			GatewayError::ReservedPath
			| GatewayError::TargetResolutionMiss
			| GatewayError::EnvNotVisible
			| GatewayError::Rejected(_) => "Not Found".to_string(),
			GatewayError::AuthMissing => "authorization required".to_string(),
			GatewayError::AuthBad(_) => "invalid or expired token".to_string(),
			GatewayError::GatewayKeyBad => "invalid gateway API key".to_string(),
			GatewayError::Internal(_) => "internal error".to_string(),
			other => other.to_string(),
		}
	}
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		let status = self.status();
		match &self {
			GatewayError::Internal(e) => warn!("internal error: {e:#}"),
			GatewayError::Upstream(e) => warn!("upstream call failed: {e}"),
			other => debug!("request rejected: {other}"),
		}
		(status, self.public_message()).into_response()
	}
}
