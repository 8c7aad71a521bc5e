pub mod token;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::HeaderName;
use http::header::AUTHORIZATION;
pub use token::{Claims, SCOPE, TokenAuthority, TokenError};
use tracing::debug;

use crate::app::App;
use crate::proxy::GatewayError;
use crate::telemetry::sanitize;

/// The preferred token header; `Authorization` is the fallback so standard
/// clients work unchanged.
pub static MAGIC_AUTHORIZATION: HeaderName = HeaderName::from_static("magic-authorization");

/// Identity claims verified by the gate, attached to the request extensions
/// for downstream handlers. Handlers never read identity out of inbound
/// headers directly.
#[derive(Debug, Clone)]
pub struct Identity {
	pub user_id: String,
	pub magic_user_id: String,
	pub magic_organization_code: String,
}

impl From<&Claims> for Identity {
	fn from(claims: &Claims) -> Self {
		Identity {
			user_id: claims.container_id.clone(),
			magic_user_id: claims.magic_user_id.clone(),
			magic_organization_code: claims.magic_organization_code.clone(),
		}
	}
}

/// Bearer-token middleware for every protected route.
pub async fn gate(State(app): State<Arc<App>>, mut req: Request, next: Next) -> Response {
	let claims = match authenticate(&app, req.headers()) {
		Ok(claims) => claims,
		Err(e) => return e.into_response(),
	};
	debug!(
		user = %sanitize(claims.user_id()),
		org = %sanitize(&claims.magic_organization_code),
		"request authenticated"
	);
	req.extensions_mut().insert(Identity::from(&claims));
	req.extensions_mut().insert(claims);
	next.run(req).await
}

fn authenticate(app: &App, headers: &http::HeaderMap) -> Result<Claims, GatewayError> {
	let raw = headers
		.get(&MAGIC_AUTHORIZATION)
		.or_else(|| headers.get(AUTHORIZATION))
		.ok_or(GatewayError::AuthMissing)?;
	let value = raw.to_str().map_err(|_| GatewayError::AuthMissing)?;
	// A missing Bearer prefix is tolerated; the verifier strips it when
	// present and takes the bare token otherwise.
	app.tokens.verify(value).map_err(GatewayError::AuthBad)
}
