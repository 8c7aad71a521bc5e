use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Router, middleware};
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use tracing::{debug, info, warn};

use crate::admission::{self, UrlGuard};
use crate::auth::{self, Identity, TokenAuthority};
use crate::config::Config;
use crate::management::{self, sign};
use crate::otlp::{self, OtlpBridge};
use crate::proxy::GatewayError;
use crate::proxy::forward::{self, MAX_REQUEST_BODY};
use crate::proxy::resolve::resolve_target;
use crate::secrets::SecretCatalog;
use crate::telemetry::sanitize;

/// Paths the gateway owns; a leading segment matching one of these is never
/// treated as a proxy selector, so a catalog entry named like a reserved
/// word is unreachable by design.
const RESERVED_PATHS: &[&str] = &["auth", "env", "status", "revoke", "revoke-all", "services"];

/// Process-wide state. Everything here is written once at startup and
/// read-only afterwards; the only mutable cells are the two atomics inside
/// `TokenAuthority`.
pub struct App {
	pub cfg: Config,
	pub catalog: SecretCatalog,
	pub guard: UrlGuard,
	pub tokens: TokenAuthority,
	pub special_api_keys: HashMap<String, String>,
	pub bridge: Option<OtlpBridge>,
	pub signer: Option<sign::DataSigner>,
	pub http: reqwest::Client,
}

impl App {
	pub fn new(cfg: Config, catalog: SecretCatalog) -> anyhow::Result<Arc<App>> {
		let rules = admission::parse_rules(&cfg.allowed_target_urls);
		if rules.is_empty() {
			warn!("no target URL allowlist configured; all proxying will be refused");
		} else {
			info!(count = rules.len(), "loaded target URL allowlist");
			for rule in &rules {
				debug!(rule = %rule, "allowlist rule");
			}
		}
		let allow_internal = admission::parse_internal_cidrs(&cfg.allowed_target_ips);
		let guard = UrlGuard::new(rules, allow_internal)?;

		let tokens = TokenAuthority::new(cfg.gateway_key.clone());
		info!(key_id = %tokens.key_id(), "token authority initialized");

		let bridge = OtlpBridge::from_catalog(&catalog, &cfg.apm_endpoint);
		let signer = cfg
			.data_signing_key
			.as_deref()
			.and_then(sign::DataSigner::new);
		if signer.is_none() {
			info!("data signing key absent; /api/ai-generated/sign is disabled");
		}

		Ok(Arc::new(App {
			special_api_keys: cfg.special_api_keys.clone(),
			catalog,
			guard,
			tokens,
			bridge,
			signer,
			http: forward::upstream_client(),
			cfg,
		}))
	}
}

pub fn router(app: Arc<App>) -> Router {
	let mut protected = Router::new()
		.route("/revoke", post(management::revoke))
		.route("/revoke-all", post(management::revoke_all))
		.route("/services", get(management::services))
		.route("/env", get(management::env_names))
		.route("/api/user/info", get(sign::user_info));
	if app.signer.is_some() {
		protected = protected.route("/api/ai-generated/sign", post(sign::sign_data));
	}
	let protected = protected
		.fallback(proxy_handler)
		.layer(middleware::from_fn_with_state(app.clone(), auth::gate));

	Router::new()
		.route("/auth", post(management::issue_token))
		.route("/status", get(management::status))
		.merge(protected)
		.with_state(app)
}

/// The catch-all proxy pipeline: reserved-path check, target resolution,
/// URL admission, OTLP short-circuit, then the forwarder.
async fn proxy_handler(
	State(app): State<Arc<App>>,
	Extension(identity): Extension<Identity>,
	req: Request,
) -> Result<Response, GatewayError> {
	let (parts, body) = req.into_parts();
	let full_path = parts.uri.path().to_string();
	let path = full_path.trim_matches('/').to_string();
	let raw_query = parts.uri.query().unwrap_or_default().to_string();

	let head = path.split('/').next().unwrap_or_default();
	if RESERVED_PATHS.contains(&head) {
		return Err(GatewayError::ReservedPath);
	}

	debug!(
		user = %sanitize(&identity.user_id),
		path = %sanitize(&path),
		"proxy request"
	);

	let mut target_param = None;
	let mut service_param = None;
	for (k, v) in form_urlencoded::parse(raw_query.as_bytes()) {
		match k.as_ref() {
			"target" if target_param.is_none() => target_param = Some(v.into_owned()),
			"service" if service_param.is_none() => service_param = Some(v.into_owned()),
			_ => {},
		}
	}

	let body = read_body_capped(body).await?;

	let resolved = resolve_target(
		&app.catalog,
		&path,
		target_param.as_deref(),
		service_param.as_deref(),
	)?;
	app.guard.admit(&resolved.base).await?;
	debug!(target = %sanitize(&resolved.base), "target URL admitted");

	if otlp::is_apm_target(&resolved.base) {
		if let Some(bridge) = &app.bridge {
			return bridge
				.handle(&parts.headers, &full_path, body)
				.await
				.map_err(GatewayError::OtlpBridge);
		}
		warn!("APM upstream detected but no appkey is configured; forwarding as plain HTTP");
	}

	forward::forward(
		&app,
		&identity,
		parts.method,
		&parts.headers,
		&raw_query,
		body,
		&resolved,
	)
	.await
}

async fn read_body_capped(body: axum::body::Body) -> Result<Bytes, GatewayError> {
	match Limited::new(body, MAX_REQUEST_BODY).collect().await {
		Ok(collected) => Ok(collected.to_bytes()),
		Err(e) if e.is::<http_body_util::LengthLimitError>() => Err(GatewayError::BodyTooLarge),
		Err(e) => Err(GatewayError::Internal(anyhow::anyhow!(
			"failed to read request body: {e}"
		))),
	}
}

pub async fn run(app: Arc<App>) -> anyhow::Result<()> {
	let addr = SocketAddr::from(([0, 0, 0, 0], app.cfg.port));
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!("gateway listening on http://{addr}");
	axum::serve(listener, router(app))
		.with_graceful_shutdown(shutdown_signal())
		.await?;
	Ok(())
}

async fn shutdown_signal() {
	if tokio::signal::ctrl_c().await.is_ok() {
		info!("shutdown signal received");
	}
}
