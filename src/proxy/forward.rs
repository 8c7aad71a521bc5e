use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::app::App;
use crate::auth::Identity;
use crate::proxy::GatewayError;
use crate::proxy::resolve::ResolvedTarget;
use crate::secrets::SecretCatalog;
use crate::subst;
use crate::telemetry::sanitize;

pub const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;
pub const MAX_RESPONSE_BODY: usize = 100 * 1024 * 1024;
pub const MAX_REDIRECTS: usize = 5;
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);
const STREAM_CHUNK: usize = 4096;

/// Field names that look like API-key carriers inside special-API bodies.
const API_KEY_FIELD_TOKENS: &[&str] = &[
	"api_key",
	"apikey",
	"access_key",
	"accesskey",
	"key",
	"token",
	"authorization",
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
static MAGIC_USER_ID: HeaderName = HeaderName::from_static("magic-user-id");
static MAGIC_ORGANIZATION_CODE: HeaderName = HeaderName::from_static("magic-organization-code");

/// The upstream HTTP client. Redirects are disabled: the forwarder follows
/// them itself so every hop re-enters URL admission.
pub fn upstream_client() -> reqwest::Client {
	reqwest::Client::builder()
		.redirect(reqwest::redirect::Policy::none())
		.timeout(UPSTREAM_TIMEOUT)
		.build()
		.expect("upstream client")
}

/// When the target sits under a configured special-API base URL (respecting
/// the `/`-or-end boundary after the prefix), return the bound key value.
pub fn special_api_key(
	catalog: &SecretCatalog,
	special: &HashMap<String, String>,
	target_base: &str,
) -> Option<String> {
	for (base_name, key_name) in special {
		let Some(base_value) = catalog.get(base_name) else {
			continue;
		};
		let Some(rest) = target_base.strip_prefix(base_value) else {
			continue;
		};
		if rest.is_empty() || rest.starts_with('/') {
			if let Some(key) = catalog.get(key_name) {
				debug!(base = %base_name, key = %key_name, "special API matched");
				return Some(key.to_string());
			}
		}
	}
	None
}

fn is_api_key_field(name: &str, dynamic: &[&String]) -> bool {
	let lower = name.to_lowercase();
	API_KEY_FIELD_TOKENS.iter().any(|t| lower.contains(t))
		|| dynamic.iter().any(|d| lower.contains(&d.to_lowercase()))
}

fn is_placeholder(field: &str, value: &str) -> bool {
	value.is_empty()
		|| value == format!("env:{field}")
		|| value == format!("${{{field}}}")
		|| value == format!("${field}")
		|| value == format!("{{${field}}}")
		|| value.contains("${")
		|| value.contains('$')
}

/// Walk a JSON body and replace every API-key-shaped field whose value is
/// empty or a placeholder with the bound key.
pub fn rewrite_api_key_fields(value: &mut Value, api_key: &str, dynamic: &[&String]) {
	match value {
		Value::Object(map) => {
			for (field, item) in map.iter_mut() {
				let replace = is_api_key_field(field, dynamic)
					&& matches!(item, Value::String(s) if is_placeholder(field, s));
				if replace {
					debug!(field = %sanitize(field), "bound API key into request body");
					*item = Value::String(api_key.to_string());
				} else {
					rewrite_api_key_fields(item, api_key, dynamic);
				}
			}
		},
		Value::Array(items) => {
			for item in items {
				rewrite_api_key_fields(item, api_key, dynamic);
			}
		},
		_ => {},
	}
}

fn skip_header(name: &HeaderName) -> bool {
	*name == HOST || *name == X_FORWARDED_FOR
}

/// Build the upstream header set: inbound headers minus the blocklist, each
/// value run through symbolic substitution, plus identity headers derived
/// from the verified claims (client-supplied values win).
pub fn build_upstream_headers(
	catalog: &SecretCatalog,
	inbound: &HeaderMap,
	identity: &Identity,
) -> HeaderMap {
	let mut out = HeaderMap::with_capacity(inbound.len() + 3);
	for (name, value) in inbound {
		if skip_header(name) {
			continue;
		}
		match value.to_str() {
			Ok(text) => {
				let resolved = subst::resolve_header_value(catalog, name, text);
				match HeaderValue::from_str(&resolved) {
					Ok(v) => {
						out.append(name.clone(), v);
					},
					Err(_) => {
						out.append(name.clone(), value.clone());
					},
				}
			},
			// Opaque bytes pass through untouched.
			Err(_) => {
				out.append(name.clone(), value.clone());
			},
		}
	}

	if let Ok(v) = HeaderValue::from_str(&identity.user_id) {
		out.insert(X_USER_ID.clone(), v);
	}
	let absent = |map: &HeaderMap, name: &HeaderName| {
		map
			.get(name)
			.and_then(|v| v.to_str().ok())
			.is_none_or(str::is_empty)
	};
	if !identity.magic_user_id.is_empty() && absent(&out, &MAGIC_USER_ID) {
		if let Ok(v) = HeaderValue::from_str(&identity.magic_user_id) {
			out.insert(MAGIC_USER_ID.clone(), v);
		}
	}
	if !identity.magic_organization_code.is_empty() && absent(&out, &MAGIC_ORGANIZATION_CODE) {
		if let Ok(v) = HeaderValue::from_str(&identity.magic_organization_code) {
			out.insert(MAGIC_ORGANIZATION_CODE.clone(), v);
		}
	}
	out
}

/// Compose the full upstream URL from the resolved base, the residual path,
/// and the substituted query string.
pub fn compose_url(catalog: &SecretCatalog, resolved: &ResolvedTarget, raw_query: &str) -> String {
	let base = resolved.base.trim_end_matches('/');
	let path = resolved.path.trim_start_matches('/');
	let mut url = format!("{base}/{path}");
	if !raw_query.is_empty() {
		let query = subst::resolve_query(catalog, raw_query);
		url.push('?');
		url.push_str(&query);
	}
	url
}

/// Forward an admitted request upstream and relay the response, streaming
/// SSE bodies chunk by chunk and buffering everything else under the cap.
pub async fn forward(
	app: &App,
	identity: &Identity,
	method: Method,
	inbound_headers: &HeaderMap,
	raw_query: &str,
	mut body: Bytes,
	resolved: &ResolvedTarget,
) -> Result<Response, GatewayError> {
	// Special-API bodies get their key fields bound before anything leaves.
	if let Some(key) = special_api_key(&app.catalog, &app.special_api_keys, &resolved.base) {
		let is_json = inbound_headers
			.get(CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|ct| ct.contains("application/json"));
		if is_json && !body.is_empty() {
			match serde_json::from_slice::<Value>(&body) {
				Ok(mut parsed) => {
					subst::resolve_json(&app.catalog, &mut parsed);
					let dynamic: Vec<&String> = app.special_api_keys.values().collect();
					rewrite_api_key_fields(&mut parsed, &key, &dynamic);
					match serde_json::to_vec(&parsed) {
						Ok(new_body) => body = Bytes::from(new_body),
						Err(e) => return Err(GatewayError::Internal(e.into())),
					}
				},
				Err(e) => debug!("special API body is not JSON, forwarding as-is: {e}"),
			}
		}
	}

	let mut headers = build_upstream_headers(&app.catalog, inbound_headers, identity);
	if let Some(key) = &resolved.api_key {
		if !headers.contains_key(AUTHORIZATION) {
			let bearer = format!("Bearer {key}");
			match HeaderValue::from_str(&bearer) {
				Ok(v) => {
					headers.insert(AUTHORIZATION, v);
					debug!("attached resolved upstream API key");
				},
				Err(_) => warn!("resolved API key is not a valid header value"),
			}
		}
	}
	// The body was fully read and may have been rewritten; any inbound
	// framing headers are stale.
	headers.remove(CONTENT_LENGTH);
	headers.remove(TRANSFER_ENCODING);

	let target_url = compose_url(&app.catalog, resolved, raw_query);
	debug!(url = %sanitize(&target_url), "forwarding upstream");

	let mut current = Url::parse(&target_url)
		.map_err(|e| GatewayError::Internal(anyhow::anyhow!("composed URL invalid: {e}")))?;
	let mut method = method;
	let mut body = Some(body);
	let mut redirects = 0usize;

	// One budget covers the whole exchange, redirect hops included; the
	// per-request client timeout alone would grant each hop a fresh 120s.
	let exchange = async {
		loop {
			let mut builder = app
				.http
				.request(method.clone(), current.clone())
				.headers(headers.clone());
			if let Some(b) = &body {
				builder = builder.body(b.clone());
			}
			let resp = builder.send().await.map_err(GatewayError::Upstream)?;

			if !resp.status().is_redirection() {
				return relay_response(resp).await;
			}
			let Some(location) = resp
				.headers()
				.get(LOCATION)
				.and_then(|v| v.to_str().ok())
				.map(str::to_string)
			else {
				// A 3xx without a location is relayed verbatim.
				return relay_response(resp).await;
			};

			redirects += 1;
			if redirects > MAX_REDIRECTS {
				warn!("redirect chain exceeded {MAX_REDIRECTS} hops");
				return Err(GatewayError::TooManyRedirects);
			}
			let next = current.join(&location).map_err(|_| {
				GatewayError::RedirectBlocked(crate::admission::AdmitError::Malformed(
					"unparseable redirect location".to_string(),
				))
			})?;
			// Each hop is re-validated with the full admission routine.
			app
				.guard
				.admit(next.as_str())
				.await
				.map_err(GatewayError::RedirectBlocked)?;
			debug!(url = %sanitize(next.as_str()), "following redirect");

			let status = resp.status();
			if status == StatusCode::SEE_OTHER
				|| ((status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
					&& method == Method::POST)
			{
				method = Method::GET;
				body = None;
				headers.remove(CONTENT_TYPE);
			}
			current = next;
		}
	};
	match tokio::time::timeout(UPSTREAM_TIMEOUT, exchange).await {
		Ok(result) => result,
		Err(_) => {
			warn!("upstream exchange exceeded {UPSTREAM_TIMEOUT:?}");
			Err(GatewayError::UpstreamTimeout)
		},
	}
}

fn is_streaming_content_type(headers: &HeaderMap) -> bool {
	let Some(ct) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
		return false;
	};
	let ct = ct.to_lowercase();
	["text/event-stream", "text/stream", "application/stream"]
		.iter()
		.any(|p| ct.starts_with(p))
}

fn split_chunk(mut chunk: Bytes) -> Vec<Bytes> {
	let mut out = Vec::with_capacity(chunk.len() / STREAM_CHUNK + 1);
	while chunk.len() > STREAM_CHUNK {
		out.push(chunk.split_to(STREAM_CHUNK));
	}
	out.push(chunk);
	out
}

async fn relay_response(resp: reqwest::Response) -> Result<Response, GatewayError> {
	let status = resp.status();
	debug!(status = %status, "upstream responded");

	let mut headers = HeaderMap::with_capacity(resp.headers().len());
	for (name, value) in resp.headers() {
		if skip_header(name) || *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING {
			continue;
		}
		headers.append(name.clone(), value.clone());
	}

	if is_streaming_content_type(resp.headers()) {
		// Each upstream chunk is re-framed at ≤4KiB and written through
		// immediately; nothing beyond the chunk in flight is buffered.
		let stream = resp.bytes_stream().flat_map(|item| {
			let pieces: Vec<Result<Bytes, reqwest::Error>> = match item {
				Ok(chunk) => split_chunk(chunk).into_iter().map(Ok).collect(),
				Err(e) => vec![Err(e)],
			};
			futures_util::stream::iter(pieces)
		});
		let mut response = Response::new(Body::from_stream(stream));
		*response.status_mut() = status;
		*response.headers_mut() = headers;
		return Ok(response);
	}

	let mut buf: Vec<u8> = Vec::new();
	let mut stream = resp.bytes_stream();
	while let Some(item) = stream.next().await {
		let chunk = item.map_err(GatewayError::Upstream)?;
		if buf.len() + chunk.len() >= MAX_RESPONSE_BODY {
			let take = MAX_RESPONSE_BODY - buf.len();
			buf.extend_from_slice(&chunk[..take]);
			warn!("upstream response exceeded {MAX_RESPONSE_BODY} bytes, truncated");
			break;
		}
		buf.extend_from_slice(&chunk);
	}

	let mut response = Response::new(Body::from(Bytes::from(buf)));
	*response.status_mut() = status;
	*response.headers_mut() = headers;
	Ok(response)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::secrets::SecretCatalog;

	fn catalog(vars: &[(&str, &str)]) -> SecretCatalog {
		SecretCatalog::new(
			vars
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.collect(),
			vec![],
			vec![],
		)
	}

	fn identity() -> Identity {
		Identity {
			user_id: "alice".to_string(),
			magic_user_id: "magic-1".to_string(),
			magic_organization_code: "org-7".to_string(),
		}
	}

	#[test]
	fn special_api_prefix_respects_boundary() {
		let c = catalog(&[
			("IMG_API_BASE_URL", "https://img.example.com/api"),
			("IMG_ACCESS_KEY", "img-key"),
		]);
		let special: HashMap<String, String> =
			[("IMG_API_BASE_URL".to_string(), "IMG_ACCESS_KEY".to_string())].into();

		assert_eq!(
			special_api_key(&c, &special, "https://img.example.com/api"),
			Some("img-key".to_string())
		);
		assert_eq!(
			special_api_key(&c, &special, "https://img.example.com/api/v2"),
			Some("img-key".to_string())
		);
		// A prefix match that splits a path segment does not count.
		assert_eq!(
			special_api_key(&c, &special, "https://img.example.com/apiv2"),
			None
		);
		assert_eq!(special_api_key(&c, &special, "https://other.example.com"), None);
	}

	#[test]
	fn api_key_fields_rewritten_only_when_placeholder() {
		let dynamic_owned = vec!["IMG_ACCESS_KEY".to_string()];
		let dynamic: Vec<&String> = dynamic_owned.iter().collect();
		let mut body = json!({
			"api_key": "",
			"accessKey": "env:accessKey",
			"token": "${token}",
			"img_access_key": "$IMG_ACCESS_KEY",
			"model": "gpt-4",
			"real_key": "already-set-key",
			"nested": [{"authorization": ""}],
		});
		rewrite_api_key_fields(&mut body, "the-key", &dynamic);
		assert_eq!(
			body,
			json!({
				"api_key": "the-key",
				"accessKey": "the-key",
				"token": "the-key",
				"img_access_key": "the-key",
				"model": "gpt-4",
				"real_key": "already-set-key",
				"nested": [{"authorization": "the-key"}],
			})
		);
	}

	#[test]
	fn upstream_headers_drop_hop_headers_and_resolve_refs() {
		let c = catalog(&[("OPENAI_API_KEY", "sk-real")]);
		let mut inbound = HeaderMap::new();
		inbound.insert(HOST, HeaderValue::from_static("gateway.local"));
		inbound.insert(
			HeaderName::from_static("x-forwarded-for"),
			HeaderValue::from_static("1.2.3.4"),
		);
		inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer OPENAI_API_KEY"));
		inbound.insert(
			HeaderName::from_static("x-custom"),
			HeaderValue::from_static("keep-me"),
		);

		let out = build_upstream_headers(&c, &inbound, &identity());
		assert!(!out.contains_key(HOST));
		assert!(!out.contains_key("x-forwarded-for"));
		assert_eq!(out.get(AUTHORIZATION).unwrap(), "Bearer sk-real");
		assert_eq!(out.get("x-custom").unwrap(), "keep-me");
		assert_eq!(out.get("x-user-id").unwrap(), "alice");
		assert_eq!(out.get("magic-user-id").unwrap(), "magic-1");
		assert_eq!(out.get("magic-organization-code").unwrap(), "org-7");
	}

	#[test]
	fn client_supplied_identity_headers_win() {
		let c = catalog(&[]);
		let mut inbound = HeaderMap::new();
		inbound.insert(
			HeaderName::from_static("magic-user-id"),
			HeaderValue::from_static("client-chosen"),
		);
		inbound.insert(
			HeaderName::from_static("magic-organization-code"),
			HeaderValue::from_static(""),
		);

		let out = build_upstream_headers(&c, &inbound, &identity());
		assert_eq!(out.get("magic-user-id").unwrap(), "client-chosen");
		// Empty client values do not win.
		assert_eq!(out.get("magic-organization-code").unwrap(), "org-7");
	}

	#[test]
	fn compose_url_joins_and_substitutes_query() {
		let c = catalog(&[("MODEL", "gpt-4o")]);
		let r = ResolvedTarget {
			base: "https://api.example.com/v1/".to_string(),
			path: "/chat/completions".to_string(),
			api_key: None,
		};
		assert_eq!(
			compose_url(&c, &r, "model=${MODEL}&n=1"),
			"https://api.example.com/v1/chat/completions?model=gpt-4o&n=1"
		);
		assert_eq!(compose_url(&c, &r, ""), "https://api.example.com/v1/chat/completions");
	}

	#[test]
	fn chunks_split_at_stream_size() {
		let big = Bytes::from(vec![0u8; STREAM_CHUNK * 2 + 10]);
		let parts = split_chunk(big);
		assert_eq!(parts.len(), 3);
		assert_eq!(parts[0].len(), STREAM_CHUNK);
		assert_eq!(parts[1].len(), STREAM_CHUNK);
		assert_eq!(parts[2].len(), 10);

		let small = Bytes::from_static(b"tiny");
		assert_eq!(split_chunk(small).len(), 1);
	}

	#[test]
	fn streaming_detection() {
		for (ct, expected) in [
			("text/event-stream", true),
			("text/event-stream; charset=utf-8", true),
			("TEXT/STREAM", true),
			("application/stream+json", true),
			("application/json", false),
		] {
			let mut h = HeaderMap::new();
			h.insert(CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
			assert_eq!(is_streaming_content_type(&h), expected, "{ct}");
		}
	}
}
