use http::HeaderName;
use http::header::AUTHORIZATION;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::secrets::{SecretCatalog, mask};
use crate::telemetry::sanitize;

static VAR_BRACED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").unwrap());
static VAR_CURLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\$([A-Za-z0-9_]+)\}").unwrap());
static VAR_PLAIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$([A-Za-z0-9_]+)").unwrap());
static BYTEAPM_APPKEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"X-ByteAPM-AppKey=[^\s,;]*").unwrap());

pub const OTEL_HEADERS_VAR: &str = "OTEL_EXPORTER_OTLP_HEADERS";

fn expand_with(catalog: &SecretCatalog, re: &Regex, s: &str) -> String {
	re.replace_all(s, |caps: &regex::Captures<'_>| {
		let name = &caps[1];
		match catalog.get(name) {
			Some(v) => v.to_string(),
			// Undefined references stay literal.
			None => caps[0].to_string(),
		}
	})
	.into_owned()
}

/// Expand `${NAME}`, `{$NAME}` and `$NAME` references against the catalog.
/// `{$NAME}` runs before `$NAME` so the braces are consumed with the
/// reference rather than left behind.
pub fn expand_refs(catalog: &SecretCatalog, s: &str) -> String {
	if !s.contains('$') {
		return s.to_string();
	}
	let s = expand_with(catalog, &VAR_BRACED, s);
	let s = expand_with(catalog, &VAR_CURLY, &s);
	expand_with(catalog, &VAR_PLAIN, &s)
}

/// Resolve a whole string: `env:NAME`, an exact catalog name, then the
/// embedded reference forms. Identity on strings with no references.
pub fn resolve_string(catalog: &SecretCatalog, s: &str) -> String {
	if let Some(name) = s.strip_prefix("env:") {
		if let Some(v) = catalog.get(name) {
			debug!(name = %sanitize(name), value = %mask(v), "resolved env: reference");
			return v.to_string();
		}
		return s.to_string();
	}
	if let Some(v) = catalog.get(s) {
		debug!(name = %sanitize(s), value = %mask(v), "resolved catalog name");
		return v.to_string();
	}
	expand_refs(catalog, s)
}

/// Recursively resolve every string inside a JSON value.
pub fn resolve_json(catalog: &SecretCatalog, value: &mut Value) {
	match value {
		Value::String(s) => {
			let resolved = resolve_string(catalog, s);
			if resolved != *s {
				*s = resolved;
			}
		},
		Value::Array(items) => {
			for item in items {
				resolve_json(catalog, item);
			}
		},
		Value::Object(map) => {
			for (_, item) in map.iter_mut() {
				resolve_json(catalog, item);
			}
		},
		_ => {},
	}
}

/// Resolve a header value. Two extra shapes come first: the ByteAPM appkey
/// assignment (replaced wholesale from `OTEL_EXPORTER_OTLP_HEADERS`), and
/// the bearer forms on `Authorization`.
pub fn resolve_header_value(catalog: &SecretCatalog, name: &HeaderName, value: &str) -> String {
	if value.contains("X-ByteAPM-AppKey=") {
		if let Some(otel) = catalog.get(OTEL_HEADERS_VAR) {
			return BYTEAPM_APPKEY
				.replace_all(value, regex::NoExpand(otel))
				.into_owned();
		}
	}

	if *name == AUTHORIZATION {
		if let Some(rest) = value.strip_prefix("Bearer env:") {
			if let Some(v) = catalog.get(rest) {
				return format!("Bearer {v}");
			}
		}
		if let Some(rest) = value.strip_prefix("Bearer ") {
			if let Some(v) = catalog.get(rest) {
				return format!("Bearer {v}");
			}
		}
	}

	if let Some(v) = catalog.get(value) {
		return v.to_string();
	}
	expand_refs(catalog, value)
}

/// Rebuild a raw query string with every value resolved.
pub fn resolve_query(catalog: &SecretCatalog, raw_query: &str) -> String {
	let mut out = form_urlencoded::Serializer::new(String::new());
	for (k, v) in form_urlencoded::parse(raw_query.as_bytes()) {
		let resolved = if let Some(exact) = catalog.get(v.as_ref()) {
			exact.to_string()
		} else {
			expand_refs(catalog, v.as_ref())
		};
		out.append_pair(k.as_ref(), &resolved);
	}
	out.finish()
}
