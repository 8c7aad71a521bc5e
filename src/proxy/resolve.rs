use tracing::debug;

use crate::proxy::GatewayError;
use crate::secrets::{API_KEY_SUFFIX, BASE_URL_SUFFIX, SecretCatalog};
use crate::subst;
use crate::telemetry::sanitize;

/// Services addressable by bare name (`/openai/...`) when both their base
/// URL and API key are configured.
pub const SUPPORTED_SERVICES: &[&str] = &["OPENAI", "MAGIC", "DEEPSEEK"];

/// Outcome of target resolution: the upstream base URL, the residual path to
/// append, and an API key to attach when the client supplied no
/// `Authorization` of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
	pub base: String,
	pub path: String,
	pub api_key: Option<String>,
}

fn service_info(catalog: &SecretCatalog, name: &str) -> Option<(String, String)> {
	let upper = name.to_uppercase();
	let base = catalog.get(&format!("{upper}{BASE_URL_SUFFIX}"))?;
	let key = catalog.get(&format!("{upper}{API_KEY_SUFFIX}"))?;
	Some((base.to_string(), key.to_string()))
}

/// Pick the upstream in strict precedence: explicit `?target=`, symbolic
/// catalog name as the leading path segment, built-in service by path, by
/// `?service=`, and finally a `<HEAD>_API_URL` variable.
///
/// The visibility filter runs on the client-controlled head before any
/// catalog value is considered, and the resolved base goes through symbolic
/// substitution before URL admission.
pub fn resolve_target(
	catalog: &SecretCatalog,
	path: &str,
	target_param: Option<&str>,
	service_param: Option<&str>,
) -> Result<ResolvedTarget, GatewayError> {
	let mut resolved = pick(catalog, path, target_param, service_param)?;
	resolved.base = subst::resolve_string(catalog, &resolved.base);
	Ok(resolved)
}

fn pick(
	catalog: &SecretCatalog,
	path: &str,
	target_param: Option<&str>,
	service_param: Option<&str>,
) -> Result<ResolvedTarget, GatewayError> {
	// 1. Explicit ?target= always wins and never carries a key.
	if let Some(target) = target_param.filter(|t| !t.is_empty()) {
		debug!(target = %sanitize(target), "target from query parameter");
		return Ok(ResolvedTarget {
			base: target.to_string(),
			path: path.to_string(),
			api_key: None,
		});
	}

	let (head, rest) = match path.split_once('/') {
		Some((head, rest)) => (head, rest),
		None => (path, ""),
	};

	// 2. The head names a catalog entry. A hidden name must look exactly
	// like a miss so callers cannot probe which names exist.
	if catalog.contains(head) {
		if !catalog.is_visible(head) {
			debug!(name = %sanitize(head), "rejected non-visible env selector");
			return Err(GatewayError::EnvNotVisible);
		}
		let base = catalog.get(head).unwrap_or_default().to_string();
		let api_key = head
			.ends_with(BASE_URL_SUFFIX)
			.then(|| catalog.paired_api_key(head).map(str::to_string))
			.flatten();
		debug!(name = %sanitize(head), "target from symbolic path selector");
		return Ok(ResolvedTarget {
			base,
			path: rest.to_string(),
			api_key,
		});
	}

	// 3. Built-in service by leading path segment.
	let head_upper = head.to_uppercase();
	if SUPPORTED_SERVICES.contains(&head_upper.as_str()) {
		if let Some((base, key)) = service_info(catalog, &head_upper) {
			debug!(service = %head_upper, "target from service path");
			return Ok(ResolvedTarget {
				base,
				path: rest.to_string(),
				api_key: Some(key),
			});
		}
	}

	// 4. Built-in service by ?service= query parameter; the full path is
	// preserved.
	if let Some(service) = service_param.filter(|s| !s.is_empty()) {
		let upper = service.to_uppercase();
		if SUPPORTED_SERVICES.contains(&upper.as_str()) {
			if let Some((base, key)) = service_info(catalog, &upper) {
				debug!(service = %upper, "target from service query parameter");
				return Ok(ResolvedTarget {
					base,
					path: path.to_string(),
					api_key: Some(key),
				});
			}
		}
	}

	// 5. A `<HEAD>_API_URL` variable.
	if let Some(base) = catalog.get(&format!("{head_upper}_API_URL")) {
		let api_key = catalog
			.get(&format!("{head_upper}{API_KEY_SUFFIX}"))
			.map(str::to_string);
		debug!(name = %sanitize(head), "target from API_URL variable");
		return Ok(ResolvedTarget {
			base: base.to_string(),
			path: rest.to_string(),
			api_key,
		});
	}

	Err(GatewayError::TargetResolutionMiss)
}
