use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::SecretString;
use tracing::warn;

use crate::secrets::DEFAULT_BLACKLIST;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_APM_ENDPOINT: &str = "apmplus-cn-beijing.ivolces.com:4317";

/// Gateway configuration, read once from the process environment at startup.
/// The variable names are part of the deployment contract.
pub struct Config {
	pub port: u16,
	pub debug: bool,
	pub version: String,
	/// Shared gateway secret; also the token signing key.
	pub gateway_key: SecretString,
	pub env_blacklist: Vec<String>,
	pub env_whitelist_prefixes: Vec<String>,
	/// Raw `|`-separated allowlist rules, parsed by the admission guard.
	pub allowed_target_urls: String,
	/// Raw allowed-internal CIDR list.
	pub allowed_target_ips: String,
	/// `base_url_name -> api_key_name` pairs for upstreams whose JSON bodies
	/// get API-key fields rewritten.
	pub special_api_keys: HashMap<String, String>,
	pub apm_endpoint: String,
	/// Decoded BLAKE3 key for the data-signing endpoint; absent disables it.
	pub data_signing_key: Option<Vec<u8>>,
}

impl Config {
	pub fn from_env() -> anyhow::Result<Config> {
		let gateway_key: String = parse("MAGIC_GATEWAY_API_KEY")?
			.ok_or_else(|| anyhow::anyhow!("MAGIC_GATEWAY_API_KEY must be set"))?;

		let blacklist = match parse::<String>("MAGIC_GATEWAY_ENV_BLACKLIST")? {
			Some(raw) if !raw.is_empty() => raw.split(',').map(|s| s.trim().to_string()).collect(),
			_ => DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
		};
		let whitelist = parse::<String>("MAGIC_GATEWAY_ENV_WHITELIST_PREFIXES")?
			.map(|raw| {
				raw
					.trim_matches(['"', '\''])
					.split(',')
					.map(|s| s.trim().to_string())
					.filter(|s| !s.is_empty())
					.collect::<Vec<_>>()
			})
			.unwrap_or_default();
		if whitelist.is_empty() {
			warn!("MAGIC_GATEWAY_ENV_WHITELIST_PREFIXES is unset; no environment name is visible");
		}

		Ok(Config {
			port: parse_default("MAGIC_GATEWAY_PORT", DEFAULT_PORT)?,
			debug: parse::<String>("MAGIC_GATEWAY_DEBUG")?.as_deref() == Some("true"),
			version: parse_default("API_GATEWAY_VERSION", "1.0.0".to_string())?,
			gateway_key: SecretString::from(gateway_key),
			env_blacklist: blacklist,
			env_whitelist_prefixes: whitelist,
			allowed_target_urls: parse_default("MAGIC_GATEWAY_ALLOWED_TARGET_URLS", String::new())?,
			allowed_target_ips: parse_default("MAGIC_GATEWAY_ALLOWED_TARGET_IP", String::new())?,
			special_api_keys: parse_special_api_keys(&parse_default(
				"MAGIC_GATEWAY_SPECIAL_API_KEYS",
				String::new(),
			)?),
			apm_endpoint: parse_default("VOLCENGINE_APM_ENDPOINT", DEFAULT_APM_ENDPOINT.to_string())?,
			data_signing_key: decode_signing_key(parse::<String>("AI_DATA_SIGNING_KEY")?),
		})
	}
}

/// Parse the `base_url_name:api_key_name|...` pair list. Malformed pairs are
/// skipped with a warning so one typo does not take the gateway down.
pub fn parse_special_api_keys(raw: &str) -> HashMap<String, String> {
	let mut map = HashMap::new();
	for pair in raw.split('|') {
		let pair = pair.trim();
		if pair.is_empty() {
			continue;
		}
		match pair.split_once(':') {
			Some((base, key)) if !base.trim().is_empty() && !key.trim().is_empty() => {
				map.insert(base.trim().to_string(), key.trim().to_string());
			},
			_ => warn!("ignoring malformed special API pair {pair:?}"),
		}
	}
	map
}

fn decode_signing_key(raw: Option<String>) -> Option<Vec<u8>> {
	let raw = raw?;
	match BASE64.decode(raw.trim()) {
		Ok(key) if key.len() == blake3::KEY_LEN => Some(key),
		Ok(key) => {
			warn!(
				"AI_DATA_SIGNING_KEY must decode to {} bytes, got {}; signing disabled",
				blake3::KEY_LEN,
				key.len()
			);
			None
		},
		Err(e) => {
			warn!("AI_DATA_SIGNING_KEY is not valid base64 ({e}); signing disabled");
			None
		},
	}
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val.parse().map(Some).map_err(|e: <T as FromStr>::Err| {
			anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
		}),
		Err(_) => Ok(None),
	}
}

fn parse_default<T: FromStr>(env: &str, default: T) -> anyhow::Result<T>
where
	<T as FromStr>::Err: ToString,
{
	parse(env).map(|v| v.unwrap_or(default))
}
