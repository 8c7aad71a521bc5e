use std::collections::HashMap;

/// Substrings that always deny a name, regardless of whitelist configuration.
pub const DEFAULT_BLACKLIST: &[&str] = &[
	"MAGIC_GATEWAY_API_KEY",
	"JWT_SECRET",
	"SECRET",
	"PASSWORD",
	"PRIVATE_KEY",
	"CREDENTIAL",
];

pub const BASE_URL_SUFFIX: &str = "_API_BASE_URL";
pub const API_KEY_SUFFIX: &str = "_API_KEY";

/// Read-only snapshot of the process environment, taken once at startup.
///
/// Names are classified by two predicates computed from configuration:
/// *blacklisted* (case-insensitive substring match) and *whitelisted*
/// (prefix match). A name is externally visible iff it is whitelisted and
/// not blacklisted; only visible names may be referenced by clients as
/// path selectors, and values are never emitted anywhere except as the
/// masked form.
#[derive(Debug, Clone)]
pub struct SecretCatalog {
	vars: HashMap<String, String>,
	// Upper-cased deny substrings.
	blacklist: Vec<String>,
	whitelist_prefixes: Vec<String>,
}

impl SecretCatalog {
	pub fn new(
		vars: HashMap<String, String>,
		blacklist: Vec<String>,
		whitelist_prefixes: Vec<String>,
	) -> Self {
		let blacklist = blacklist
			.into_iter()
			.map(|b| b.trim().to_uppercase())
			.filter(|b| !b.is_empty())
			.collect();
		let whitelist_prefixes = whitelist_prefixes
			.into_iter()
			.map(|p| p.trim().trim_matches(['"', '\'']).to_string())
			.filter(|p| !p.is_empty())
			.collect();
		SecretCatalog {
			vars,
			blacklist,
			whitelist_prefixes,
		}
	}

	/// Snapshot the full process environment.
	pub fn from_env(blacklist: Vec<String>, whitelist_prefixes: Vec<String>) -> Self {
		Self::new(std::env::vars().collect(), blacklist, whitelist_prefixes)
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.vars.get(name).map(String::as_str)
	}

	pub fn contains(&self, name: &str) -> bool {
		self.vars.contains_key(name)
	}

	pub fn len(&self) -> usize {
		self.vars.len()
	}

	pub fn is_empty(&self) -> bool {
		self.vars.is_empty()
	}

	/// Whether clients may reference this name symbolically.
	pub fn is_visible(&self, name: &str) -> bool {
		let upper = name.to_uppercase();
		if self.blacklist.iter().any(|b| upper.contains(b)) {
			return false;
		}
		// No whitelist means nothing is exposed.
		self
			.whitelist_prefixes
			.iter()
			.any(|p| name.starts_with(p.as_str()))
	}

	/// Names of all externally visible entries, sorted for stable output.
	pub fn visible_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self
			.vars
			.keys()
			.filter(|k| self.is_visible(k))
			.cloned()
			.collect();
		names.sort();
		names
	}

	/// For a `<PREFIX>_API_BASE_URL` name, return the paired
	/// `<PREFIX>_API_KEY` value when it exists.
	pub fn paired_api_key(&self, base_url_name: &str) -> Option<&str> {
		let prefix = base_url_name.strip_suffix(BASE_URL_SUFFIX)?;
		self.get(&format!("{prefix}{API_KEY_SUFFIX}"))
	}
}

/// Mask a sensitive value for logging: first four and last four characters,
/// or `***` when too short to mask meaningfully.
pub fn mask(s: &str) -> String {
	let chars: Vec<char> = s.chars().collect();
	if chars.len() <= 8 {
		return "***".to_string();
	}
	let head: String = chars[..4].iter().collect();
	let tail: String = chars[chars.len() - 4..].iter().collect();
	format!("{head}***{tail}")
}
