use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};
use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

/// Ports that are never reachable through the gateway, regardless of the
/// allowlist. These cover common internal/admin services.
const BLOCKED_PORTS: &[u16] = &[22, 23, 25, 3306, 5432, 6379, 27017, 9200];

static PRIVATE_RANGES: Lazy<Vec<IpNet>> = Lazy::new(|| {
	[
		"10.0.0.0/8",
		"172.16.0.0/12",
		"192.168.0.0/16",
		"169.254.0.0/16",
		"127.0.0.0/8",
		"::1/128",
		"fc00::/7",
		"fe80::/10",
	]
	.iter()
	.map(|c| c.parse().expect("static CIDR"))
	.collect()
});

/// One entry of the target-URL allowlist.
#[derive(Debug, Clone)]
pub struct AllowRule {
	pub matcher: RuleMatcher,
	pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RuleMatcher {
	/// Full-URL equality, tolerating one trailing slash on either side.
	Exact(String),
	/// Hostname equality or any subdomain.
	Domain(String),
	/// Full-URL prefix.
	Prefix(String),
	/// Full-URL regular expression.
	Regex(Regex),
}

impl fmt::Display for AllowRule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.matcher {
			RuleMatcher::Exact(p) => write!(f, "exact:{p}")?,
			RuleMatcher::Domain(p) => write!(f, "domain:{p}")?,
			RuleMatcher::Prefix(p) => write!(f, "prefix:{p}")?,
			RuleMatcher::Regex(p) => write!(f, "regex:{}", p.as_str())?,
		}
		if let Some(desc) = &self.description {
			write!(f, " ({desc})")?;
		}
		Ok(())
	}
}

impl AllowRule {
	fn matches(&self, raw: &str, url: &Url) -> bool {
		match &self.matcher {
			RuleMatcher::Exact(pattern) => {
				let pattern = pattern.strip_suffix('/').unwrap_or(pattern);
				let target = raw.strip_suffix('/').unwrap_or(raw);
				pattern == target
			},
			RuleMatcher::Domain(pattern) => {
				let pattern = pattern.strip_prefix('.').unwrap_or(pattern);
				match url.host_str() {
					Some(host) => host == pattern || host.ends_with(&format!(".{pattern}")),
					None => false,
				}
			},
			RuleMatcher::Prefix(pattern) => raw.starts_with(pattern.as_str()),
			RuleMatcher::Regex(re) => re.is_match(raw),
		}
	}
}

/// Parse the `|`-separated rule list, `type:pattern[@description]` per rule.
/// Malformed entries are skipped with a warning rather than failing startup.
pub fn parse_rules(raw: &str) -> Vec<AllowRule> {
	let mut rules = Vec::new();
	for (i, entry) in raw.split('|').enumerate() {
		let entry = entry.trim();
		if entry.is_empty() {
			continue;
		}
		let Some((kind, rest)) = entry.split_once(':') else {
			warn!(rule = i + 1, "allowlist rule has no type separator: {entry}");
			continue;
		};
		let (pattern, description) = match rest.split_once('@') {
			Some((p, d)) if !p.is_empty() => (p.trim(), Some(d.trim().to_string())),
			_ => (rest.trim(), None),
		};
		let matcher = match kind.trim() {
			"exact" => RuleMatcher::Exact(pattern.to_string()),
			"domain" => RuleMatcher::Domain(pattern.to_string()),
			"prefix" => RuleMatcher::Prefix(pattern.to_string()),
			"regex" => match Regex::new(pattern) {
				Ok(re) => RuleMatcher::Regex(re),
				Err(e) => {
					warn!(rule = i + 1, "allowlist regex failed to compile: {e}");
					continue;
				},
			},
			other => {
				warn!(rule = i + 1, "unknown allowlist rule type {other:?}");
				continue;
			},
		};
		rules.push(AllowRule {
			matcher,
			description,
		});
	}
	rules
}

/// Parse the allowed-internal CIDR list. Accepts `,`, `;`, whitespace and
/// newlines as separators; bare addresses are promoted to host networks;
/// duplicates collapse.
pub fn parse_internal_cidrs(raw: &str) -> Vec<IpNet> {
	let mut seen = HashSet::new();
	let mut nets = Vec::new();
	for entry in raw.split([',', ';', '\n', '\r', ' ']) {
		let entry = entry.trim();
		if entry.is_empty() {
			continue;
		}
		let net = if entry.contains('/') {
			match entry.parse::<IpNet>() {
				Ok(n) => n,
				Err(e) => {
					warn!("invalid allowed internal CIDR {entry:?}: {e}");
					continue;
				},
			}
		} else {
			match entry.parse::<IpAddr>() {
				Ok(ip) => IpNet::from(ip),
				Err(e) => {
					warn!("invalid allowed internal IP {entry:?}: {e}");
					continue;
				},
			}
		};
		if seen.insert(net) {
			nets.push(net);
		}
	}
	nets
}

/// Fold IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to their IPv4 form,
/// the same folding Go's `To4()` applies before its loopback/range checks.
/// `to_ipv4_mapped` is deliberate: `to_ipv4` would also fold `::1` into
/// `0.0.0.1` and lose the loopback classification.
fn canonical_ip(ip: IpAddr) -> IpAddr {
	match ip {
		IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
		IpAddr::V4(_) => ip,
	}
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AdmitError {
	#[error("target URL is malformed: {0}")]
	Malformed(String),
	#[error("unsupported scheme {0:?} (only http/https)")]
	BadScheme(String),
	#[error("target URL has no hostname")]
	NoHost,
	#[error("target URL carries userinfo")]
	Suspicious,
	#[error("port {0} is blocked")]
	BlockedPort(u16),
	#[error("literal IP {0} is internal")]
	PrivateIp(IpAddr),
	#[error("host {0} resolves to internal IP {1}")]
	DnsRebind(String, IpAddr),
	#[error("no allowlist is configured")]
	NoAllowlist,
	#[error("target URL matches no allowlist rule")]
	NotAllowed,
}

/// DNS resolution used by the guard. Re-queried on every admission so a
/// redirect hop or a changed record is always re-checked.
pub enum Resolver {
	System(TokioResolver),
	#[cfg(test)]
	Fixed(std::collections::HashMap<String, Vec<IpAddr>>),
}

impl fmt::Debug for Resolver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Resolver").finish()
	}
}

impl Resolver {
	pub fn system() -> anyhow::Result<Self> {
		let (config, opts) = hickory_resolver::system_conf::read_system_conf()?;
		let mut builder = hickory_resolver::Resolver::builder_with_config(
			config,
			TokioConnectionProvider::default(),
		);
		*builder.options_mut() = opts;
		Ok(Resolver::System(builder.build()))
	}

	async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
		match self {
			Resolver::System(r) => Ok(r.lookup_ip(host).await?.iter().collect()),
			#[cfg(test)]
			Resolver::Fixed(map) => Ok(map.get(host).cloned().unwrap_or_default()),
		}
	}
}

/// The URL admission guard: scheme, port, host, literal-IP and resolved-IP
/// checks, then the rule-based allowlist. Every URL leaving the gateway
/// (including each redirect hop) passes through `admit`.
#[derive(Debug)]
pub struct UrlGuard {
	rules: Vec<AllowRule>,
	allow_internal: Vec<IpNet>,
	resolver: Resolver,
}

impl UrlGuard {
	pub fn new(rules: Vec<AllowRule>, allow_internal: Vec<IpNet>) -> anyhow::Result<Self> {
		Ok(UrlGuard {
			rules,
			allow_internal,
			resolver: Resolver::system()?,
		})
	}

	#[cfg(test)]
	pub fn with_resolver(
		rules: Vec<AllowRule>,
		allow_internal: Vec<IpNet>,
		resolver: Resolver,
	) -> Self {
		UrlGuard {
			rules,
			allow_internal,
			resolver,
		}
	}

	/// An address is internal when it sits in a built-in private range or is
	/// loopback, unless an allowed-internal CIDR covers it. IPv4-mapped IPv6
	/// addresses are folded to their IPv4 form first so `::ffff:127.0.0.1`
	/// cannot slip past the IPv4 range checks.
	fn is_internal(&self, ip: IpAddr) -> bool {
		let ip = canonical_ip(ip);
		if self.allow_internal.iter().any(|net| net.contains(&ip)) {
			return false;
		}
		ip.is_loopback() || PRIVATE_RANGES.iter().any(|net| net.contains(&ip))
	}

	pub async fn admit(&self, raw: &str) -> Result<(), AdmitError> {
		// The no-target shortcut: resolution falls back to other strategies.
		if raw.is_empty() {
			return Ok(());
		}

		let url = Url::parse(raw).map_err(|e| AdmitError::Malformed(e.to_string()))?;

		match url.scheme() {
			"http" | "https" => {},
			other => return Err(AdmitError::BadScheme(other.to_string())),
		}

		let host = url.host().ok_or(AdmitError::NoHost)?.to_owned();

		// The url parser absorbs `user@host` into userinfo, so the classic
		// hostname-confusion trick surfaces here instead.
		if !url.username().is_empty() || url.password().is_some() {
			return Err(AdmitError::Suspicious);
		}

		if let Some(port) = url.port() {
			if BLOCKED_PORTS.contains(&port) {
				return Err(AdmitError::BlockedPort(port));
			}
		}

		match host {
			url::Host::Ipv4(ip) => {
				let ip = IpAddr::V4(ip);
				if self.is_internal(ip) {
					return Err(AdmitError::PrivateIp(ip));
				}
			},
			url::Host::Ipv6(ip) => {
				let ip = IpAddr::V6(ip);
				if self.is_internal(ip) {
					return Err(AdmitError::PrivateIp(ip));
				}
			},
			url::Host::Domain(domain) => {
				// DNS is re-queried on every admission. A failed lookup is not
				// fatal: the connect will fail honestly later.
				match self.resolver.lookup(&domain).await {
					Ok(ips) => {
						for ip in ips {
							if self.is_internal(ip) {
								return Err(AdmitError::DnsRebind(domain.to_string(), ip));
							}
						}
					},
					Err(e) => {
						debug!(host = %domain, "DNS resolution failed during admission: {e}");
					},
				}
			},
		}

		if self.rules.is_empty() {
			return Err(AdmitError::NoAllowlist);
		}
		if self.rules.iter().any(|r| r.matches(raw, &url)) {
			debug!(target = %raw, "target URL matched allowlist");
			return Ok(());
		}
		Err(AdmitError::NotAllowed)
	}
}

#[cfg(test)]
#[path = "admission_tests.rs"]
mod tests;
