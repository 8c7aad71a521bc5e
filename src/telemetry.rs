use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Install the global tracing subscriber. `RUST_LOG` wins when set; otherwise
/// the gateway's debug flag picks the default filter.
pub fn init(debug: bool) {
	let default = if debug {
		"magic_gateway=debug,info"
	} else {
		"info"
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer())
		.init();
}

const MAX_LOGGED_LEN: usize = 200;

/// Sanitize untrusted input before logging: escape newlines so a client
/// cannot forge log lines, and clip to a bounded length.
pub fn sanitize(s: &str) -> String {
	let mut out = s.replace('\n', "\\n").replace('\r', "\\r");
	if out.len() > MAX_LOGGED_LEN {
		let mut cut = MAX_LOGGED_LEN;
		while !out.is_char_boundary(cut) {
			cut -= 1;
		}
		out.truncate(cut);
		out.push_str("...[truncated]");
	}
	out
}
