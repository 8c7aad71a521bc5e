use std::io::Read;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_client::LogsServiceClient;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;
use url::Url;

use crate::secrets::{SecretCatalog, mask};

/// Upstream hostnames containing this substring are observability traffic
/// the gateway must re-speak as OTLP-gRPC.
const APM_DOMAIN: &str = "apmplus-cn-beijing.volces.com";
const APPKEY_METADATA: &str = "x-byteapm-appkey";
const APPKEY_HEADER_PREFIX: &str = "X-ByteAPM-AppKey=";
const GRPC_DEADLINE: Duration = Duration::from_secs(30);

pub const APM_APPKEY_VAR: &str = "VOLCENGINE_APM_APPKEY";

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
	#[error("failed to decompress request body: {0}")]
	Decompress(std::io::Error),
	#[error("failed to parse {kind} request ({encoding}): {message}")]
	Parse {
		kind: SignalKind,
		encoding: &'static str,
		message: String,
	},
	#[error("failed to reach the collector: {0}")]
	Connect(tonic::transport::Error),
	#[error("collector export failed: {0}")]
	Export(tonic::Status),
	#[error("response serialization failed: {0}")]
	Serialize(serde_json::Error),
	#[error("invalid appkey metadata")]
	BadAppkey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
	Trace,
	Metrics,
	Logs,
}

impl std::fmt::Display for SignalKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SignalKind::Trace => write!(f, "trace"),
			SignalKind::Metrics => write!(f, "metrics"),
			SignalKind::Logs => write!(f, "logs"),
		}
	}
}

/// The OTLP-HTTP to OTLP-gRPC adaptor for the fixed observability upstream.
#[derive(Clone)]
pub struct OtlpBridge {
	endpoint: String,
	appkey: String,
}

impl std::fmt::Debug for OtlpBridge {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OtlpBridge")
			.field("endpoint", &self.endpoint)
			.field("appkey", &mask(&self.appkey))
			.finish()
	}
}

/// Does the resolved target point at the observability upstream?
pub fn is_apm_target(target_base: &str) -> bool {
	match Url::parse(target_base) {
		Ok(url) => url.host_str().is_some_and(|h| h.contains(APM_DOMAIN)),
		Err(_) => false,
	}
}

/// Isolate the appkey from an `OTEL_EXPORTER_OTLP_HEADERS`-style value:
/// the token after `X-ByteAPM-AppKey=` up to the first `,` or `;`.
fn appkey_from_otel_headers(headers: &str) -> Option<String> {
	let start = headers.find(APPKEY_HEADER_PREFIX)? + APPKEY_HEADER_PREFIX.len();
	let rest = &headers[start..];
	let end = rest.find([',', ';']).unwrap_or(rest.len());
	let key = rest[..end].trim();
	(!key.is_empty()).then(|| key.to_string())
}

impl OtlpBridge {
	/// Build the bridge from configuration. Without an appkey there is no
	/// bridge and APM traffic falls through to the plain forwarder.
	pub fn from_catalog(catalog: &SecretCatalog, endpoint: &str) -> Option<OtlpBridge> {
		let appkey = catalog
			.get(APM_APPKEY_VAR)
			.filter(|k| !k.is_empty())
			.map(str::to_string)
			.or_else(|| {
				catalog
					.get(crate::subst::OTEL_HEADERS_VAR)
					.and_then(appkey_from_otel_headers)
			})?;
		debug!(appkey = %mask(&appkey), "OTLP bridge enabled");
		Some(OtlpBridge {
			endpoint: endpoint.to_string(),
			appkey,
		})
	}

	/// Serve one bridged call: decompress, classify, parse, export over
	/// gRPC, and answer with the JSON envelope of the collector response.
	pub async fn handle(
		&self,
		headers: &HeaderMap,
		path: &str,
		body: Bytes,
	) -> Result<Response, BridgeError> {
		let body = decompress_if_needed(headers, body)?;
		let is_json = headers
			.get(CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|ct| ct.contains("application/json"));

		let mut kind = classify_path(path);
		// The default was picked blind; let the payload overrule it.
		if kind == SignalKind::Trace && !path.to_lowercase().contains("trace") {
			if let Some(sniffed) = sniff_kind(&body, is_json) {
				debug!(kind = %sniffed, "signal kind sniffed from payload");
				kind = sniffed;
			}
		}
		debug!(kind = %kind, "dispatching OTLP export");

		let channel = self.connect().await?;
		let json = match kind {
			SignalKind::Trace => {
				let request: ExportTraceServiceRequest = parse_body(&body, is_json, kind)?;
				let mut client = TraceServiceClient::new(channel);
				let resp = client
					.export(self.grpc_request(request)?)
					.await
					.map_err(BridgeError::Export)?;
				to_json(resp.into_inner())?
			},
			SignalKind::Metrics => {
				let request: ExportMetricsServiceRequest = parse_body(&body, is_json, kind)?;
				let mut client = MetricsServiceClient::new(channel);
				let resp = client
					.export(self.grpc_request(request)?)
					.await
					.map_err(BridgeError::Export)?;
				to_json(resp.into_inner())?
			},
			SignalKind::Logs => {
				let request: ExportLogsServiceRequest = parse_body(&body, is_json, kind)?;
				let mut client = LogsServiceClient::new(channel);
				let resp = client
					.export(self.grpc_request(request)?)
					.await
					.map_err(BridgeError::Export)?;
				to_json(resp.into_inner())?
			},
		};

		let mut response = Response::new(Body::from(json));
		response
			.headers_mut()
			.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
		Ok(response)
	}

	async fn connect(&self) -> Result<Channel, BridgeError> {
		// Plaintext transport; the collector endpoint is host:port.
		let uri = if self.endpoint.contains("://") {
			self.endpoint.clone()
		} else {
			format!("http://{}", self.endpoint)
		};
		Endpoint::from_shared(uri)
			.map_err(BridgeError::Connect)?
			.timeout(GRPC_DEADLINE)
			.connect_timeout(GRPC_DEADLINE)
			.connect()
			.await
			.map_err(BridgeError::Connect)
	}

	fn grpc_request<T>(&self, message: T) -> Result<tonic::Request<T>, BridgeError> {
		let mut request = tonic::Request::new(message);
		request.set_timeout(GRPC_DEADLINE);
		let value =
			MetadataValue::try_from(self.appkey.as_str()).map_err(|_| BridgeError::BadAppkey)?;
		request.metadata_mut().insert(APPKEY_METADATA, value);
		Ok(request)
	}
}

fn to_json<T: Serialize>(value: T) -> Result<Vec<u8>, BridgeError> {
	serde_json::to_vec(&value).map_err(BridgeError::Serialize)
}

/// Gunzip the body when `Content-Encoding: gzip` says so (failure is fatal),
/// or when the gzip magic bytes are present (failure keeps the raw bytes).
fn decompress_if_needed(headers: &HeaderMap, body: Bytes) -> Result<Bytes, BridgeError> {
	let declared_gzip = headers
		.get(http::header::CONTENT_ENCODING)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|enc| enc.eq_ignore_ascii_case("gzip"));

	if declared_gzip {
		return gunzip(&body).map(Bytes::from).map_err(BridgeError::Decompress);
	}
	if body.len() >= 2 && body[0] == 0x1f && body[1] == 0x8b {
		match gunzip(&body) {
			Ok(out) => return Ok(Bytes::from(out)),
			Err(e) => debug!("gzip sniff failed, keeping raw body: {e}"),
		}
	}
	Ok(body)
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
	let mut decoder = GzDecoder::new(data);
	let mut out = Vec::new();
	decoder.read_to_end(&mut out)?;
	Ok(out)
}

/// Pick the signal kind from the URL path alone; `trace` is the default.
fn classify_path(path: &str) -> SignalKind {
	let path = path.to_lowercase();
	if path.contains("/v1/traces") || path.contains("trace") {
		return SignalKind::Trace;
	}
	if path.contains("/v1/metrics") || path.contains("metric") {
		return SignalKind::Metrics;
	}
	if path.contains("/v1/logs") || path.contains("log") {
		return SignalKind::Logs;
	}
	SignalKind::Trace
}

fn parse_body<T>(body: &[u8], is_json: bool, kind: SignalKind) -> Result<T, BridgeError>
where
	T: Message + Default + DeserializeOwned,
{
	if is_json {
		serde_json::from_slice(body).map_err(|e| BridgeError::Parse {
			kind,
			encoding: "JSON",
			message: e.to_string(),
		})
	} else {
		T::decode(body).map_err(|e| BridgeError::Parse {
			kind,
			encoding: "protobuf",
			message: e.to_string(),
		})
	}
}

/// Try each export-request shape and keep the first that yields a non-empty
/// top-level resource list. Cross-parses decode cleanly but come up empty,
/// which is exactly what makes this sniff reliable.
fn sniff_kind(body: &[u8], is_json: bool) -> Option<SignalKind> {
	if body.is_empty() {
		return None;
	}
	if let Ok(req) = parse_body::<ExportMetricsServiceRequest>(body, is_json, SignalKind::Metrics) {
		if !req.resource_metrics.is_empty() {
			return Some(SignalKind::Metrics);
		}
	}
	if let Ok(req) = parse_body::<ExportTraceServiceRequest>(body, is_json, SignalKind::Trace) {
		if !req.resource_spans.is_empty() {
			return Some(SignalKind::Trace);
		}
	}
	if let Ok(req) = parse_body::<ExportLogsServiceRequest>(body, is_json, SignalKind::Logs) {
		if !req.resource_logs.is_empty() {
			return Some(SignalKind::Logs);
		}
	}
	None
}
