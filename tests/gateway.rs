use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use magic_gateway::app::{App, router};
use magic_gateway::config::{Config, parse_special_api_keys};
use magic_gateway::secrets::{DEFAULT_BLACKLIST, SecretCatalog};
use secrecy::SecretString;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{body_json, header as h, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GATEWAY_KEY: &str = "s3cret-gateway-key";

struct TestGateway {
	app: Arc<App>,
}

impl TestGateway {
	fn new(vars: Vec<(String, String)>, prefixes: &[&str], rules: &str, special: &str) -> Self {
		let cfg = Config {
			port: 0,
			debug: false,
			version: "1.0.0".to_string(),
			gateway_key: SecretString::from(GATEWAY_KEY),
			env_blacklist: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
			env_whitelist_prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
			allowed_target_urls: rules.to_string(),
			// Local mock upstreams live on loopback, which the private-range
			// deny would otherwise reject.
			allowed_target_ips: "127.0.0.1".to_string(),
			special_api_keys: parse_special_api_keys(special),
			apm_endpoint: "apmplus-cn-beijing.ivolces.com:4317".to_string(),
			data_signing_key: Some(vec![7u8; 32]),
		};
		let mut env: HashMap<String, String> = vars.into_iter().collect();
		env.insert("MAGIC_GATEWAY_API_KEY".to_string(), GATEWAY_KEY.to_string());
		let catalog = SecretCatalog::new(
			env,
			cfg.env_blacklist.clone(),
			cfg.env_whitelist_prefixes.clone(),
		);
		TestGateway {
			app: App::new(cfg, catalog).expect("app builds"),
		}
	}

	fn token(&self) -> String {
		self.app.tokens.issue("alice", "magic-1", "org-7").unwrap()
	}

	async fn send(&self, req: Request<Body>) -> (StatusCode, Bytes) {
		let resp = router(self.app.clone()).oneshot(req).await.unwrap();
		let status = resp.status();
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		(status, body)
	}

	async fn send_json(&self, req: Request<Body>) -> (StatusCode, Value) {
		let (status, body) = self.send(req).await;
		let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
		(status, value)
	}
}

fn bearer(token: &str) -> String {
	format!("Bearer {token}")
}

#[tokio::test]
async fn auth_round_trip_and_status_counter() {
	let gw = TestGateway::new(vec![], &[], "", "");

	let req = Request::post("/auth")
		.header("X-Gateway-API-Key", GATEWAY_KEY)
		.header("X-USER-ID", "alice")
		.body(Body::empty())
		.unwrap();
	let (status, body) = gw.send_json(req).await;
	assert_eq!(status, StatusCode::OK);
	let token = body["token"].as_str().unwrap().to_string();
	assert_eq!(body["header"], "Magic-Authorization");
	assert!(body["example"].as_str().unwrap().contains(&token));

	// The verified claims round-trip.
	let claims = gw.app.tokens.verify(&token).unwrap();
	assert_eq!(claims.container_id, "alice");

	let req = Request::get("/status")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, body) = gw.send_json(req).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["status"], "ok");
	assert_eq!(body["current_token_version"], json!(1));
	assert_eq!(body["jwt_key_id"], gw.app.tokens.key_id());
}

#[tokio::test]
async fn auth_rejects_a_wrong_gateway_key() {
	let gw = TestGateway::new(vec![], &[], "", "");
	let req = Request::post("/auth")
		.header("X-Gateway-API-Key", "wrong")
		.body(Body::empty())
		.unwrap();
	let (status, _) = gw.send(req).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);

	let req = Request::post("/auth").body(Body::empty()).unwrap();
	let (status, _) = gw.send(req).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_routes_require_a_token() {
	let gw = TestGateway::new(vec![], &[], "", "");
	for uri in ["/services", "/env", "/api/user/info", "/anything/else"] {
		let req = Request::get(uri).body(Body::empty()).unwrap();
		let (status, _) = gw.send(req).await;
		assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
	}

	// Garbage tokens fail the same way.
	let req = Request::get("/services")
		.header(header::AUTHORIZATION, "Bearer nonsense")
		.body(Body::empty())
		.unwrap();
	let (status, _) = gw.send(req).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn revoke_all_invalidates_outstanding_tokens() {
	let gw = TestGateway::new(vec![], &[], "", "");
	let token = gw.token();

	let req = Request::get("/services")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, _) = gw.send(req).await;
	assert_eq!(status, StatusCode::OK);

	// Revocation compares created-at strictly against the epoch, so step
	// past the current second first.
	tokio::time::sleep(Duration::from_millis(1100)).await;
	let req = Request::post("/revoke-all")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, body) = gw.send_json(req).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["success"], json!(true));

	let req = Request::get("/services")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, _) = gw.send(req).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn single_revoke_is_an_acknowledged_noop() {
	let gw = TestGateway::new(vec![], &[], "", "");
	let token = gw.token();
	let req = Request::post("/revoke")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::from(r#"{"token_id":"abc"}"#))
		.unwrap();
	let (status, body) = gw.send_json(req).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["success"], json!(true));

	// The token still works afterwards.
	let req = Request::get("/env")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, _) = gw.send(req).await;
	assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn reserved_paths_are_never_proxied() {
	let gw = TestGateway::new(vec![], &[], "prefix:http://127.0.0.1", "");
	let token = gw.token();
	for uri in ["/auth/sub/path", "/status/deeper", "/revoke-all/x", "/env/leak"] {
		let req = Request::get(uri)
			.header("Magic-Authorization", bearer(&token))
			.body(Body::empty())
			.unwrap();
		let (status, _) = gw.send(req).await;
		assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
	}
}

#[tokio::test]
async fn ssrf_target_literal_ip_is_a_404() {
	let gw = TestGateway::new(vec![], &[], "prefix:http://", "");
	let token = gw.token();
	let req = Request::get("/anything?target=http://169.254.169.254/latest/meta-data")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, body) = gw.send(req).await;
	assert_eq!(status, StatusCode::NOT_FOUND);
	// The body never explains why.
	assert_eq!(body.as_ref(), b"Not Found");
}

#[tokio::test]
async fn hidden_and_unknown_env_selectors_are_indistinguishable() {
	let gw = TestGateway::new(
		vec![("VISIBLE_API_BASE_URL".into(), "https://x.example".into())],
		&["VISIBLE_"],
		"",
		"",
	);
	let token = gw.token();

	let mut bodies = Vec::new();
	for uri in ["/MAGIC_GATEWAY_API_KEY/x", "/TOTALLY_UNKNOWN/x"] {
		let req = Request::get(uri)
			.header("Magic-Authorization", bearer(&token))
			.body(Body::empty())
			.unwrap();
		let (status, body) = gw.send(req).await;
		assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
		bodies.push(body);
	}
	assert_eq!(bodies[0], bodies[1]);
}

#[tokio::test]
async fn symbolic_path_proxies_with_attached_key() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.and(h("authorization", "Bearer sk-test"))
		.and(h("x-user-id", "alice"))
		.and(body_json(json!({"model": "x"})))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cmpl-1"})))
		.expect(1)
		.mount(&upstream)
		.await;

	let gw = TestGateway::new(
		vec![
			(
				"OPENAI_API_BASE_URL".into(),
				format!("{}/v1", upstream.uri()),
			),
			("OPENAI_API_KEY".into(), "sk-test".into()),
		],
		&["OPENAI_"],
		"prefix:http://127.0.0.1",
		"",
	);
	let token = gw.token();

	let req = Request::post("/OPENAI_API_BASE_URL/chat/completions")
		.header("Magic-Authorization", bearer(&token))
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(r#"{"model":"x"}"#))
		.unwrap();
	let (status, body) = gw.send_json(req).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["id"], "cmpl-1");
}

#[tokio::test]
async fn client_authorization_wins_over_attached_key() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/v1/models"))
		.and(h("authorization", "Bearer client-supplied"))
		.respond_with(ResponseTemplate::new(200).set_body_string("ok"))
		.expect(1)
		.mount(&upstream)
		.await;

	let gw = TestGateway::new(
		vec![
			(
				"OPENAI_API_BASE_URL".into(),
				format!("{}/v1", upstream.uri()),
			),
			("OPENAI_API_KEY".into(), "sk-test".into()),
		],
		&["OPENAI_"],
		"prefix:http://127.0.0.1",
		"",
	);
	let token = gw.token();

	// The gateway token travels in Magic-Authorization; the Authorization
	// header is the client's own upstream credential.
	let req = Request::get("/OPENAI_API_BASE_URL/models")
		.header("Magic-Authorization", bearer(&token))
		.header(header::AUTHORIZATION, "Bearer client-supplied")
		.body(Body::empty())
		.unwrap();
	let (status, _) = gw.send(req).await;
	assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn special_api_body_keys_are_bound() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/generate"))
		.and(body_json(json!({"api_key": "img-secret", "prompt": "cat"})))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
		.expect(1)
		.mount(&upstream)
		.await;

	let gw = TestGateway::new(
		vec![
			("IMG_API_BASE_URL".into(), upstream.uri()),
			("IMG_ACCESS_KEY".into(), "img-secret".into()),
		],
		&["IMG_"],
		"prefix:http://127.0.0.1",
		"IMG_API_BASE_URL:IMG_ACCESS_KEY",
	);
	let token = gw.token();

	let req = Request::post("/IMG_API_BASE_URL/generate")
		.header("Magic-Authorization", bearer(&token))
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(r#"{"api_key":"","prompt":"cat"}"#))
		.unwrap();
	let (status, body) = gw.send_json(req).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["ok"], json!(true));
}

#[tokio::test]
async fn redirects_to_internal_addresses_are_blocked() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/hop"))
		.respond_with(
			ResponseTemplate::new(302).insert_header("location", "http://169.254.169.254/steal"),
		)
		.mount(&upstream)
		.await;

	let gw = TestGateway::new(vec![], &[], "prefix:http://127.0.0.1", "");
	let token = gw.token();
	let req = Request::get(format!("/hop?target={}", urlencode(&upstream.uri())).as_str())
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, _) = gw.send(req).await;
	assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn streaming_content_passes_through() {
	let upstream = MockServer::start().await;
	let sse_body = "data: one\n\ndata: two\n\ndata: [DONE]\n\n";
	Mock::given(method("GET"))
		.and(path("/events"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "text/event-stream")
				.set_body_string(sse_body),
		)
		.mount(&upstream)
		.await;

	let gw = TestGateway::new(vec![], &[], "prefix:http://127.0.0.1", "");
	let token = gw.token();
	let req = Request::get(format!("/events?target={}", urlencode(&upstream.uri())).as_str())
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let resp = router(gw.app.clone())
		.oneshot(req)
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(
		resp.headers().get(header::CONTENT_TYPE).unwrap(),
		"text/event-stream"
	);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(body.as_ref(), sse_body.as_bytes());
}

#[tokio::test]
async fn oversized_request_bodies_are_rejected() {
	let gw = TestGateway::new(vec![], &[], "prefix:http://127.0.0.1", "");
	let token = gw.token();
	let req = Request::post("/whatever?target=http://127.0.0.1:1/")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::from(vec![0u8; 10 * 1024 * 1024 + 1]))
		.unwrap();
	let (status, _) = gw.send(req).await;
	assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn env_listing_exposes_names_never_values() {
	let gw = TestGateway::new(
		vec![
			("OPENAI_API_BASE_URL".into(), "https://api.openai.com/v1".into()),
			("OPENAI_API_KEY".into(), "sk-super-secret".into()),
		],
		&["OPENAI_"],
		"",
		"",
	);
	let token = gw.token();

	let req = Request::get("/env")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, body) = gw.send(req).await;
	assert_eq!(status, StatusCode::OK);
	let text = String::from_utf8_lossy(&body).to_string();
	assert!(text.contains("OPENAI_API_BASE_URL"));
	assert!(text.contains("OPENAI_API_KEY"));
	assert!(!text.contains("sk-super-secret"));
	assert!(!text.contains(GATEWAY_KEY));

	let req = Request::get("/env?vars=OPENAI_API_KEY,NOPE")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, body) = gw.send_json(req).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["available_status"]["OPENAI_API_KEY"], json!(true));
	assert_eq!(body["available_status"]["NOPE"], json!(false));
}

#[tokio::test]
async fn services_expose_domains_only() {
	let gw = TestGateway::new(
		vec![
			("OPENAI_API_BASE_URL".into(), "https://api.openai.com/v1".into()),
			("OPENAI_API_KEY".into(), "sk-super-secret".into()),
			("OPENAI_MODEL".into(), "gpt-4o".into()),
		],
		&["OPENAI_"],
		"",
		"",
	);
	let token = gw.token();
	let req = Request::get("/services")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, body) = gw.send_json(req).await;
	assert_eq!(status, StatusCode::OK);
	let services = body["available_services"].as_array().unwrap();
	assert_eq!(services.len(), 1);
	assert_eq!(services[0]["name"], "OPENAI");
	assert_eq!(services[0]["base_url"], "api.openai.com");
	assert_eq!(services[0]["default_model"], "gpt-4o");
	assert!(!serde_json::to_string(&body).unwrap().contains("sk-super-secret"));
}

#[tokio::test]
async fn sign_and_user_info_endpoints() {
	let gw = TestGateway::new(vec![], &[], "", "");
	let token = gw.token();

	let req = Request::post("/api/ai-generated/sign")
		.header("Magic-Authorization", bearer(&token))
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(r#"{"data":"hello"}"#))
		.unwrap();
	let (status, body) = gw.send_json(req).await;
	assert_eq!(status, StatusCode::OK);
	let signature = body["signature"].as_str().unwrap();
	assert_eq!(signature.len(), 24);

	// Empty data is a client error.
	let req = Request::post("/api/ai-generated/sign")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::from(r#"{"data":""}"#))
		.unwrap();
	let (status, _) = gw.send(req).await;
	assert_eq!(status, StatusCode::BAD_REQUEST);

	let req = Request::get("/api/user/info")
		.header("Magic-Authorization", bearer(&token))
		.body(Body::empty())
		.unwrap();
	let (status, body) = gw.send_json(req).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["user_id"], "magic-1");
	assert_eq!(body["organization_code"], "org-7");
}

fn urlencode(s: &str) -> String {
	form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
