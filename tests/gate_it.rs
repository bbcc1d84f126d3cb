#![cfg(feature = "test")]

// crates.io
use serde_json::json;
use time::macros::datetime;
// self
use ephemeral_broker::{
	_preludet::*,
	gate::{GateRequest, RateLimitConfig, RateLimiter, RequestPolicy, SecurityGate},
};

fn gate() -> Arc<SecurityGate> {
	let (authority, _) = scripted_authority();

	Arc::new(SecurityGate::new(
		authority,
		Arc::new(RateLimiter::default()),
		RequestPolicy::allow_any_origin(),
	))
}

#[tokio::test]
async fn token_endpoint_returns_the_wire_shape() {
	let gate = gate();
	let now = datetime!(2026-01-01 00:00:00 UTC);
	let request = GateRequest::post(
		"/ephemeral-token",
		&json!({ "sessionId": "wire-session", "uses": 2, "expirationMinutes": 10 }),
	);
	let response = gate.handle_at(request, now).await;

	assert_eq!(response.status, 200);
	assert_eq!(response.body["token"], json!("scripted-token-1"));
	assert_eq!(response.body["expiresAt"], json!("2026-01-01T00:10:00Z"));
	assert_eq!(response.body["usesRemaining"], json!(2));
	assert_eq!(response.body["sessionId"], json!("wire-session"));
}

#[tokio::test]
async fn empty_bodies_fall_back_to_policy_defaults() {
	let gate = gate();
	let mut request = GateRequest::post("/ephemeral-token", &json!({}));

	request.body = Vec::new();

	let response = gate.handle_at(request, datetime!(2026-01-01 00:00:00 UTC)).await;

	assert_eq!(response.status, 200);
	assert_eq!(response.body["usesRemaining"], json!(1));
	assert!(
		response.body["sessionId"]
			.as_str()
			.expect("A generated session identifier should be present.")
			.starts_with("session-"),
	);
}

#[tokio::test]
async fn parameter_and_routing_faults_map_to_http_statuses() {
	let gate = gate();
	let now = datetime!(2026-01-01 00:00:00 UTC);
	let bad_uses =
		gate.handle_at(GateRequest::post("/ephemeral-token", &json!({ "uses": 9 })), now).await;

	assert_eq!(bad_uses.status, 400);

	let missing_session =
		gate.handle_at(GateRequest::post("/refresh-token", &json!({})), now).await;

	assert_eq!(missing_session.status, 400);
	assert_eq!(
		missing_session.body["error"],
		json!("Invalid request parameters: sessionId is required."),
	);

	let unknown = gate.handle_at(GateRequest::get("/no-such-path"), now).await;

	assert_eq!(unknown.status, 404);

	let wrong_method = gate.handle_at(GateRequest::get("/ephemeral-token"), now).await;

	assert_eq!(wrong_method.status, 405);
}

#[tokio::test]
async fn rate_limiting_blocks_with_advisory_headers() {
	let (authority, _) = scripted_authority();
	let gate = Arc::new(SecurityGate::new(
		authority,
		Arc::new(RateLimiter::new(RateLimitConfig {
			max_requests: 2,
			window: Duration::minutes(60),
		})),
		RequestPolicy::allow_any_origin(),
	));
	let now = datetime!(2026-01-01 00:00:00 UTC);

	for _ in 0..2 {
		let response = gate
			.handle_at(GateRequest::get("/session-status").with_query("sessionId=s-1"), now)
			.await;

		assert_ne!(response.status, 429);
	}

	let blocked = gate
		.handle_at(GateRequest::get("/session-status").with_query("sessionId=s-1"), now)
		.await;

	assert_eq!(blocked.status, 429);
	assert!(blocked.headers.iter().any(|(name, _)| *name == "Retry-After"));
	assert!(
		blocked
			.headers
			.iter()
			.any(|(name, value)| *name == "X-RateLimit-Limit" && value == "2"),
	);

	// A different client identity is not affected.
	let other = gate
		.handle_at(
			GateRequest::get("/session-status")
				.with_query("sessionId=s-1")
				.with_client("10.0.0.9", "other-agent"),
			now,
		)
		.await;

	assert_ne!(other.status, 429);
	assert_eq!(gate.metrics().rate_limited(), 1);
}

#[tokio::test]
async fn disallowed_origins_are_refused() {
	let (authority, _) = scripted_authority();
	let policy = RequestPolicy::new(["https://app.example"])
		.expect("Origin allow-list fixture should be valid.");
	let gate =
		Arc::new(SecurityGate::new(authority, Arc::new(RateLimiter::default()), policy));
	let now = datetime!(2026-01-01 00:00:00 UTC);
	let allowed = gate
		.handle_at(
			GateRequest::post("/ephemeral-token", &json!({})).with_origin("https://app.example"),
			now,
		)
		.await;

	assert_eq!(allowed.status, 200);

	let refused = gate
		.handle_at(
			GateRequest::post("/ephemeral-token", &json!({})).with_origin("https://evil.example"),
			now,
		)
		.await;

	assert_eq!(refused.status, 403);
}

#[tokio::test]
async fn session_lifecycle_round_trips_through_the_endpoints() {
	let gate = gate();
	let now = datetime!(2026-01-01 00:00:00 UTC);
	let issued = gate
		.handle_at(
			GateRequest::post("/ephemeral-token", &json!({ "sessionId": "lifecycle" })),
			now,
		)
		.await;

	assert_eq!(issued.status, 200);

	let refreshed = gate
		.handle_at(GateRequest::post("/refresh-token", &json!({ "sessionId": "lifecycle" })), now)
		.await;

	assert_eq!(refreshed.status, 200);
	assert_ne!(refreshed.body["token"], issued.body["token"]);

	let status = gate
		.handle_at(GateRequest::get("/session-status").with_query("sessionId=lifecycle"), now)
		.await;

	assert_eq!(status.status, 200);
	assert_eq!(status.body["isActive"], json!(true));
	assert_eq!(status.body["connectionStatus"], json!("active"));
	assert_eq!(status.body["totalTokens"], json!(2));
	assert_eq!(status.body["activeTokens"], json!(1));

	let revoked = gate
		.handle_at(GateRequest::post("/revoke-session", &json!({ "sessionId": "lifecycle" })), now)
		.await;

	assert_eq!(revoked.status, 200);
	assert_eq!(revoked.body["success"], json!(true));
	assert_eq!(revoked.body["revokedTokens"], json!(1));

	let status = gate
		.handle_at(GateRequest::get("/session-status").with_query("sessionId=lifecycle"), now)
		.await;

	assert_eq!(status.body["isActive"], json!(false));
	assert_eq!(status.body["connectionStatus"], json!("inactive"));
}

#[tokio::test]
async fn unknown_sessions_report_an_inactive_status() {
	let gate = gate();
	let response = gate
		.handle_at(
			GateRequest::get("/session-status").with_query("sessionId=never-seen"),
			datetime!(2026-01-01 00:00:00 UTC),
		)
		.await;

	assert_eq!(response.status, 200);
	assert_eq!(response.body["isActive"], json!(false));
	assert_eq!(response.body["totalTokens"], json!(0));
	assert_eq!(response.body["expiresAt"], serde_json::Value::Null);
}

#[tokio::test]
async fn every_request_lands_in_the_audit_trail() {
	let gate = gate();
	let now = datetime!(2026-01-01 00:00:00 UTC);

	gate.handle_at(GateRequest::post("/ephemeral-token", &json!({})), now).await;
	gate.handle_at(GateRequest::post("/ephemeral-token", &json!({ "uses": 9 })), now).await;

	let entries = gate.audit().recent(10);

	assert_eq!(entries.len(), 2);
	assert!(entries[0].ok);
	assert!(!entries[1].ok);
	assert!(
		entries[1]
			.error
			.as_deref()
			.expect("A failed request should carry its error message.")
			.contains("uses"),
	);

	let stats = gate.handle_at(GateRequest::get("/service-stats"), now).await;

	assert_eq!(stats.status, 200);
	assert_eq!(stats.body["security"]["accepted"], json!(3));
	assert_eq!(stats.body["security"]["rejected"], json!(1));
	assert_eq!(stats.body["credentials"]["issued"], json!(1));
}
