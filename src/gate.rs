//! Security gate wrapping the authority's HTTP-facing operations.
//!
//! Every inbound request passes the same pipeline: request-shape policy,
//! origin allow-list, rate-limit admission, dispatch to the wrapped authority
//! operation, and an audit entry regardless of outcome. The gate never lets a
//! fault escape as anything but a structured JSON response; full error detail
//! is only exposed when development mode is enabled.

pub mod audit;
pub mod policy;
pub mod rate_limit;

pub use audit::{AuditEntry, AuditLog};
pub use policy::RequestPolicy;
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};

// std
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use url::form_urlencoded;
// self
use crate::{
	_prelude::*,
	auth::{ClientKey, Credential, ScopeSet, SessionId},
	authority::{CredentialAuthority, IssueOptions},
	connector::{CredentialSource, SourceFuture},
};

/// Routes exposed by the gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GateRoute {
	IssueToken,
	RefreshToken,
	SessionStatus,
	RevokeSession,
	ServiceStats,
}
impl GateRoute {
	fn resolve(method: &str, path: &str) -> Result<Self, GateResponse> {
		let route = match path {
			"/ephemeral-token" => Self::IssueToken,
			"/refresh-token" => Self::RefreshToken,
			"/session-status" => Self::SessionStatus,
			"/revoke-session" => Self::RevokeSession,
			"/service-stats" => Self::ServiceStats,
			_ => return Err(GateResponse::error(404, format!("unknown path `{path}`"))),
		};

		if method.eq_ignore_ascii_case(route.method()) {
			Ok(route)
		} else {
			Err(GateResponse::error(
				405,
				format!("method {method} is not allowed for {path}"),
			))
		}
	}

	const fn method(self) -> &'static str {
		match self {
			Self::IssueToken | Self::RefreshToken | Self::RevokeSession => "POST",
			Self::SessionStatus | Self::ServiceStats => "GET",
		}
	}

	const fn has_body(self) -> bool {
		matches!(self, Self::IssueToken | Self::RefreshToken | Self::RevokeSession)
	}
}

/// Transport-agnostic description of one inbound request.
#[derive(Clone, Debug)]
pub struct GateRequest {
	/// HTTP method.
	pub method: String,
	/// Request path without the query string.
	pub path: String,
	/// Raw query string, if any.
	pub query: Option<String>,
	/// `Origin` header value, if present.
	pub origin: Option<String>,
	/// `Content-Type` header value, if present.
	pub content_type: Option<String>,
	/// Raw request body.
	pub body: Vec<u8>,
	/// Client network origin (remote address).
	pub remote_addr: String,
	/// Client signature material (e.g. user agent).
	pub client_signature: String,
}
impl GateRequest {
	/// Builds a JSON POST request description.
	pub fn post(path: impl Into<String>, body: &serde_json::Value) -> Self {
		Self {
			method: "POST".into(),
			path: path.into(),
			query: None,
			origin: None,
			content_type: Some("application/json".into()),
			body: body.to_string().into_bytes(),
			remote_addr: "127.0.0.1".into(),
			client_signature: String::new(),
		}
	}

	/// Builds a GET request description.
	pub fn get(path: impl Into<String>) -> Self {
		Self {
			method: "GET".into(),
			path: path.into(),
			query: None,
			origin: None,
			content_type: None,
			body: Vec::new(),
			remote_addr: "127.0.0.1".into(),
			client_signature: String::new(),
		}
	}

	/// Attaches a raw query string.
	pub fn with_query(mut self, query: impl Into<String>) -> Self {
		self.query = Some(query.into());

		self
	}

	/// Attaches an `Origin` header value.
	pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
		self.origin = Some(origin.into());

		self
	}

	/// Sets the client identity material used for rate limiting.
	pub fn with_client(
		mut self,
		remote_addr: impl Into<String>,
		signature: impl Into<String>,
	) -> Self {
		self.remote_addr = remote_addr.into();
		self.client_signature = signature.into();

		self
	}

	/// Derived rate-limit identity for this request.
	pub fn client_key(&self) -> ClientKey {
		ClientKey::derive(&self.remote_addr, &self.client_signature)
	}
}

/// Structured response produced by the gate.
#[derive(Clone, Debug)]
pub struct GateResponse {
	/// HTTP status code.
	pub status: u16,
	/// Response headers.
	pub headers: Vec<(&'static str, String)>,
	/// JSON body.
	pub body: serde_json::Value,
}
impl GateResponse {
	fn ok(body: serde_json::Value) -> Self {
		Self { status: 200, headers: Vec::new(), body }
	}

	fn error(status: u16, message: impl Into<String>) -> Self {
		Self { status, headers: Vec::new(), body: serde_json::json!({ "error": message.into() }) }
	}
}

/// Thread-safe counters for gate activity, surfaced via service stats.
#[derive(Debug, Default)]
pub struct GateMetrics {
	accepted: AtomicU64,
	rejected: AtomicU64,
	rate_limited: AtomicU64,
}
impl GateMetrics {
	/// Requests that passed policy and rate-limit admission.
	pub fn accepted(&self) -> u64 {
		self.accepted.load(Ordering::Relaxed)
	}

	/// Requests rejected by policy, origin, or parameter validation.
	pub fn rejected(&self) -> u64 {
		self.rejected.load(Ordering::Relaxed)
	}

	/// Requests refused by the rate limiter.
	pub fn rate_limited(&self) -> u64 {
		self.rate_limited.load(Ordering::Relaxed)
	}

	fn record_accepted(&self) {
		self.accepted.fetch_add(1, Ordering::Relaxed);
	}

	fn record_rejected(&self) {
		self.rejected.fetch_add(1, Ordering::Relaxed);
	}

	fn record_rate_limited(&self) {
		self.rate_limited.fetch_add(1, Ordering::Relaxed);
	}
}

/// Wraps a [`CredentialAuthority`] with validation, throttling, and auditing.
pub struct SecurityGate {
	authority: Arc<CredentialAuthority>,
	limiter: Arc<RateLimiter>,
	policy: RequestPolicy,
	audit: AuditLog,
	metrics: GateMetrics,
	expose_errors: bool,
}
impl SecurityGate {
	/// Creates a gate in front of the provided authority.
	pub fn new(
		authority: Arc<CredentialAuthority>,
		limiter: Arc<RateLimiter>,
		policy: RequestPolicy,
	) -> Self {
		Self {
			authority,
			limiter,
			policy,
			audit: AuditLog::default(),
			metrics: GateMetrics::default(),
			expose_errors: false,
		}
	}

	/// Enables detailed error bodies (development mode).
	pub fn with_exposed_errors(mut self) -> Self {
		self.expose_errors = true;

		self
	}

	/// The wrapped authority.
	pub fn authority(&self) -> &Arc<CredentialAuthority> {
		&self.authority
	}

	/// The shared rate limiter.
	pub fn limiter(&self) -> &Arc<RateLimiter> {
		&self.limiter
	}

	/// The bounded audit trail.
	pub fn audit(&self) -> &AuditLog {
		&self.audit
	}

	/// Gate activity counters.
	pub fn metrics(&self) -> &GateMetrics {
		&self.metrics
	}

	/// Handles one request end to end, producing a structured JSON response.
	pub async fn handle(&self, request: GateRequest) -> GateResponse {
		self.handle_at(request, OffsetDateTime::now_utc()).await
	}

	/// Clock-injected variant of [`handle`](Self::handle).
	pub async fn handle_at(&self, request: GateRequest, now: OffsetDateTime) -> GateResponse {
		let started = std::time::Instant::now();
		let client = request.client_key();
		let response = match self.admit_and_dispatch(&request, &client, now).await {
			Ok(response) => response,
			Err(e) => self.error_response(&e),
		};

		self.audit.record(AuditEntry {
			at: now,
			client,
			path: request.path.clone(),
			ok: response.status < 400,
			error: (response.status >= 400)
				.then(|| response.body["error"].as_str().unwrap_or("unknown").to_owned()),
			duration_ms: started.elapsed().as_millis() as u64,
		});

		response
	}

	async fn admit_and_dispatch(
		&self,
		request: &GateRequest,
		client: &ClientKey,
		now: OffsetDateTime,
	) -> Result<GateResponse> {
		let route = match GateRoute::resolve(&request.method, &request.path) {
			Ok(route) => route,
			Err(response) => {
				self.metrics.record_rejected();

				return Ok(response);
			},
		};

		if route.has_body() {
			self.policy.check_content_type(request.content_type.as_deref())?;
			self.policy.check_body_size(request.body.len())?;
		}

		self.policy.check_origin(request.origin.as_deref())?;

		let decision = self.limiter.check_at(client, now);

		if !decision.allowed {
			self.metrics.record_rate_limited();

			return Ok(Self::rate_limited_response(&decision, self.limiter_max()));
		}

		self.metrics.record_accepted();

		match route {
			GateRoute::IssueToken => self.dispatch_issue(request, now).await,
			GateRoute::RefreshToken => self.dispatch_refresh(request, now).await,
			GateRoute::SessionStatus => self.dispatch_status(request, now),
			GateRoute::RevokeSession => self.dispatch_revoke(request, now),
			GateRoute::ServiceStats => self.dispatch_stats(),
		}
	}

	async fn dispatch_issue(
		&self,
		request: &GateRequest,
		now: OffsetDateTime,
	) -> Result<GateResponse> {
		let body: IssueBody = parse_body(&request.body)?;
		let options = IssueOptions {
			session: body.session_id.map(parse_session).transpose()?,
			uses: body.uses,
			ttl_minutes: body.expiration_minutes,
			scope: body
				.scope
				.map(|scopes| {
					ScopeSet::new(scopes).map_err(|e| Error::InvalidParams {
						reason: format!("invalid scope: {e}"),
					})
				})
				.transpose()?,
		};
		let credential = self.authority.issue_at(options, now).await?;

		Ok(GateResponse::ok(token_body(&credential)))
	}

	async fn dispatch_refresh(
		&self,
		request: &GateRequest,
		now: OffsetDateTime,
	) -> Result<GateResponse> {
		let body: IssueBody = parse_body(&request.body)?;
		let session = body
			.session_id
			.ok_or_else(|| Error::InvalidParams { reason: "sessionId is required".into() })
			.and_then(parse_session)?;
		let options = IssueOptions {
			session: None,
			uses: body.uses,
			ttl_minutes: body.expiration_minutes,
			scope: None,
		};
		let credential = self.authority.rotate_at(&session, options, now).await?;

		Ok(GateResponse::ok(token_body(&credential)))
	}

	fn dispatch_status(&self, request: &GateRequest, now: OffsetDateTime) -> Result<GateResponse> {
		let session = request
			.query
			.as_deref()
			.and_then(|query| {
				form_urlencoded::parse(query.as_bytes())
					.find(|(key, _)| key == "sessionId")
					.map(|(_, value)| value.into_owned())
			})
			.ok_or_else(|| Error::InvalidParams { reason: "sessionId is required".into() })
			.and_then(parse_session)?;
		let status = self.authority.status_at(&session, now);
		let body = match status {
			Some(status) => {
				let token_valid = status.active_count > 0;

				serde_json::json!({
					"sessionId": session.as_ref(),
					"isActive": token_valid,
					"tokenValid": token_valid,
					"expiresAt": status.expires_at.map(iso8601),
					"usesRemaining": status.uses_remaining,
					"connectionStatus": if token_valid { "active" } else { "inactive" },
					"lastActivity": status.last_activity.map(iso8601),
					"totalTokens": status.total_issued,
					"activeTokens": status.active_count,
				})
			},
			None => serde_json::json!({
				"sessionId": session.as_ref(),
				"isActive": false,
				"tokenValid": false,
				"expiresAt": serde_json::Value::Null,
				"usesRemaining": serde_json::Value::Null,
				"connectionStatus": "inactive",
				"lastActivity": serde_json::Value::Null,
				"totalTokens": 0,
				"activeTokens": 0,
			}),
		};

		Ok(GateResponse::ok(body))
	}

	fn dispatch_revoke(&self, request: &GateRequest, now: OffsetDateTime) -> Result<GateResponse> {
		let body: IssueBody = parse_body(&request.body)?;
		let session = body
			.session_id
			.ok_or_else(|| Error::InvalidParams { reason: "sessionId is required".into() })
			.and_then(parse_session)?;
		let revoked = self.authority.revoke_at(&session, now);

		Ok(GateResponse::ok(serde_json::json!({
			"success": true,
			"sessionId": session.as_ref(),
			"revokedTokens": revoked,
		})))
	}

	fn dispatch_stats(&self) -> Result<GateResponse> {
		let credentials = serde_json::to_value(self.authority.stats()).unwrap_or_default();

		Ok(GateResponse::ok(serde_json::json!({
			"credentials": credentials,
			"security": {
				"accepted": self.metrics.accepted(),
				"rejected": self.metrics.rejected(),
				"rateLimited": self.metrics.rate_limited(),
				"auditEntries": self.audit.len(),
				"trackedClients": self.limiter.tracked(),
			},
		})))
	}

	fn rate_limited_response(decision: &RateDecision, limit: u32) -> GateResponse {
		let mut response = GateResponse::error(429, "Rate limit exceeded");

		response.body["retryAfter"] = serde_json::json!(decision.retry_after_seconds);
		response.headers = vec![
			("Retry-After", decision.retry_after_seconds.to_string()),
			("X-RateLimit-Limit", limit.to_string()),
			("X-RateLimit-Remaining", decision.remaining.to_string()),
			("X-RateLimit-Reset", decision.reset_at.unix_timestamp().to_string()),
		];

		response
	}

	fn limiter_max(&self) -> u32 {
		self.limiter.config().max_requests
	}

	fn error_response(&self, error: &Error) -> GateResponse {
		let status = match error {
			Error::InvalidParams { .. }
			| Error::SessionQuotaExceeded { .. }
			| Error::RequestRejected { .. }
			| Error::Credential(_) => 400,
			Error::OriginRejected { .. } => 403,
			Error::RateLimited { .. } => 429,
			_ => 500,
		};

		if status < 500 {
			self.metrics.record_rejected();

			return GateResponse::error(status, error.to_string());
		}

		if self.expose_errors {
			GateResponse::error(status, error.to_string())
		} else {
			GateResponse::error(status, "Internal server error")
		}
	}
}
impl Debug for SecurityGate {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SecurityGate")
			.field("policy", &self.policy)
			.field("expose_errors", &self.expose_errors)
			.finish()
	}
}

/// In-process [`CredentialSource`] that routes connector acquisitions through
/// the gate's rate limiter and audit trail.
#[derive(Clone)]
pub struct GateSource {
	gate: Arc<SecurityGate>,
	client: ClientKey,
}
impl GateSource {
	/// Creates a source attributed to the provided client identity.
	pub fn new(gate: Arc<SecurityGate>, client: ClientKey) -> Self {
		Self { gate, client }
	}

	async fn acquire(&self, session: &SessionId, rotate: bool) -> Result<Credential> {
		let now = OffsetDateTime::now_utc();
		let started = std::time::Instant::now();
		let decision = self.gate.limiter.check_at(&self.client, now);
		let label = if rotate { "internal:rotate" } else { "internal:issue" };
		let result = if decision.allowed {
			self.gate.metrics.record_accepted();

			if rotate {
				self.gate
					.authority
					.rotate_at(session, IssueOptions::default(), now)
					.await
			} else {
				self.gate
					.authority
					.issue_at(IssueOptions::for_session(session.clone()), now)
					.await
			}
		} else {
			self.gate.metrics.record_rate_limited();

			Err(Error::RateLimited { retry_after_seconds: decision.retry_after_seconds })
		};

		self.gate.audit.record(AuditEntry {
			at: now,
			client: self.client.clone(),
			path: label.into(),
			ok: result.is_ok(),
			error: result.as_ref().err().map(ToString::to_string),
			duration_ms: started.elapsed().as_millis() as u64,
		});

		result
	}
}
impl CredentialSource for GateSource {
	fn fetch<'a>(&'a self, session: &'a SessionId) -> SourceFuture<'a, Credential> {
		Box::pin(self.acquire(session, false))
	}

	fn refresh<'a>(&'a self, session: &'a SessionId) -> SourceFuture<'a, Credential> {
		Box::pin(self.acquire(session, true))
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct IssueBody {
	session_id: Option<String>,
	uses: Option<u32>,
	expiration_minutes: Option<i64>,
	scope: Option<Vec<String>>,
}

fn parse_body<T>(body: &[u8]) -> Result<T>
where
	T: Default + for<'de> Deserialize<'de>,
{
	if body.is_empty() {
		return Ok(T::default());
	}

	serde_json::from_slice(body)
		.map_err(|e| Error::InvalidParams { reason: format!("malformed JSON body: {e}") })
}

fn parse_session(raw: String) -> Result<SessionId> {
	SessionId::new(raw).map_err(|e| Error::InvalidParams { reason: e.to_string() })
}

fn token_body(credential: &Credential) -> serde_json::Value {
	serde_json::json!({
		"token": credential.value.expose(),
		"expiresAt": iso8601(credential.expires_at),
		"usesRemaining": credential.uses_remaining,
		"sessionId": credential.session.as_ref(),
		"scope": credential.scope.as_slice(),
	})
}

fn iso8601(instant: OffsetDateTime) -> String {
	instant
		.format(&time::format_description::well_known::Rfc3339)
		.unwrap_or_else(|_| instant.to_string())
}
