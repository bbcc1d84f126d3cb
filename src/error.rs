//! Broker-level error types shared across the authority, gate, store, and connector.

// self
use crate::_prelude::*;

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical broker error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Store(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem; fatal at startup, never per-request.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Temporary issuer failure; retry with backoff.
	#[error(transparent)]
	Issuer(#[from] IssuerError),
	/// Transport failure (DNS, TCP, TLS).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Credential-state fault for one specific credential.
	#[error(transparent)]
	Credential(#[from] CredentialFault),

	/// Caller supplied parameters outside the permitted ranges.
	#[error("Invalid request parameters: {reason}.")]
	InvalidParams {
		/// Description of the offending parameter.
		reason: String,
	},
	/// Session already holds the maximum number of valid credentials.
	#[error("Session `{session}` already holds {limit} valid credentials.")]
	SessionQuotaExceeded {
		/// Session that hit the quota.
		session: String,
		/// Configured per-session limit.
		limit: usize,
	},
	/// Client exceeded the request-rate budget.
	#[error("Rate limit exceeded; retry after {retry_after_seconds} seconds.")]
	RateLimited {
		/// Seconds the client should wait before retrying.
		retry_after_seconds: u64,
	},
	/// Request shape violates gate policy (method, content type, body size).
	#[error("Request rejected: {reason}.")]
	RequestRejected {
		/// Policy rule that failed.
		reason: String,
	},
	/// Request origin is not on the allow-list.
	#[error("Origin `{origin}` is not allowed.")]
	OriginRejected {
		/// The rejected origin value.
		origin: String,
	},

	/// No valid credential could be acquired for the session.
	#[error("Failed to acquire a session credential: {reason}.")]
	AuthFailed {
		/// Description of the acquisition failure.
		reason: String,
	},
	/// The external streaming session could not be opened and retries are spent.
	#[error("Failed to open the streaming session after {attempts} attempts.")]
	ConnectFailed {
		/// Attempts performed before giving up.
		attempts: u32,
	},
	/// Reconnection retries are exhausted; the session is terminally down.
	#[error("Reconnection abandoned after {attempts} attempts.")]
	ReconnectExhausted {
		/// Attempts performed before giving up.
		attempts: u32,
	},
}
impl Error {
	/// Returns `true` when the failure is worth retrying with backoff.
	///
	/// User errors (bad parameters, quota), policy rejections, and
	/// credential-state faults are final for the request that produced them;
	/// issuer, transport, store, and rate-limit failures are not.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			Self::Issuer(_) | Self::Transport(_) | Self::RateLimited { .. } | Self::Store(_)
		)
	}
}

/// Configuration and validation failures raised at construction time.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// Issuer endpoint URL cannot be parsed.
	#[error("Issuer endpoint URL is invalid.")]
	InvalidEndpoint {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// The issuer API key is missing or empty.
	#[error("Issuer API key must be provided.")]
	MissingApiKey,
	/// An origin on the allow-list cannot be parsed.
	#[error("Allow-listed origin `{origin}` is invalid.")]
	InvalidOrigin {
		/// The unparseable origin string.
		origin: String,
	},
	/// Identifier validation failed while building broker state.
	#[error("Invalid identifier.")]
	InvalidIdentifier(#[from] crate::auth::IdentifierError),
	/// Scope validation failed while building broker state.
	#[error("Requested scopes are invalid.")]
	InvalidScope(#[from] crate::auth::ScopeValidationError),
	/// Credential builder validation failed.
	#[error("Unable to build credential.")]
	CredentialBuild(#[from] crate::auth::CredentialBuilderError),
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}

/// Temporary issuer failures (safe to retry).
#[derive(Debug, ThisError)]
pub enum IssuerError {
	/// Issuing authority returned an unexpected but non-fatal response.
	#[error("Issuing authority returned an unexpected response: {message}.")]
	Unavailable {
		/// Issuer- or broker-supplied message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// Issuing authority responded with malformed JSON that could not be parsed.
	#[error("Issuing authority returned malformed JSON.")]
	ResponseParse {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::error::Error>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
}

/// Transport-level failures (network, IO).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the issuing authority.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the issuing authority.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}

/// Per-credential state faults raised by `consume`.
///
/// These are final for the credential that produced them; callers recover by
/// acquiring a fresh credential rather than failing the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum CredentialFault {
	/// No credential matches the derived id.
	#[error("Credential not found.")]
	NotFound,
	/// The credential's expiry instant has passed.
	#[error("Credential has expired.")]
	Expired,
	/// The credential's usage budget is spent.
	#[error("Credential usage is exhausted.")]
	UsesExhausted,
}
