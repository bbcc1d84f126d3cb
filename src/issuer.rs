//! Transport primitives for the external token-issuing authority.
//!
//! The module exposes [`TokenIssuer`] so the broker core stays agnostic of the
//! HTTP stack: the authority only ever sees `mint` calls that resolve to an
//! opaque token string. The reqwest-backed [`HttpTokenIssuer`] (feature
//! `reqwest`) implements the wire contract from the upstream service: a JSON
//! POST of `{uses, expireTime}` authenticated by an API key, answered by
//! `{name}` where `name` carries the bearer value.

// crates.io
#[cfg(feature = "reqwest")]
use reqwest::header::{HeaderMap, RETRY_AFTER};
#[cfg(feature = "reqwest")]
use time::format_description::well_known::Rfc2822;
// self
use crate::{_prelude::*, auth::TokenSecret, error::IssuerError};
#[cfg(feature = "reqwest")]
use crate::error::{ConfigError, TransportError};

/// Boxed future returned by [`TokenIssuer::mint`].
pub type IssuerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a + Send>>;

/// Contract implemented by token-issuing transports.
///
/// Implementations must be `Send + Sync` so a single issuer handle can back
/// every authority in the process.
pub trait TokenIssuer
where
	Self: Send + Sync,
{
	/// Requests one freshly minted token from the issuing authority.
	fn mint(&self, request: MintRequest) -> IssuerFuture<'_, MintedToken>;
}

/// Constraints forwarded to the issuing authority.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintRequest {
	/// Usage budget the minted token should carry.
	pub uses: u32,
	/// Absolute expiry instant for the minted token.
	#[serde(with = "time::serde::rfc3339")]
	pub expire_time: OffsetDateTime,
}

/// Successful mint response.
#[derive(Clone, Debug, Deserialize)]
pub struct MintedToken {
	/// Opaque bearer value assigned by the issuing authority.
	pub name: TokenSecret,
}

/// Reqwest-backed [`TokenIssuer`] speaking the upstream JSON contract.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug)]
pub struct HttpTokenIssuer {
	client: ReqwestClient,
	endpoint: Url,
	api_key: String,
}
#[cfg(feature = "reqwest")]
impl HttpTokenIssuer {
	/// Creates an issuer for the provided endpoint and API key.
	///
	/// An empty API key is a startup-time configuration fault, per the error
	/// taxonomy, so it is rejected here instead of on the first request.
	pub fn new(endpoint: impl AsRef<str>, api_key: impl Into<String>) -> Result<Self> {
		let api_key = api_key.into();

		if api_key.trim().is_empty() {
			return Err(ConfigError::MissingApiKey.into());
		}

		let endpoint = Url::parse(endpoint.as_ref())
			.map_err(|e| ConfigError::InvalidEndpoint { source: e })?;

		Ok(Self { client: ReqwestClient::new(), endpoint, api_key })
	}

	/// Replaces the HTTP client, e.g. to install custom TLS settings.
	pub fn with_client(mut self, client: ReqwestClient) -> Self {
		self.client = client;

		self
	}

	async fn mint_once(&self, request: MintRequest) -> Result<MintedToken> {
		let response = self
			.client
			.post(self.endpoint.clone())
			.header("x-api-key", &self.api_key)
			.json(&request)
			.send()
			.await
			.map_err(TransportError::from)?;
		let status = response.status();
		let retry_after = parse_retry_after(response.headers());
		let body = response.bytes().await.map_err(TransportError::from)?;

		if !status.is_success() {
			return Err(IssuerError::Unavailable {
				message: String::from_utf8_lossy(&body).into_owned(),
				status: Some(status.as_u16()),
				retry_after,
			}
			.into());
		}

		let mut deserializer = serde_json::Deserializer::from_slice(&body);

		serde_path_to_error::deserialize(&mut deserializer).map_err(|e| {
			IssuerError::ResponseParse { source: e, status: Some(status.as_u16()) }.into()
		})
	}
}
#[cfg(feature = "reqwest")]
impl TokenIssuer for HttpTokenIssuer {
	fn mint(&self, request: MintRequest) -> IssuerFuture<'_, MintedToken> {
		Box::pin(self.mint_once(request))
	}
}

#[cfg(feature = "reqwest")]
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
	let value = headers.get(RETRY_AFTER)?;
	let raw = value.to_str().ok()?.trim();

	if let Ok(secs) = raw.parse::<u64>() {
		return Some(Duration::seconds(secs as i64));
	}
	if let Ok(moment) = OffsetDateTime::parse(raw, &Rfc2822) {
		let delta = moment - OffsetDateTime::now_utc();

		if delta.is_positive() {
			return Some(delta);
		}
	}

	None
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn mint_request_serializes_the_wire_shape() {
		let request = MintRequest {
			uses: 3,
			expire_time: time::macros::datetime!(2026-01-01 00:30 UTC),
		};
		let payload =
			serde_json::to_value(&request).expect("Mint request should serialize successfully.");

		assert_eq!(payload["uses"], serde_json::json!(3));
		assert_eq!(payload["expireTime"], serde_json::json!("2026-01-01T00:30:00Z"));
	}

	#[cfg(feature = "reqwest")]
	#[test]
	fn empty_api_key_is_a_config_fault() {
		let result = HttpTokenIssuer::new("https://issuer.example/tokens", "  ");

		assert!(matches!(result, Err(Error::Config(ConfigError::MissingApiKey))));
	}

	#[cfg(feature = "reqwest")]
	#[test]
	fn malformed_endpoint_is_a_config_fault() {
		let result = HttpTokenIssuer::new("not a url", "key");

		assert!(matches!(result, Err(Error::Config(ConfigError::InvalidEndpoint { .. }))));
	}
}
