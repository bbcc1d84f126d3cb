//! Request-shape and origin policy applied before any wrapped operation runs.

// self
use crate::{_prelude::*, error::ConfigError};

const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

/// Validates inbound request shape (method, content type, body size, origin).
#[derive(Clone, Debug)]
pub struct RequestPolicy {
	allowed_origins: Vec<Url>,
	allow_any_origin: bool,
	max_body_bytes: usize,
}
impl RequestPolicy {
	/// Creates a policy restricted to the provided origins.
	pub fn new<I, S>(origins: I) -> Result<Self, ConfigError>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut allowed = Vec::new();

		for origin in origins {
			let origin = origin.as_ref();
			let url = Url::parse(origin)
				.map_err(|_| ConfigError::InvalidOrigin { origin: origin.to_owned() })?;

			if url.host_str().is_none() {
				return Err(ConfigError::InvalidOrigin { origin: origin.to_owned() });
			}

			allowed.push(url);
		}

		Ok(Self {
			allowed_origins: allowed,
			allow_any_origin: false,
			max_body_bytes: DEFAULT_MAX_BODY_BYTES,
		})
	}

	/// Creates a policy that accepts every origin (development setups).
	pub fn allow_any_origin() -> Self {
		Self {
			allowed_origins: Vec::new(),
			allow_any_origin: true,
			max_body_bytes: DEFAULT_MAX_BODY_BYTES,
		}
	}

	/// Overrides the maximum accepted body size in bytes.
	pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
		self.max_body_bytes = bytes;

		self
	}

	/// Maximum accepted body size in bytes.
	pub fn max_body_bytes(&self) -> usize {
		self.max_body_bytes
	}

	/// Checks a request body against the size cap.
	pub fn check_body_size(&self, len: usize) -> Result<()> {
		if len > self.max_body_bytes {
			return Err(Error::RequestRejected {
				reason: format!("body exceeds {} bytes", self.max_body_bytes),
			});
		}

		Ok(())
	}

	/// Checks the content type of a body-carrying request.
	pub fn check_content_type(&self, content_type: Option<&str>) -> Result<()> {
		match content_type {
			Some(value) if value.trim().to_ascii_lowercase().starts_with("application/json") =>
				Ok(()),
			Some(value) =>
				Err(Error::RequestRejected { reason: format!("unsupported content type `{value}`") }),
			None => Err(Error::RequestRejected { reason: "missing content type".into() }),
		}
	}

	/// Checks the request origin against the allow-list.
	///
	/// Requests without an `Origin` header (non-browser clients) pass; a
	/// present origin must match an allow-listed scheme/host/port exactly.
	pub fn check_origin(&self, origin: Option<&str>) -> Result<()> {
		let Some(origin) = origin else {
			return Ok(());
		};

		if self.allow_any_origin {
			return Ok(());
		}

		let Ok(parsed) = Url::parse(origin) else {
			return Err(Error::OriginRejected { origin: origin.to_owned() });
		};
		let matched = self.allowed_origins.iter().any(|allowed| {
			allowed.scheme() == parsed.scheme()
				&& allowed.host_str() == parsed.host_str()
				&& allowed.port_or_known_default() == parsed.port_or_known_default()
		});

		if matched {
			Ok(())
		} else {
			Err(Error::OriginRejected { origin: origin.to_owned() })
		}
	}
}
