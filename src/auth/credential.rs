//! Ephemeral credential record, lifecycle helpers, and builder.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
// self
use crate::{
	_prelude::*,
	auth::{ScopeSet, SessionId, TokenSecret},
};

/// Derived lookup id for a credential, computed from the bearer value.
///
/// `consume` receives the raw token string over the wire; hashing it first
/// means the authority's bookkeeping maps never key on secret material.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);
impl CredentialId {
	/// Derives the id for a bearer token value.
	pub fn derive(value: &str) -> Self {
		let digest = Sha256::digest(value.as_bytes());

		Self(URL_SAFE_NO_PAD.encode(digest))
	}
}
impl Debug for CredentialId {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "CredentialId({})", self.0)
	}
}
impl Display for CredentialId {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}

/// Errors produced by [`CredentialBuilder`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum CredentialBuilderError {
	/// Issued when no bearer value was provided.
	#[error("Bearer value is required.")]
	MissingValue,
	/// Issued when no expiry (absolute or relative) was configured.
	#[error("Expiry must be supplied via expires_at or expires_in.")]
	MissingExpiry,
	/// Issued when the usage budget is zero.
	#[error("Usage budget must be at least one.")]
	ZeroUses,
}

/// Short-lived, usage-bounded bearer credential issued for one session.
///
/// Validity is the conjunction of both budgets: a credential is usable at an
/// instant iff `expires_at` is still in the future and `uses_remaining` is
/// positive. Timestamps serialize as RFC 3339 strings so durable snapshots
/// stay readable across processes.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
	/// Bearer value; callers must avoid logging it.
	pub value: TokenSecret,
	/// Session this credential was issued for. Never shared across sessions.
	pub session: SessionId,
	/// Normalized scopes granted to this credential.
	pub scope: ScopeSet,
	/// Expiry instant.
	#[serde(with = "time::serde::rfc3339")]
	pub expires_at: OffsetDateTime,
	/// Remaining usage budget; decremented by `consume`.
	pub uses_remaining: u32,
	/// Issuance instant.
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	/// Instant of the most recent `consume`, if any.
	#[serde(with = "time::serde::rfc3339::option")]
	pub last_used_at: Option<OffsetDateTime>,
}
impl Credential {
	/// Returns a builder for constructing credentials.
	pub fn builder(session: SessionId, scope: ScopeSet) -> CredentialBuilder {
		CredentialBuilder::new(session, scope)
	}

	/// Derived lookup id for this credential.
	pub fn id(&self) -> CredentialId {
		CredentialId::derive(self.value.expose())
	}

	/// Returns `true` if the credential is usable at the provided instant.
	pub fn is_valid_at(&self, instant: OffsetDateTime) -> bool {
		self.expires_at > instant && self.uses_remaining > 0
	}

	/// Convenience helper that checks validity against the current UTC instant.
	pub fn is_valid(&self) -> bool {
		self.is_valid_at(OffsetDateTime::now_utc())
	}

	/// Returns `true` if the expiry instant has passed.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		self.expires_at <= instant
	}

	/// Returns `true` if the usage budget is spent.
	pub fn is_exhausted(&self) -> bool {
		self.uses_remaining == 0
	}

	/// Zeroes the usage budget and stamps the last-use instant.
	///
	/// Used by rotation and revocation so superseded credentials stay in the
	/// ledger for the audit trail instead of being deleted.
	pub fn exhaust(&mut self, instant: OffsetDateTime) {
		self.uses_remaining = 0;
		self.last_used_at = Some(instant);
	}

	/// Most recent activity instant (last use, falling back to creation).
	pub fn last_activity(&self) -> OffsetDateTime {
		self.last_used_at.unwrap_or(self.created_at)
	}

	/// Remaining lifetime at the provided instant; zero once expired.
	pub fn remaining_at(&self, instant: OffsetDateTime) -> Duration {
		let remaining = self.expires_at - instant;

		if remaining.is_negative() { Duration::ZERO } else { remaining }
	}
}
impl Debug for Credential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Credential")
			.field("value", &"<redacted>")
			.field("session", &self.session)
			.field("scope", &self.scope)
			.field("expires_at", &self.expires_at)
			.field("uses_remaining", &self.uses_remaining)
			.field("created_at", &self.created_at)
			.field("last_used_at", &self.last_used_at)
			.finish()
	}
}

/// Builder for [`Credential`].
#[derive(Clone, Debug)]
pub struct CredentialBuilder {
	session: SessionId,
	scope: ScopeSet,
	value: Option<TokenSecret>,
	uses: u32,
	created_at: Option<OffsetDateTime>,
	expires_at: Option<OffsetDateTime>,
	expires_in: Option<Duration>,
}
impl CredentialBuilder {
	fn new(session: SessionId, scope: ScopeSet) -> Self {
		Self {
			session,
			scope,
			value: None,
			uses: 1,
			created_at: None,
			expires_at: None,
			expires_in: None,
		}
	}

	/// Provides the bearer value.
	pub fn value(mut self, value: impl Into<String>) -> Self {
		self.value = Some(TokenSecret::new(value));

		self
	}

	/// Sets the usage budget (defaults to one).
	pub fn uses(mut self, uses: u32) -> Self {
		self.uses = uses;

		self
	}

	/// Sets the creation instant.
	pub fn created_at(mut self, instant: OffsetDateTime) -> Self {
		self.created_at = Some(instant);

		self
	}

	/// Sets an absolute expiry instant.
	pub fn expires_at(mut self, instant: OffsetDateTime) -> Self {
		self.expires_at = Some(instant);

		self
	}

	/// Sets a relative expiry duration from the creation instant.
	pub fn expires_in(mut self, duration: Duration) -> Self {
		self.expires_in = Some(duration);

		self
	}

	/// Consumes the builder and produces a [`Credential`].
	pub fn build(self) -> Result<Credential, CredentialBuilderError> {
		let value = self.value.ok_or(CredentialBuilderError::MissingValue)?;

		if self.uses == 0 {
			return Err(CredentialBuilderError::ZeroUses);
		}

		let created_at = self.created_at.unwrap_or_else(OffsetDateTime::now_utc);
		let expires_at = match (self.expires_at, self.expires_in) {
			(Some(instant), _) => instant,
			(None, Some(delta)) => created_at + delta,
			(None, None) => return Err(CredentialBuilderError::MissingExpiry),
		};

		Ok(Credential {
			value,
			session: self.session,
			scope: self.scope,
			expires_at,
			uses_remaining: self.uses,
			created_at,
			last_used_at: None,
		})
	}
}
