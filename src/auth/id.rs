//! Strongly typed identifiers enforced across the broker domain.

// std
use std::{borrow::Borrow, ops::Deref};
// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{Rng, distr::Alphanumeric};
use sha2::{Digest, Sha256};
// self
use crate::_prelude::*;

macro_rules! def_id {
	($name:ident, $doc:literal, $kind:literal) => {
		#[doc = $doc]
		#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);
		impl $name {
			/// Creates a new identifier after validation.
			pub fn new(value: impl AsRef<str>) -> Result<Self, IdentifierError> {
				let view = value.as_ref();

				validate_view($kind, view)?;

				Ok(Self(view.to_owned()))
			}
		}
		impl Deref for $name {
			type Target = str;

			fn deref(&self) -> &Self::Target {
				&self.0
			}
		}
		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
		impl From<$name> for String {
			fn from(value: $name) -> Self {
				value.0
			}
		}
		impl TryFrom<String> for $name {
			type Error = IdentifierError;

			fn try_from(value: String) -> Result<Self, Self::Error> {
				validate_view($kind, &value)?;

				Ok(Self(value))
			}
		}
		impl Borrow<str> for $name {
			fn borrow(&self) -> &str {
				&self.0
			}
		}
		impl Debug for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				write!(f, concat!($kind, "({})"), self.0)
			}
		}
		impl Display for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				f.write_str(&self.0)
			}
		}
		impl FromStr for $name {
			type Err = IdentifierError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s)
			}
		}
	};
}

const IDENTIFIER_MAX_LEN: usize = 128;
const GENERATED_SESSION_LEN: usize = 16;

/// Error returned when identifier validation fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum IdentifierError {
	/// The identifier was empty or whitespace.
	#[error("{kind} identifier cannot be empty.")]
	Empty {
		/// Kind of identifier (session, client).
		kind: &'static str,
	},
	/// The identifier contains whitespace characters.
	#[error("{kind} identifier contains whitespace.")]
	ContainsWhitespace {
		/// Kind of identifier (session, client).
		kind: &'static str,
	},
	/// The identifier exceeded the allowed character count.
	#[error("{kind} identifier exceeds {max} characters.")]
	TooLong {
		/// Kind of identifier (session, client).
		kind: &'static str,
		/// Maximum permitted character count.
		max: usize,
	},
}

def_id! { SessionId, "Unique identifier for a logical broker session.", "Session" }
def_id! { ClientKey, "Rate-limit identity derived from a client's network origin and signature.", "Client" }

impl SessionId {
	/// Generates a random session identifier for requests that omit one.
	pub fn generate() -> Self {
		let suffix: String = rand::rng()
			.sample_iter(Alphanumeric)
			.take(GENERATED_SESSION_LEN)
			.map(char::from)
			.collect();

		Self(format!("session-{suffix}"))
	}
}
impl ClientKey {
	/// Derives a stable key from the client's network origin plus signature.
	///
	/// The digest keeps raw addresses and user-agent material out of limiter
	/// state and audit entries.
	pub fn derive(origin: &str, signature: &str) -> Self {
		let mut hasher = Sha256::new();

		hasher.update(origin.as_bytes());
		hasher.update(b"\n");
		hasher.update(signature.as_bytes());

		let digest = hasher.finalize();

		Self(URL_SAFE_NO_PAD.encode(&digest[..16]))
	}
}

fn validate_view(kind: &'static str, view: &str) -> Result<(), IdentifierError> {
	if view.is_empty() {
		return Err(IdentifierError::Empty { kind });
	}
	if view.chars().any(char::is_whitespace) {
		return Err(IdentifierError::ContainsWhitespace { kind });
	}
	if view.len() > IDENTIFIER_MAX_LEN {
		return Err(IdentifierError::TooLong { kind, max: IDENTIFIER_MAX_LEN });
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn identifiers_reject_whitespace_and_emptiness() {
		assert!(SessionId::new(" session-123").is_err(), "Leading whitespace must be rejected.");
		assert!(SessionId::new("session-123 ").is_err(), "Trailing whitespace must be rejected.");
		assert!(SessionId::new("").is_err());
		assert!(ClientKey::new("with space").is_err());

		let session =
			SessionId::new("session-123").expect("Session fixture should be considered valid.");

		assert_eq!(session.as_ref(), "session-123");
	}

	#[test]
	fn serde_round_trip_enforces_validation() {
		let payload = "\"session-42\"";
		let session: SessionId =
			serde_json::from_str(payload).expect("Session should deserialize successfully.");

		assert_eq!(session.as_ref(), "session-42");
		assert!(serde_json::from_str::<SessionId>("\"with space\"").is_err());
	}

	#[test]
	fn length_limits_apply() {
		let exact = "a".repeat(IDENTIFIER_MAX_LEN);

		SessionId::new(&exact).expect("Exact length should succeed.");

		let too_long = "a".repeat(IDENTIFIER_MAX_LEN + 1);

		assert!(SessionId::new(&too_long).is_err());
	}

	#[test]
	fn generated_sessions_are_distinct_and_valid() {
		let a = SessionId::generate();
		let b = SessionId::generate();

		assert_ne!(a, b);
		assert!(a.starts_with("session-"));
	}

	#[test]
	fn derived_client_keys_are_stable_and_distinguish_inputs() {
		let a = ClientKey::derive("https://app.example", "sig-1");
		let b = ClientKey::derive("https://app.example", "sig-1");
		let c = ClientKey::derive("https://app.example", "sig-2");

		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn borrow_supports_fast_lookup() {
		let map: HashMap<SessionId, u8> = HashMap::from_iter([(
			SessionId::new("session-123").expect("Session used for lookup should be valid."),
			7_u8,
		)]);

		assert_eq!(map.get("session-123"), Some(&7));
	}
}
