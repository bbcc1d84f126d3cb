//! Ephemeral credential broker—mint short-lived usage-counted tokens, gate them behind
//! per-client throttling and auditing, and keep realtime sessions connected through
//! rotation and backoff in one crate built for production.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod authority;
pub mod connector;
pub mod error;
pub mod gate;
pub mod issuer;
pub mod obs;
pub mod store;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
	// self
	use crate::{
		auth::TokenSecret,
		authority::{CredentialAuthority, IssuePolicy},
		error::IssuerError,
		issuer::{IssuerFuture, MintRequest, MintedToken, TokenIssuer},
	};

	/// Programmable in-memory issuer used across unit and integration tests.
	///
	/// Mints `scripted-token-N` secrets in sequence, counts mints, and can be
	/// switched into a failing mode or given an artificial mint latency.
	#[derive(Debug, Default)]
	pub struct ScriptedIssuer {
		mints: AtomicU64,
		failing: AtomicBool,
		delay: Option<std::time::Duration>,
	}
	impl ScriptedIssuer {
		/// Creates an issuer that mints instantly and never fails.
		pub fn new() -> Arc<Self> {
			Arc::new(Self::default())
		}

		/// Creates an issuer that sleeps `delay` before every mint.
		pub fn with_delay(delay: std::time::Duration) -> Arc<Self> {
			Arc::new(Self { delay: Some(delay), ..Default::default() })
		}

		/// Switches the failing mode on or off.
		pub fn set_failing(&self, failing: bool) {
			self.failing.store(failing, Ordering::SeqCst);
		}

		/// Total successful mints so far.
		pub fn mints(&self) -> u64 {
			self.mints.load(Ordering::SeqCst)
		}
	}
	impl TokenIssuer for ScriptedIssuer {
		fn mint(&self, _: MintRequest) -> IssuerFuture<'_, MintedToken> {
			Box::pin(async move {
				if let Some(delay) = self.delay {
					tokio::time::sleep(delay).await;
				}
				if self.failing.load(Ordering::SeqCst) {
					return Err(IssuerError::Unavailable {
						message: "scripted outage".into(),
						status: Some(503),
						retry_after: None,
					}
					.into());
				}

				let n = self.mints.fetch_add(1, Ordering::SeqCst) + 1;

				Ok(MintedToken { name: TokenSecret::new(format!("scripted-token-{n}")) })
			})
		}
	}

	/// Builds an authority over a fresh [`ScriptedIssuer`] with the default policy.
	pub fn scripted_authority() -> (Arc<CredentialAuthority>, Arc<ScriptedIssuer>) {
		let issuer = ScriptedIssuer::new();
		let authority =
			Arc::new(CredentialAuthority::new(issuer.clone(), IssuePolicy::default()));

		(authority, issuer)
	}
}

mod _prelude {
	pub use std::{
		collections::HashMap,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(all(test, feature = "reqwest"))] use httpmock as _;
