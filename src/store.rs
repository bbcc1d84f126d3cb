//! Client-side credential cache with capacity eviction and optional durable mirroring.

pub mod file;

pub use file::FileCache;

// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::{
	_prelude::*,
	auth::{Credential, SessionId},
};

/// Error type produced by [`DurableCache`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}

/// Credential wrapped with its retrieval instant, the shape mirrored durably.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCredential {
	/// The cached credential.
	pub credential: Credential,
	/// Instant the credential was obtained from the authority.
	#[serde(with = "time::serde::rfc3339")]
	pub retrieved_at: OffsetDateTime,
}

/// Side-channel that persists cache mutations across process restarts.
///
/// Failures are reported to the store, which logs them and degrades to a
/// cache miss; they never propagate to foreground callers.
pub trait DurableCache
where
	Self: Send + Sync,
{
	/// Loads every persisted entry.
	fn load(&self) -> Result<Vec<(SessionId, CachedCredential)>, StoreError>;

	/// Persists or replaces the entry for a session.
	fn store(&self, session: &SessionId, entry: &CachedCredential) -> Result<(), StoreError>;

	/// Removes the persisted entry for a session.
	fn remove(&self, session: &SessionId) -> Result<(), StoreError>;
}

/// Tuning knobs for [`CredentialStore`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
	/// Maximum number of cached sessions before least-recently-accessed eviction.
	pub capacity: usize,
	/// How long an untouched entry may linger before a sweep removes it.
	pub idle_ttl: Duration,
}
impl Default for StoreConfig {
	fn default() -> Self {
		Self { capacity: 50, idle_ttl: Duration::minutes(60) }
	}
}

#[derive(Clone, Debug)]
struct CacheEntry {
	cached: CachedCredential,
	hits: u64,
	last_accessed_at: OffsetDateTime,
}

/// Keyed cache of issued credentials, shared by every connector in the process.
///
/// Reads never block on IO: the durable mirror is written behind the in-memory
/// map and a miss simply sends the caller back to the authority.
pub struct CredentialStore {
	config: StoreConfig,
	entries: Mutex<HashMap<SessionId, CacheEntry>>,
	durable: Option<Arc<dyn DurableCache>>,
	durable_failures: AtomicU64,
}
impl CredentialStore {
	/// Creates an in-memory store with the provided configuration.
	pub fn new(config: StoreConfig) -> Self {
		Self {
			config,
			entries: Mutex::new(HashMap::new()),
			durable: None,
			durable_failures: AtomicU64::new(0),
		}
	}

	/// Attaches a durable mirror and eagerly loads surviving entries.
	///
	/// A failed load is logged and treated as an empty cache, never as fatal.
	pub fn with_durable(mut self, durable: Arc<dyn DurableCache>) -> Self {
		match durable.load() {
			Ok(persisted) => {
				let now = OffsetDateTime::now_utc();
				let mut entries = self.entries.lock();

				for (session, cached) in persisted {
					if cached.credential.is_valid_at(now) {
						entries
							.insert(session, CacheEntry { cached, hits: 0, last_accessed_at: now });
					}
				}
			},
			Err(e) => self.note_durable_failure("load", &e),
		}

		self.durable = Some(durable);

		self
	}

	/// Returns the cached credential for the session if it is still valid.
	///
	/// Invalid entries are evicted on read.
	pub fn get(&self, session: &SessionId) -> Option<Credential> {
		self.get_at(session, OffsetDateTime::now_utc())
	}

	/// Clock-injected variant of [`get`](Self::get).
	pub fn get_at(&self, session: &SessionId, now: OffsetDateTime) -> Option<Credential> {
		let mut entries = self.entries.lock();
		let entry = entries.get_mut(session)?;

		if !entry.cached.credential.is_valid_at(now) {
			entries.remove(session);
			drop(entries);
			self.remove_durable(session);

			return None;
		}

		entry.hits += 1;
		entry.last_accessed_at = now;

		Some(entry.cached.credential.clone())
	}

	/// Inserts or replaces the credential for a session, evicting the
	/// least-recently-accessed entry when the store is full.
	pub fn put(&self, session: SessionId, credential: Credential) {
		self.put_at(session, credential, OffsetDateTime::now_utc());
	}

	/// Clock-injected variant of [`put`](Self::put).
	pub fn put_at(&self, session: SessionId, credential: Credential, now: OffsetDateTime) {
		let cached = CachedCredential { credential, retrieved_at: now };
		let evicted = {
			let mut entries = self.entries.lock();
			let evicted = if !entries.contains_key(&session)
				&& entries.len() >= self.config.capacity
			{
				let victim = entries
					.iter()
					.min_by_key(|(_, entry)| entry.last_accessed_at)
					.map(|(key, _)| key.clone());

				victim.inspect(|key| {
					entries.remove(key);
				})
			} else {
				None
			};

			entries.insert(
				session.clone(),
				CacheEntry { cached: cached.clone(), hits: 0, last_accessed_at: now },
			);

			evicted
		};

		if let Some(victim) = evicted {
			self.remove_durable(&victim);
		}
		if let Some(durable) = &self.durable
			&& let Err(e) = durable.store(&session, &cached)
		{
			self.note_durable_failure("store", &e);
		}
	}

	/// Removes the entry for a session, if present.
	pub fn remove(&self, session: &SessionId) {
		let removed = self.entries.lock().remove(session).is_some();

		if removed {
			self.remove_durable(session);
		}
	}

	/// Removes invalid or stale entries; returns how many were dropped.
	pub fn sweep_at(&self, now: OffsetDateTime) -> usize {
		let idle_ttl = self.config.idle_ttl;
		let removed: Vec<SessionId> = {
			let mut entries = self.entries.lock();
			let stale: Vec<SessionId> = entries
				.iter()
				.filter(|(_, entry)| {
					!entry.cached.credential.is_valid_at(now)
						|| now - entry.last_accessed_at >= idle_ttl
				})
				.map(|(key, _)| key.clone())
				.collect();

			for key in &stale {
				entries.remove(key);
			}

			stale
		};

		for session in &removed {
			self.remove_durable(session);
		}

		removed.len()
	}

	/// Number of currently cached sessions.
	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	/// Returns `true` when nothing is cached.
	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	/// Hit count recorded for a session's entry, if cached.
	pub fn hits(&self, session: &SessionId) -> Option<u64> {
		self.entries.lock().get(session).map(|entry| entry.hits)
	}

	/// Count of durable-mirror operations that failed and were degraded to misses.
	pub fn durable_failures(&self) -> u64 {
		self.durable_failures.load(Ordering::Relaxed)
	}

	fn remove_durable(&self, session: &SessionId) {
		if let Some(durable) = &self.durable
			&& let Err(e) = durable.remove(session)
		{
			self.note_durable_failure("remove", &e);
		}
	}

	fn note_durable_failure(&self, stage: &'static str, error: &StoreError) {
		self.durable_failures.fetch_add(1, Ordering::Relaxed);

		#[cfg(feature = "tracing")]
		tracing::warn!(stage, error = %error, "Durable cache operation failed; continuing without it.");
		#[cfg(not(feature = "tracing"))]
		let _ = (stage, error);
	}
}
impl Default for CredentialStore {
	fn default() -> Self {
		Self::new(StoreConfig::default())
	}
}
impl Debug for CredentialStore {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CredentialStore")
			.field("config", &self.config)
			.field("len", &self.len())
			.field("durable", &self.durable.is_some())
			.finish()
	}
}
