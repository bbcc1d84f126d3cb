//! Simple file-backed [`DurableCache`] for resumption across process restarts.

// std
use std::{
	fs::{self, File},
	io::Write,
	path::{Path, PathBuf},
};
// self
use crate::{
	_prelude::*,
	auth::SessionId,
	store::{CachedCredential, DurableCache, StoreError},
};

/// Persists cache entries to a JSON snapshot after each mutation.
///
/// Keys are namespaced with a configurable prefix so several brokers can share
/// one snapshot file without trampling each other's entries.
#[derive(Clone, Debug)]
pub struct FileCache {
	path: PathBuf,
	prefix: String,
	inner: Arc<RwLock<HashMap<String, CachedCredential>>>,
}
impl FileCache {
	/// Opens (or creates) a cache at the provided path, eagerly loading existing data.
	pub fn open(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, StoreError> {
		let path = path.into();

		Self::ensure_parent_exists(&path)?;

		let snapshot = if path.exists() { Self::load_snapshot(&path)? } else { HashMap::new() };

		Ok(Self { path, prefix: prefix.into(), inner: Arc::new(RwLock::new(snapshot)) })
	}

	fn load_snapshot(path: &Path) -> Result<HashMap<String, CachedCredential>, StoreError> {
		let metadata = path.metadata().map_err(|e| StoreError::Backend {
			message: format!("Failed to inspect {}: {e}", path.display()),
		})?;

		if metadata.len() == 0 {
			return Ok(HashMap::new());
		}

		let bytes = fs::read(path).map_err(|e| StoreError::Backend {
			message: format!("Failed to read {}: {e}", path.display()),
		})?;
		let entries: Vec<(String, CachedCredential)> =
			serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
				message: format!("Failed to parse {}: {e}", path.display()),
			})?;

		Ok(entries.into_iter().collect())
	}

	fn ensure_parent_exists(path: &Path) -> Result<(), StoreError> {
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
				message: format!("Failed to create cache directory {}: {e}", parent.display()),
			})?;
		}

		Ok(())
	}

	fn persist_locked(
		&self,
		contents: &HashMap<String, CachedCredential>,
	) -> Result<(), StoreError> {
		Self::ensure_parent_exists(&self.path)?;

		let snapshot: Vec<_> = contents.iter().collect();
		let serialized =
			serde_json::to_vec_pretty(&snapshot).map_err(|e| StoreError::Serialization {
				message: format!("Failed to serialize cache snapshot: {e}"),
			})?;
		let mut tmp_path = self.path.clone();

		tmp_path.set_extension("tmp");

		{
			let mut file = File::create(&tmp_path).map_err(|e| StoreError::Backend {
				message: format!("Failed to create {}: {e}", tmp_path.display()),
			})?;

			file.write_all(&serialized).map_err(|e| StoreError::Backend {
				message: format!("Failed to write {}: {e}", tmp_path.display()),
			})?;
			file.sync_all().map_err(|e| StoreError::Backend {
				message: format!("Failed to sync {}: {e}", tmp_path.display()),
			})?;
		}

		fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::Backend {
			message: format!("Failed to replace {}: {e}", self.path.display()),
		})
	}

	fn make_key(&self, session: &SessionId) -> String {
		format!("{}:{session}", self.prefix)
	}
}
impl DurableCache for FileCache {
	fn load(&self) -> Result<Vec<(SessionId, CachedCredential)>, StoreError> {
		let marker = format!("{}:", self.prefix);
		let guard = self.inner.read();
		let mut entries = Vec::new();

		for (key, cached) in guard.iter() {
			let Some(raw) = key.strip_prefix(&marker) else {
				continue;
			};
			let session = SessionId::new(raw).map_err(|e| StoreError::Serialization {
				message: format!("Persisted key `{key}` holds an invalid session id: {e}"),
			})?;

			entries.push((session, cached.clone()));
		}

		Ok(entries)
	}

	fn store(&self, session: &SessionId, entry: &CachedCredential) -> Result<(), StoreError> {
		let key = self.make_key(session);
		let mut guard = self.inner.write();

		guard.insert(key, entry.clone());
		self.persist_locked(&guard)
	}

	fn remove(&self, session: &SessionId) -> Result<(), StoreError> {
		let key = self.make_key(session);
		let mut guard = self.inner.write();

		if guard.remove(&key).is_some() {
			self.persist_locked(&guard)?;
		}

		Ok(())
	}
}
