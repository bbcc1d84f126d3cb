//! Bounded audit trail recorded for every gated request.

// std
use std::collections::VecDeque;
// self
use crate::{_prelude::*, auth::ClientKey};

const DEFAULT_CAPACITY: usize = 1_000;

/// One audited request, recorded regardless of outcome.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
	/// Instant the request was observed.
	#[serde(with = "time::serde::rfc3339")]
	pub at: OffsetDateTime,
	/// Derived client identity.
	pub client: ClientKey,
	/// Request path (or internal operation label).
	pub path: String,
	/// Whether the wrapped operation succeeded.
	pub ok: bool,
	/// Error summary for failed requests.
	pub error: Option<String>,
	/// Wall-clock handling duration in milliseconds.
	pub duration_ms: u64,
}

/// Ring buffer retaining only the most recent audit entries.
pub struct AuditLog {
	entries: Mutex<VecDeque<AuditEntry>>,
	capacity: usize,
}
impl AuditLog {
	/// Creates a log bounded at the provided capacity.
	pub fn with_capacity(capacity: usize) -> Self {
		Self { entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))), capacity }
	}

	/// Appends an entry, discarding the oldest once the capacity is reached.
	pub fn record(&self, entry: AuditEntry) {
		let mut entries = self.entries.lock();

		if entries.len() == self.capacity {
			entries.pop_front();
		}

		entries.push_back(entry);
	}

	/// Returns up to `limit` of the most recent entries, newest last.
	pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
		let entries = self.entries.lock();
		let skip = entries.len().saturating_sub(limit);

		entries.iter().skip(skip).cloned().collect()
	}

	/// Number of retained entries.
	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	/// Returns `true` when nothing has been recorded yet.
	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}
}
impl Default for AuditLog {
	fn default() -> Self {
		Self::with_capacity(DEFAULT_CAPACITY)
	}
}
impl Debug for AuditLog {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AuditLog")
			.field("capacity", &self.capacity)
			.field("len", &self.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn entry(path: &str, ok: bool) -> AuditEntry {
		AuditEntry {
			at: OffsetDateTime::now_utc(),
			client: ClientKey::derive("https://app.example", "sig"),
			path: path.into(),
			ok,
			error: (!ok).then(|| "boom".into()),
			duration_ms: 3,
		}
	}

	#[test]
	fn capacity_discards_the_oldest_entries() {
		let log = AuditLog::with_capacity(3);

		for n in 0..5 {
			log.record(entry(&format!("/path-{n}"), true));
		}

		let recent = log.recent(10);

		assert_eq!(log.len(), 3);
		assert_eq!(
			recent.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
			["/path-2", "/path-3", "/path-4"]
		);
	}

	#[test]
	fn recent_limits_and_orders_newest_last() {
		let log = AuditLog::default();

		log.record(entry("/first", true));
		log.record(entry("/second", false));
		log.record(entry("/third", true));

		let recent = log.recent(2);

		assert_eq!(recent.len(), 2);
		assert_eq!(recent[0].path, "/second");
		assert_eq!(recent[1].path, "/third");
		assert!(!recent[0].ok);
	}
}
