// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for authority activity, surfaced via service stats.
#[derive(Debug, Default)]
pub struct AuthorityMetrics {
	issued: AtomicU64,
	consumed: AtomicU64,
	rotated: AtomicU64,
	revoked: AtomicU64,
	rejected: AtomicU64,
	faulted: AtomicU64,
	swept: AtomicU64,
}
impl AuthorityMetrics {
	/// Total credentials minted successfully.
	pub fn issued(&self) -> u64 {
		self.issued.load(Ordering::Relaxed)
	}

	/// Total successful `consume` calls.
	pub fn consumed(&self) -> u64 {
		self.consumed.load(Ordering::Relaxed)
	}

	/// Total rotation passes performed.
	pub fn rotated(&self) -> u64 {
		self.rotated.load(Ordering::Relaxed)
	}

	/// Total credentials revoked.
	pub fn revoked(&self) -> u64 {
		self.revoked.load(Ordering::Relaxed)
	}

	/// Requests rejected for parameter or quota violations.
	pub fn rejected(&self) -> u64 {
		self.rejected.load(Ordering::Relaxed)
	}

	/// `consume` calls that hit a credential-state fault.
	pub fn faulted(&self) -> u64 {
		self.faulted.load(Ordering::Relaxed)
	}

	/// Credentials removed by sweep passes.
	pub fn swept(&self) -> u64 {
		self.swept.load(Ordering::Relaxed)
	}

	pub(crate) fn record_issued(&self) {
		self.issued.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_consumed(&self) {
		self.consumed.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_rotated(&self) {
		self.rotated.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_revoked(&self, count: u64) {
		self.revoked.fetch_add(count, Ordering::Relaxed);
	}

	pub(crate) fn record_rejected(&self) {
		self.rejected.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_faulted(&self) {
		self.faulted.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_swept(&self, count: u64) {
		self.swept.fetch_add(count, Ordering::Relaxed);
	}
}
