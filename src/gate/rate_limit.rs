//! Per-client sliding-window request admission control.

// self
use crate::{_prelude::*, auth::ClientKey};

/// Tuning knobs for [`RateLimiter`].
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
	/// Requests admitted per window.
	pub max_requests: u32,
	/// Window length; the counter resets once this much time has elapsed.
	pub window: Duration,
}
impl Default for RateLimitConfig {
	fn default() -> Self {
		Self { max_requests: 10, window: Duration::minutes(60) }
	}
}

/// Result of one admission check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateDecision {
	/// Whether the request may proceed.
	pub allowed: bool,
	/// Requests left in the current window after this one.
	pub remaining: u32,
	/// Instant the current window resets.
	pub reset_at: OffsetDateTime,
	/// Seconds to wait before retrying; zero when allowed.
	pub retry_after_seconds: u64,
}

#[derive(Clone, Debug)]
struct Window {
	count: u32,
	started_at: OffsetDateTime,
}

/// Sliding-window request counter keyed by derived client identity.
///
/// Admission and counting are one operation: a `check` that returns
/// `allowed = true` has already charged the window, so a request that is
/// admitted but later fails downstream still consumed budget.
pub struct RateLimiter {
	config: RateLimitConfig,
	windows: Mutex<HashMap<ClientKey, Window>>,
}
impl RateLimiter {
	/// Creates a limiter with the provided configuration.
	pub fn new(config: RateLimitConfig) -> Self {
		Self { config, windows: Mutex::new(HashMap::new()) }
	}

	/// Admission check against the current UTC instant.
	pub fn check(&self, client: &ClientKey) -> RateDecision {
		self.check_at(client, OffsetDateTime::now_utc())
	}

	/// Clock-injected variant of [`check`](Self::check).
	pub fn check_at(&self, client: &ClientKey, now: OffsetDateTime) -> RateDecision {
		let mut windows = self.windows.lock();
		let window = windows
			.entry(client.clone())
			.or_insert_with(|| Window { count: 0, started_at: now });

		if now - window.started_at >= self.config.window {
			window.count = 0;
			window.started_at = now;
		}

		let reset_at = window.started_at + self.config.window;

		if window.count >= self.config.max_requests {
			let retry_after = reset_at - now;

			return RateDecision {
				allowed: false,
				remaining: 0,
				reset_at,
				retry_after_seconds: retry_after.whole_seconds().max(1) as u64,
			};
		}

		window.count += 1;

		RateDecision {
			allowed: true,
			remaining: self.config.max_requests - window.count,
			reset_at,
			retry_after_seconds: 0,
		}
	}

	/// Drops windows idle for at least twice the window length to bound memory.
	pub fn purge_at(&self, now: OffsetDateTime) -> usize {
		let horizon = self.config.window * 2;
		let mut windows = self.windows.lock();
		let before = windows.len();

		windows.retain(|_, window| now - window.started_at < horizon);

		before - windows.len()
	}

	/// Spawns the periodic purge task; abort the handle to stop it.
	pub fn spawn_sweeper(
		self: &Arc<Self>,
		interval: std::time::Duration,
	) -> tokio::task::JoinHandle<()> {
		let limiter = self.clone();

		tokio::spawn(async move {
			loop {
				tokio::time::sleep(interval).await;
				limiter.purge_at(OffsetDateTime::now_utc());
			}
		})
	}

	/// The limiter configuration.
	pub fn config(&self) -> &RateLimitConfig {
		&self.config
	}

	/// Number of client windows currently tracked.
	pub fn tracked(&self) -> usize {
		self.windows.lock().len()
	}
}
impl Default for RateLimiter {
	fn default() -> Self {
		Self::new(RateLimitConfig::default())
	}
}
impl Debug for RateLimiter {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RateLimiter")
			.field("config", &self.config)
			.field("tracked", &self.tracked())
			.finish()
	}
}
