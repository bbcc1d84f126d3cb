//! Resilient session connection lifecycle.
//!
//! A [`SessionConnector`] owns one realtime stream for one session. It
//! acquires short-lived credentials through a [`CredentialSource`], caches
//! them in a [`CredentialStore`], rotates them ahead of expiry, and replays
//! the last stream request with exponential backoff when the stream drops.
//! Observers receive [`SessionEvent`]s for every lifecycle transition.

// std
use std::{sync::Weak, time::Duration as StdDuration};
// self
use crate::{
	_prelude::*,
	auth::{Credential, SessionId, TokenSecret},
	authority::{CredentialAuthority, IssueOptions},
	obs::{self, OpKind, OpOutcome, OpSpan},
	store::CredentialStore,
};

/// Boxed future returned by credential-source and stream-factory calls.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Where the connector obtains credentials for its session.
pub trait CredentialSource: Send + Sync {
	/// Obtains a credential for the session, minting one if necessary.
	fn fetch<'a>(&'a self, session: &'a SessionId) -> SourceFuture<'a, Credential>;

	/// Rotates the session's credentials, invalidating prior ones.
	fn refresh<'a>(&'a self, session: &'a SessionId) -> SourceFuture<'a, Credential>;
}
impl CredentialSource for CredentialAuthority {
	fn fetch<'a>(&'a self, session: &'a SessionId) -> SourceFuture<'a, Credential> {
		Box::pin(self.issue(IssueOptions::for_session(session.clone())))
	}

	fn refresh<'a>(&'a self, session: &'a SessionId) -> SourceFuture<'a, Credential> {
		Box::pin(self.rotate(session, IssueOptions::default()))
	}
}

/// Everything needed to open (or reopen) the realtime stream.
#[derive(Clone, Debug)]
pub struct StreamRequest {
	/// Bearer credential presented to the upstream.
	pub bearer: TokenSecret,
	/// Upstream model or channel identifier.
	pub model: String,
	/// Opaque stream configuration forwarded verbatim.
	pub config: serde_json::Value,
}

/// Out-of-band notification emitted by an open stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamSignal {
	/// The stream closed with the given code and reason.
	Closed {
		/// Close code; `1000` means a clean shutdown.
		code: u16,
		/// Human-readable close reason.
		reason: String,
	},
	/// The stream reported a fault without closing.
	Fault {
		/// Upstream fault description.
		message: String,
	},
}

/// Callback invoked by a stream when it produces a [`StreamSignal`].
pub type SignalSink = Arc<dyn Fn(StreamSignal) + Send + Sync>;

/// An open realtime stream.
pub trait StreamHandle: Send + Sync {
	/// Closes the stream; further signals must not be delivered.
	fn close(&self);
}

/// Opens realtime streams on behalf of connectors.
pub trait StreamFactory: Send + Sync {
	/// Opens a stream described by `request`, wiring `sink` for signals.
	fn open<'a>(
		&'a self,
		request: StreamRequest,
		sink: SignalSink,
	) -> SourceFuture<'a, Box<dyn StreamHandle>>;
}

/// Lifecycle notifications delivered to [`ConnectorObserver`]s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
	/// A fresh credential replaced the previous one.
	TokenRefreshed {
		/// Expiry of the replacement credential.
		expires_at: OffsetDateTime,
	},
	/// The active credential could not be rotated in time.
	TokenExpired,
	/// A reconnect attempt is starting.
	Reconnecting {
		/// 1-based attempt number.
		attempt: u32,
		/// Configured attempt ceiling.
		max_attempts: u32,
	},
	/// The stream was re-established after a drop.
	Reconnected,
	/// All reconnect attempts were exhausted.
	ReconnectFailed {
		/// Attempts made before giving up.
		attempts: u32,
	},
	/// The connector shut down.
	Disconnected,
}

/// Receives [`SessionEvent`]s; implementations must not block.
pub trait ConnectorObserver: Send + Sync {
	/// Called synchronously for every lifecycle event.
	fn on_event(&self, event: &SessionEvent);
}

/// Coarse connection state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
	/// No stream and no pending work.
	#[default]
	Disconnected,
	/// First connection attempt in flight.
	Connecting,
	/// Stream open, credential armed for rotation.
	Connected,
	/// Stream lost, backoff retries in flight.
	Reconnecting,
}

/// Tuning knobs for [`SessionConnector`].
#[derive(Clone, Debug)]
pub struct ConnectorConfig {
	/// Reconnect attempts before giving up.
	pub max_retries: u32,
	/// First backoff delay; doubles per attempt.
	pub base_delay: StdDuration,
	/// Backoff ceiling.
	pub max_delay: StdDuration,
	/// Rotate the credential this long before it expires.
	pub refresh_threshold: Duration,
}
impl Default for ConnectorConfig {
	fn default() -> Self {
		Self {
			max_retries: 3,
			base_delay: StdDuration::from_millis(1_000),
			max_delay: StdDuration::from_secs(30),
			refresh_threshold: Duration::minutes(5),
		}
	}
}

/// Exponential backoff delay for a 1-based reconnect attempt.
pub fn backoff_delay(attempt: u32, base: StdDuration, cap: StdDuration) -> StdDuration {
	let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));

	base.saturating_mul(factor).min(cap)
}

/// How long to wait before rotating a credential expiring at `expires_at`.
///
/// Zero when the credential is already inside the threshold window.
pub fn refresh_delay(
	expires_at: OffsetDateTime,
	now: OffsetDateTime,
	threshold: Duration,
) -> StdDuration {
	let until_rotation = expires_at - threshold - now;

	if until_rotation.is_positive() {
		StdDuration::from_millis(until_rotation.whole_milliseconds().max(0) as _)
	} else {
		StdDuration::ZERO
	}
}

#[derive(Default)]
struct ConnectorState {
	phase: ConnectionPhase,
	reconnect_attempts: u32,
	credential: Option<Credential>,
	stream: Option<Box<dyn StreamHandle>>,
	refresh_task: Option<tokio::task::JoinHandle<()>>,
	reconnect_task: Option<tokio::task::JoinHandle<()>>,
	last_request: Option<(String, serde_json::Value)>,
	last_error: Option<Error>,
}

/// Drives one session's stream through connect, refresh, and reconnect.
pub struct SessionConnector {
	session: SessionId,
	source: Arc<dyn CredentialSource>,
	store: Arc<CredentialStore>,
	streams: Arc<dyn StreamFactory>,
	config: ConnectorConfig,
	state: Mutex<ConnectorState>,
	// Serializes credential acquisition so concurrent callers share one mint.
	fetch_guard: AsyncMutex<()>,
	observers: RwLock<Vec<Arc<dyn ConnectorObserver>>>,
}
impl SessionConnector {
	/// Creates a disconnected connector for `session`.
	pub fn new(
		session: SessionId,
		source: Arc<dyn CredentialSource>,
		store: Arc<CredentialStore>,
		streams: Arc<dyn StreamFactory>,
		config: ConnectorConfig,
	) -> Arc<Self> {
		Arc::new(Self {
			session,
			source,
			store,
			streams,
			config,
			state: Mutex::new(ConnectorState::default()),
			fetch_guard: AsyncMutex::new(()),
			observers: RwLock::new(Vec::new()),
		})
	}

	/// The session this connector serves.
	pub fn session(&self) -> &SessionId {
		&self.session
	}

	/// Current coarse connection state.
	pub fn phase(&self) -> ConnectionPhase {
		self.state.lock().phase
	}

	/// Expiry of the credential currently armed, if any.
	pub fn credential_expires_at(&self) -> Option<OffsetDateTime> {
		self.state.lock().credential.as_ref().map(|c| c.expires_at)
	}

	/// Registers a lifecycle observer.
	pub fn subscribe(&self, observer: Arc<dyn ConnectorObserver>) {
		self.observers.write().push(observer);
	}

	/// Takes the terminal error left behind by the last failed connection cycle.
	///
	/// [`Error::ConnectFailed`] when the stream never opened before retries ran
	/// out, [`Error::ReconnectExhausted`] when an established stream dropped
	/// and could not be recovered. `None` while healthy or still retrying.
	pub fn take_last_error(&self) -> Option<Error> {
		self.state.lock().last_error.take()
	}

	/// Opens the stream for `model` with the given configuration.
	///
	/// Returns `Ok(true)` when a new stream was established, `Ok(false)` when
	/// the call was a no-op (already connected or connecting) or the stream
	/// failed to open and a reconnect was scheduled instead. Credential
	/// acquisition failures are terminal and surface as `Err`; terminal
	/// outcomes of the scheduled reconnect are reported through
	/// [`take_last_error`](Self::take_last_error).
	pub async fn connect(
		self: &Arc<Self>,
		model: impl Into<String>,
		config: serde_json::Value,
	) -> Result<bool> {
		let model = model.into();

		{
			let mut state = self.state.lock();

			match state.phase {
				ConnectionPhase::Connected | ConnectionPhase::Connecting =>
					return Ok(false),
				ConnectionPhase::Disconnected | ConnectionPhase::Reconnecting => {
					state.phase = ConnectionPhase::Connecting;

					if let Some(task) = state.reconnect_task.take() {
						task.abort();
					}
				},
			}
		}

		const KIND: OpKind = OpKind::Connect;

		let span = OpSpan::new(KIND, "connect");

		obs::record_op_outcome(KIND, OpOutcome::Attempt);

		let result = span.instrument(self.connect_inner(model, config)).await;

		match &result {
			Ok(true) => obs::record_op_outcome(KIND, OpOutcome::Success),
			Ok(false) | Err(_) => obs::record_op_outcome(KIND, OpOutcome::Failure),
		}

		result
	}

	async fn connect_inner(
		self: &Arc<Self>,
		model: String,
		config: serde_json::Value,
	) -> Result<bool> {
		let credential = match self.acquire_credential().await {
			Ok(credential) => credential,
			Err(e) => {
				self.state.lock().phase = ConnectionPhase::Disconnected;

				return Err(Error::AuthFailed { reason: e.to_string() });
			},
		};

		match self.open_stream(&credential, &model, &config).await {
			Ok(stream) => {
				let expires_at = credential.expires_at;

				{
					let mut state = self.state.lock();

					state.phase = ConnectionPhase::Connected;
					state.reconnect_attempts = 0;
					state.credential = Some(credential);
					state.stream = Some(stream);
					state.last_request = Some((model, config));
					state.last_error = None;
				}

				self.schedule_refresh(expires_at);

				Ok(true)
			},
			Err(_) => {
				{
					let mut state = self.state.lock();

					state.credential = Some(credential);
					state.last_request = Some((model, config));
				}

				self.start_reconnect();

				Ok(false)
			},
		}
	}

	/// Tears the connection down and cancels all pending work. Idempotent.
	pub fn disconnect(&self) {
		let (stream, was_connected) = {
			let mut state = self.state.lock();
			let was_connected = state.phase != ConnectionPhase::Disconnected;

			if let Some(task) = state.refresh_task.take() {
				task.abort();
			}
			if let Some(task) = state.reconnect_task.take() {
				task.abort();
			}

			state.phase = ConnectionPhase::Disconnected;
			state.reconnect_attempts = 0;
			state.credential = None;

			(state.stream.take(), was_connected)
		};

		if let Some(stream) = stream {
			stream.close();
		}
		if was_connected {
			self.notify(&SessionEvent::Disconnected);
		}
	}

	/// Returns a cached credential when it is still comfortably valid,
	/// otherwise mints one through the source and caches it.
	pub async fn acquire_credential(self: &Arc<Self>) -> Result<Credential> {
		let _permit = self.fetch_guard.lock().await;
		let now = OffsetDateTime::now_utc();

		if let Some(cached) = self.store.get_at(&self.session, now)
			&& cached.expires_at - now > self.config.refresh_threshold
		{
			return Ok(cached);
		}

		let credential = self.source.fetch(&self.session).await?;

		self.store.put_at(self.session.clone(), credential.clone(), now);

		Ok(credential)
	}

	/// Rotates the active credential in place; on failure falls through to
	/// the reconnect path, since a stream holding a dead credential is as
	/// good as dropped.
	pub async fn refresh_credential(self: &Arc<Self>) {
		let _permit = self.fetch_guard.lock().await;

		if self.phase() != ConnectionPhase::Connected {
			return;
		}

		obs::record_op_outcome(OpKind::Refresh, OpOutcome::Attempt);

		match self.source.refresh(&self.session).await {
			Ok(credential) => {
				let expires_at = credential.expires_at;
				let now = OffsetDateTime::now_utc();

				{
					let mut state = self.state.lock();

					// A disconnect raced the rotation; the result must not
					// re-arm a torn-down session.
					if state.phase != ConnectionPhase::Connected {
						return;
					}

					state.credential = Some(credential.clone());
				}

				self.store.put_at(self.session.clone(), credential, now);
				obs::record_op_outcome(OpKind::Refresh, OpOutcome::Success);
				self.notify(&SessionEvent::TokenRefreshed { expires_at });
				self.schedule_refresh(expires_at);
			},
			Err(_) => {
				obs::record_op_outcome(OpKind::Refresh, OpOutcome::Failure);

				if self.phase() != ConnectionPhase::Connected {
					return;
				}

				self.notify(&SessionEvent::TokenExpired);
				self.start_reconnect();
			},
		}
	}

	fn schedule_refresh(self: &Arc<Self>, expires_at: OffsetDateTime) {
		let delay =
			refresh_delay(expires_at, OffsetDateTime::now_utc(), self.config.refresh_threshold);
		let weak = Arc::downgrade(self);
		let task = tokio::spawn(async move {
			tokio::time::sleep(delay).await;

			if let Some(connector) = weak.upgrade() {
				connector.refresh_credential().await;
			}
		});
		let mut state = self.state.lock();

		if let Some(previous) = state.refresh_task.replace(task) {
			previous.abort();
		}
	}

	fn start_reconnect(self: &Arc<Self>) {
		let established = {
			let mut state = self.state.lock();

			if state.phase == ConnectionPhase::Reconnecting {
				return;
			}

			let established = state.phase == ConnectionPhase::Connected;

			state.phase = ConnectionPhase::Reconnecting;

			if let Some(stream) = state.stream.take() {
				stream.close();
			}
			if let Some(task) = state.refresh_task.take() {
				task.abort();
			}

			established
		};

		let weak = Arc::downgrade(self);
		let max_attempts = self.config.max_retries;
		let task = tokio::spawn(async move {
			for attempt in 1..=max_attempts {
				let Some(connector) = weak.upgrade() else { return };

				connector.notify(&SessionEvent::Reconnecting { attempt, max_attempts });
				obs::record_op_outcome(OpKind::Reconnect, OpOutcome::Attempt);

				let delay = backoff_delay(
					attempt,
					connector.config.base_delay,
					connector.config.max_delay,
				);

				drop(connector);
				tokio::time::sleep(delay).await;

				let Some(connector) = weak.upgrade() else { return };

				if connector.phase() != ConnectionPhase::Reconnecting {
					return;
				}
				if connector.try_reconnect_once().await {
					obs::record_op_outcome(OpKind::Reconnect, OpOutcome::Success);
					connector.notify(&SessionEvent::Reconnected);

					return;
				}

				obs::record_op_outcome(OpKind::Reconnect, OpOutcome::Failure);
			}

			if let Some(connector) = weak.upgrade() {
				{
					let mut state = connector.state.lock();

					state.phase = ConnectionPhase::Disconnected;
					state.credential = None;
					state.last_error = Some(if established {
						Error::ReconnectExhausted { attempts: max_attempts }
					} else {
						Error::ConnectFailed { attempts: max_attempts }
					});
				}

				connector.notify(&SessionEvent::ReconnectFailed { attempts: max_attempts });
			}
		});
		let mut state = self.state.lock();

		if let Some(previous) = state.reconnect_task.replace(task) {
			previous.abort();
		}
	}

	async fn try_reconnect_once(self: &Arc<Self>) -> bool {
		let Some((model, config)) = self.state.lock().last_request.clone() else {
			return false;
		};
		// Prior credentials may have died with the stream, always rotate.
		let credential = {
			let _permit = self.fetch_guard.lock().await;

			match self.source.refresh(&self.session).await {
				Ok(credential) => {
					self.store.put_at(
						self.session.clone(),
						credential.clone(),
						OffsetDateTime::now_utc(),
					);

					credential
				},
				Err(_) => return false,
			}
		};

		match self.open_stream(&credential, &model, &config).await {
			Ok(stream) => {
				let expires_at = credential.expires_at;

				{
					let mut state = self.state.lock();

					state.phase = ConnectionPhase::Connected;
					state.reconnect_attempts = 0;
					state.credential = Some(credential);
					state.stream = Some(stream);
					state.last_error = None;
				}

				self.schedule_refresh(expires_at);

				true
			},
			Err(_) => false,
		}
	}

	async fn open_stream(
		self: &Arc<Self>,
		credential: &Credential,
		model: &str,
		config: &serde_json::Value,
	) -> Result<Box<dyn StreamHandle>> {
		let weak = Arc::downgrade(self);
		let sink: SignalSink = Arc::new(move |signal| {
			let weak = Weak::clone(&weak);

			tokio::spawn(async move {
				if let Some(connector) = weak.upgrade() {
					connector.handle_signal(signal).await;
				}
			});
		});
		let request = StreamRequest {
			bearer: credential.value.clone(),
			model: model.to_owned(),
			config: config.clone(),
		};

		self.streams.open(request, sink).await
	}

	async fn handle_signal(self: &Arc<Self>, signal: StreamSignal) {
		// Signals are dispatched through spawned tasks, so one emitted just
		// before a stream closed can arrive after `disconnect`. Only a live
		// connection reacts; a torn-down session must stay down.
		if self.phase() != ConnectionPhase::Connected {
			return;
		}

		match signal {
			StreamSignal::Closed { code, .. } =>
				if code == 1000 {
					self.disconnect();
				} else {
					self.start_reconnect();
				},
			StreamSignal::Fault { message } =>
				if is_auth_fault(&message) {
					self.refresh_credential().await;
				},
		}
	}

	fn notify(&self, event: &SessionEvent) {
		for observer in self.observers.read().iter() {
			observer.on_event(event);
		}
	}
}
impl Debug for SessionConnector {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SessionConnector")
			.field("session", &self.session)
			.field("phase", &self.phase())
			.finish()
	}
}

fn is_auth_fault(message: &str) -> bool {
	let lowered = message.to_ascii_lowercase();

	["unauthorized", "auth", "token", "401", "403"].iter().any(|needle| lowered.contains(needle))
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn backoff_doubles_then_caps() {
		let base = StdDuration::from_millis(1_000);
		let cap = StdDuration::from_secs(30);

		assert_eq!(backoff_delay(1, base, cap), StdDuration::from_secs(1));
		assert_eq!(backoff_delay(2, base, cap), StdDuration::from_secs(2));
		assert_eq!(backoff_delay(3, base, cap), StdDuration::from_secs(4));
		assert_eq!(backoff_delay(6, base, cap), StdDuration::from_secs(30));
		assert_eq!(backoff_delay(100, base, cap), cap);
	}

	#[test]
	fn refresh_fires_threshold_before_expiry() {
		let now = OffsetDateTime::UNIX_EPOCH;
		let expires_at = now + Duration::minutes(30);

		assert_eq!(
			refresh_delay(expires_at, now, Duration::minutes(5)),
			StdDuration::from_secs(25 * 60),
		);
	}

	#[test]
	fn refresh_delay_clamps_to_zero_inside_threshold() {
		let now = OffsetDateTime::UNIX_EPOCH;

		assert_eq!(
			refresh_delay(now + Duration::minutes(3), now, Duration::minutes(5)),
			StdDuration::ZERO,
		);
		assert_eq!(
			refresh_delay(now - Duration::minutes(1), now, Duration::minutes(5)),
			StdDuration::ZERO,
		);
	}

	#[test]
	fn auth_faults_are_recognized() {
		assert!(is_auth_fault("401 Unauthorized"));
		assert!(is_auth_fault("token expired"));
		assert!(!is_auth_fault("peer reset connection"));
	}
}
