#![cfg(feature = "test")]

// std
use std::{
	sync::atomic::{AtomicBool, AtomicU32, Ordering},
	time::Duration as StdDuration,
};
// crates.io
use serde_json::json;
// self
use ephemeral_broker::{
	_preludet::*,
	auth::SessionId,
	authority::{CredentialAuthority, IssuePolicy},
	connector::{
		ConnectionPhase, ConnectorConfig, ConnectorObserver, CredentialSource, SessionConnector,
		SessionEvent, SignalSink, StreamFactory, StreamHandle, StreamRequest, StreamSignal,
	},
	error::TransportError,
	store::{CredentialStore, StoreConfig},
};

#[derive(Default)]
struct RecordingObserver {
	events: Mutex<Vec<SessionEvent>>,
}
impl RecordingObserver {
	fn events(&self) -> Vec<SessionEvent> {
		self.events.lock().clone()
	}
}
impl ConnectorObserver for RecordingObserver {
	fn on_event(&self, event: &SessionEvent) {
		self.events.lock().push(event.clone());
	}
}

struct TestStream {
	closed: Arc<AtomicBool>,
}
impl StreamHandle for TestStream {
	fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
	}
}

/// Stream factory that fails the first `fail_next` opens, then hands out
/// streams whose signal sinks the test can drive directly.
#[derive(Default)]
struct ScriptedStreams {
	fail_next: AtomicU32,
	opens: AtomicU32,
	sink: Mutex<Option<SignalSink>>,
	bearers: Mutex<Vec<String>>,
	closed_flags: Mutex<Vec<Arc<AtomicBool>>>,
}
impl ScriptedStreams {
	fn failing_next(opens: u32) -> Arc<Self> {
		let streams = Self::default();

		streams.fail_next.store(opens, Ordering::SeqCst);

		Arc::new(streams)
	}

	fn signal(&self, signal: StreamSignal) {
		let sink = self.sink.lock().clone().expect("A stream should have been opened.");

		sink(signal);
	}
}
impl StreamFactory for ScriptedStreams {
	fn open<'a>(
		&'a self,
		request: StreamRequest,
		sink: SignalSink,
	) -> ephemeral_broker::connector::SourceFuture<'a, Box<dyn StreamHandle>> {
		Box::pin(async move {
			self.opens.fetch_add(1, Ordering::SeqCst);

			if self.fail_next.load(Ordering::SeqCst) > 0 {
				self.fail_next.fetch_sub(1, Ordering::SeqCst);

				let error = TransportError::Io(std::io::Error::other("scripted open failure"));

				return Err(error.into());
			}

			self.bearers.lock().push(request.bearer.expose().to_owned());
			*self.sink.lock() = Some(sink);

			let closed = Arc::new(AtomicBool::new(false));

			self.closed_flags.lock().push(closed.clone());

			Ok(Box::new(TestStream { closed }) as Box<dyn StreamHandle>)
		})
	}
}

struct Fixture {
	connector: Arc<SessionConnector>,
	streams: Arc<ScriptedStreams>,
	observer: Arc<RecordingObserver>,
	issuer: Arc<ScriptedIssuer>,
}

fn fixture(streams: Arc<ScriptedStreams>, config: ConnectorConfig) -> Fixture {
	let (authority, issuer) = scripted_authority();
	let source: Arc<dyn CredentialSource> = authority;
	let store = Arc::new(CredentialStore::new(StoreConfig::default()));
	let session = SessionId::new("connector-session")
		.expect("Session identifier fixture should be valid.");
	let connector = SessionConnector::new(session, source, store, streams.clone(), config);
	let observer = Arc::new(RecordingObserver::default());

	connector.subscribe(observer.clone());

	Fixture { connector, streams, observer, issuer }
}

#[tokio::test]
async fn connect_opens_a_stream_with_a_fresh_bearer() {
	let Fixture { connector, streams, issuer, .. } =
		fixture(Arc::new(ScriptedStreams::default()), ConnectorConfig::default());
	let connected = connector
		.connect("realtime-v1", json!({ "voice": "aria" }))
		.await
		.expect("The initial connect should succeed.");

	assert!(connected);
	assert_eq!(connector.phase(), ConnectionPhase::Connected);
	assert_eq!(issuer.mints(), 1);
	assert_eq!(streams.bearers.lock().as_slice(), ["scripted-token-1"]);

	// A second connect while already connected is a no-op.
	let reconnected = connector
		.connect("realtime-v1", json!({}))
		.await
		.expect("A redundant connect should not fail.");

	assert!(!reconnected);
	assert_eq!(issuer.mints(), 1);
}

#[tokio::test]
async fn credential_acquisition_failures_are_terminal() {
	let Fixture { connector, issuer, .. } =
		fixture(Arc::new(ScriptedStreams::default()), ConnectorConfig::default());

	issuer.set_failing(true);

	let err = connector
		.connect("realtime-v1", json!({}))
		.await
		.expect_err("Connecting without obtainable credentials should fail.");

	assert!(matches!(err, Error::AuthFailed { .. }), "{err:?}");
	assert_eq!(connector.phase(), ConnectionPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquisitions_share_one_mint() {
	let issuer = ScriptedIssuer::with_delay(StdDuration::from_millis(50));
	let authority = Arc::new(CredentialAuthority::new(issuer.clone(), IssuePolicy::default()));
	let connector = SessionConnector::new(
		SessionId::new("dedup-session").expect("Session identifier fixture should be valid."),
		authority,
		Arc::new(CredentialStore::new(StoreConfig::default())),
		Arc::new(ScriptedStreams::default()),
		ConnectorConfig::default(),
	);
	let (first, second) =
		tokio::join!(connector.acquire_credential(), connector.acquire_credential());
	let first = first.expect("The first concurrent acquisition should succeed.");
	let second = second.expect("The second concurrent acquisition should succeed.");

	assert_eq!(issuer.mints(), 1, "Concurrent acquisitions must share a single mint.");
	assert_eq!(first.value.expose(), second.value.expose());
}

#[tokio::test(start_paused = true)]
async fn dropped_streams_reconnect_with_exponential_backoff() {
	let streams = ScriptedStreams::failing_next(0);
	let Fixture { connector, observer, issuer, .. } = fixture(
		streams.clone(),
		ConnectorConfig {
			max_retries: 3,
			base_delay: StdDuration::from_secs(1),
			max_delay: StdDuration::from_secs(30),
			..Default::default()
		},
	);

	connector.connect("realtime-v1", json!({})).await.expect("Connect should succeed.");

	// Fail the next two reopen attempts, then let the third through.
	streams.fail_next.store(2, Ordering::SeqCst);
	streams.signal(StreamSignal::Closed { code: 1006, reason: "abnormal".into() });
	tokio::time::sleep(StdDuration::from_secs(60)).await;

	let events = observer.events();

	assert_eq!(
		events,
		vec![
			SessionEvent::Reconnecting { attempt: 1, max_attempts: 3 },
			SessionEvent::Reconnecting { attempt: 2, max_attempts: 3 },
			SessionEvent::Reconnecting { attempt: 3, max_attempts: 3 },
			SessionEvent::Reconnected,
		],
	);
	assert_eq!(connector.phase(), ConnectionPhase::Connected);
	// One mint per connect plus one rotation per reconnect attempt.
	assert_eq!(issuer.mints(), 4);
	// The reopened stream presents the latest rotation, not the original bearer.
	assert_eq!(
		streams.bearers.lock().last().map(String::as_str),
		Some("scripted-token-4"),
	);
}

#[tokio::test(start_paused = true)]
async fn reconnection_gives_up_after_the_retry_ceiling() {
	let streams = ScriptedStreams::failing_next(0);
	let Fixture { connector, observer, .. } = fixture(
		streams.clone(),
		ConnectorConfig {
			max_retries: 2,
			base_delay: StdDuration::from_millis(100),
			..Default::default()
		},
	);

	connector.connect("realtime-v1", json!({})).await.expect("Connect should succeed.");
	assert!(connector.take_last_error().is_none());

	streams.fail_next.store(u32::MAX, Ordering::SeqCst);
	streams.signal(StreamSignal::Closed { code: 1006, reason: "abnormal".into() });
	tokio::time::sleep(StdDuration::from_secs(10)).await;

	let events = observer.events();

	assert_eq!(
		events,
		vec![
			SessionEvent::Reconnecting { attempt: 1, max_attempts: 2 },
			SessionEvent::Reconnecting { attempt: 2, max_attempts: 2 },
			SessionEvent::ReconnectFailed { attempts: 2 },
		],
	);
	assert_eq!(connector.phase(), ConnectionPhase::Disconnected);

	// An established stream that could not be recovered is exhaustion.
	let error = connector.take_last_error().expect("Exhaustion should leave a terminal error.");

	assert!(matches!(error, Error::ReconnectExhausted { attempts: 2 }), "{error:?}");
	// Taking the error clears it.
	assert!(connector.take_last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn sessions_that_never_establish_fail_as_connect_failures() {
	let streams = ScriptedStreams::failing_next(u32::MAX);
	let Fixture { connector, .. } = fixture(
		streams.clone(),
		ConnectorConfig {
			max_retries: 2,
			base_delay: StdDuration::from_millis(100),
			..Default::default()
		},
	);
	let connected = connector
		.connect("realtime-v1", json!({}))
		.await
		.expect("A failed open should schedule reconnection rather than error.");

	assert!(!connected);

	tokio::time::sleep(StdDuration::from_secs(10)).await;

	let error = connector.take_last_error().expect("Exhaustion should leave a terminal error.");

	assert!(matches!(error, Error::ConnectFailed { attempts: 2 }), "{error:?}");
	assert_eq!(connector.phase(), ConnectionPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn credentials_rotate_ahead_of_expiry() {
	let Fixture { connector, observer, issuer, .. } =
		fixture(Arc::new(ScriptedStreams::default()), ConnectorConfig::default());

	connector.connect("realtime-v1", json!({})).await.expect("Connect should succeed.");
	assert_eq!(issuer.mints(), 1);

	// Default policy: 30-minute credentials rotated 5 minutes before expiry.
	tokio::time::sleep(StdDuration::from_secs(26 * 60)).await;

	assert_eq!(issuer.mints(), 2);
	assert_eq!(connector.phase(), ConnectionPhase::Connected);
	assert!(
		observer
			.events()
			.iter()
			.any(|event| matches!(event, SessionEvent::TokenRefreshed { .. })),
	);
}

#[tokio::test(start_paused = true)]
async fn failed_rotation_falls_back_to_reconnection() {
	let streams = Arc::new(ScriptedStreams::default());
	let Fixture { connector, observer, issuer, .. } = fixture(
		streams.clone(),
		ConnectorConfig { base_delay: StdDuration::from_millis(100), ..Default::default() },
	);

	connector.connect("realtime-v1", json!({})).await.expect("Connect should succeed.");
	issuer.set_failing(true);
	tokio::time::sleep(StdDuration::from_secs(26 * 60)).await;

	let events = observer.events();

	assert!(events.contains(&SessionEvent::TokenExpired), "{events:?}");
	assert!(
		events.iter().any(|event| matches!(event, SessionEvent::ReconnectFailed { .. })),
		"{events:?}",
	);
	assert_eq!(connector.phase(), ConnectionPhase::Disconnected);
}

#[tokio::test]
async fn clean_closure_and_disconnect_are_idempotent() {
	let streams = Arc::new(ScriptedStreams::default());
	let Fixture { connector, observer, .. } =
		fixture(streams.clone(), ConnectorConfig::default());

	connector.connect("realtime-v1", json!({})).await.expect("Connect should succeed.");
	connector.disconnect();
	connector.disconnect();

	let events = observer.events();

	assert_eq!(events, vec![SessionEvent::Disconnected]);
	assert_eq!(connector.phase(), ConnectionPhase::Disconnected);
	assert!(
		streams.closed_flags.lock()[0].load(Ordering::SeqCst),
		"Disconnect should close the underlying stream.",
	);
	assert!(connector.credential_expires_at().is_none());
}

#[tokio::test(start_paused = true)]
async fn signals_landing_after_disconnect_cannot_revive_the_session() {
	let streams = Arc::new(ScriptedStreams::default());
	let Fixture { connector, observer, issuer, .. } =
		fixture(streams.clone(), ConnectorConfig::default());

	connector.connect("realtime-v1", json!({})).await.expect("Connect should succeed.");
	connector.disconnect();

	// Signal dispatch goes through spawned tasks, so a signal emitted just
	// before the stream closed can still be delivered afterwards.
	streams.signal(StreamSignal::Closed { code: 1006, reason: "late delivery".into() });
	streams.signal(StreamSignal::Fault { message: "401 unauthorized".into() });
	tokio::time::sleep(StdDuration::from_secs(60)).await;

	assert_eq!(connector.phase(), ConnectionPhase::Disconnected);
	assert_eq!(issuer.mints(), 1, "A torn-down session must not reacquire credentials.");
	assert_eq!(streams.opens.load(Ordering::SeqCst), 1, "No stream may reopen after disconnect.");
	assert_eq!(observer.events(), vec![SessionEvent::Disconnected]);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_rotation_discards_the_result() {
	let issuer = ScriptedIssuer::with_delay(StdDuration::from_millis(50));
	let authority = Arc::new(CredentialAuthority::new(issuer.clone(), IssuePolicy::default()));
	let connector = SessionConnector::new(
		SessionId::new("rotation-session").expect("Session identifier fixture should be valid."),
		authority,
		Arc::new(CredentialStore::new(StoreConfig::default())),
		Arc::new(ScriptedStreams::default()),
		ConnectorConfig::default(),
	);
	let observer = Arc::new(RecordingObserver::default());

	connector.subscribe(observer.clone());
	connector.connect("realtime-v1", json!({})).await.expect("Connect should succeed.");

	let rotating = tokio::spawn({
		let connector = connector.clone();

		async move { connector.refresh_credential().await }
	});

	// Tear the session down while the rotation is awaiting the issuer.
	tokio::time::sleep(StdDuration::from_millis(10)).await;
	connector.disconnect();
	rotating.await.expect("The rotation task should run to completion.");

	assert_eq!(connector.phase(), ConnectionPhase::Disconnected);
	assert!(connector.credential_expires_at().is_none());
	assert!(
		!observer
			.events()
			.iter()
			.any(|event| matches!(event, SessionEvent::TokenRefreshed { .. })),
		"A rotation finishing after disconnect must not re-arm the session.",
	);
}
