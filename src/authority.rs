//! Credential authority: issuance quotas, usage accounting, rotation, and sweeps.
//!
//! [`CredentialAuthority`] owns the per-session ledger. Issuance validates the
//! caller's constraints, checks the session quota, mints through the
//! [`TokenIssuer`] seam, and re-verifies the quota inside the final write lock
//! so interleaved issues can never push a session past its budget. `consume`
//! is the only mutation path for usage counting and performs its
//! decrement-and-check in one critical section per credential id. Rotation and
//! revocation exhaust credentials instead of deleting them; the periodic sweep
//! is the only removal path and touches nothing that is still live.

mod metrics;

pub use metrics::AuthorityMetrics;

// self
use crate::{
	_prelude::*,
	auth::{Credential, CredentialId, ScopeSet, SessionId},
	error::{ConfigError, CredentialFault},
	issuer::{MintRequest, TokenIssuer},
	obs::{self, OpKind, OpOutcome, OpSpan},
};

/// Inclusive bounds for the per-credential usage budget.
pub const USES_RANGE: std::ops::RangeInclusive<u32> = 1..=5;
/// Inclusive bounds (minutes) for the credential time-to-live.
pub const TTL_MINUTES_RANGE: std::ops::RangeInclusive<i64> = 1..=30;

/// Issuance policy applied to every session the authority manages.
#[derive(Clone, Debug)]
pub struct IssuePolicy {
	/// Usage budget applied when a request does not specify one.
	pub default_uses: u32,
	/// Time-to-live applied when a request does not specify one.
	pub default_ttl: Duration,
	/// Scopes granted when a request does not specify any.
	pub default_scope: ScopeSet,
	/// Maximum number of concurrently valid credentials per session.
	pub max_credentials_per_session: usize,
	/// How long an invalid credential must stay idle before a sweep removes it.
	pub cleanup_grace: Duration,
}
impl Default for IssuePolicy {
	fn default() -> Self {
		Self {
			default_uses: 1,
			default_ttl: Duration::minutes(30),
			default_scope: ScopeSet::default(),
			max_credentials_per_session: 3,
			cleanup_grace: Duration::minutes(5),
		}
	}
}

/// Caller-supplied constraints for `issue` and `rotate`.
#[derive(Clone, Debug, Default)]
pub struct IssueOptions {
	/// Target session; a fresh one is generated when omitted.
	pub session: Option<SessionId>,
	/// Usage budget within [`USES_RANGE`].
	pub uses: Option<u32>,
	/// Time-to-live in minutes within [`TTL_MINUTES_RANGE`].
	pub ttl_minutes: Option<i64>,
	/// Scopes to grant; falls back to the policy default.
	pub scope: Option<ScopeSet>,
}
impl IssueOptions {
	/// Pins the options to an existing session.
	pub fn for_session(session: SessionId) -> Self {
		Self { session: Some(session), ..Default::default() }
	}

	/// Overrides the usage budget.
	pub fn with_uses(mut self, uses: u32) -> Self {
		self.uses = Some(uses);

		self
	}

	/// Overrides the time-to-live in minutes.
	pub fn with_ttl_minutes(mut self, minutes: i64) -> Self {
		self.ttl_minutes = Some(minutes);

		self
	}

	/// Overrides the granted scopes.
	pub fn with_scope(mut self, scope: ScopeSet) -> Self {
		self.scope = Some(scope);

		self
	}
}

/// Point-in-time view of one session's ledger entry.
#[derive(Clone, Debug)]
pub struct SessionStatus {
	/// Session the snapshot describes.
	pub session: SessionId,
	/// Credentials currently valid for the session.
	pub active_count: usize,
	/// Credentials issued over the session's lifetime.
	pub total_issued: u64,
	/// Most recent issuance or consumption instant.
	pub last_activity: Option<OffsetDateTime>,
	/// Expiry of the freshest valid credential, if any.
	pub expires_at: Option<OffsetDateTime>,
	/// Usage budget of the freshest valid credential, if any.
	pub uses_remaining: Option<u32>,
}

/// Aggregate counters for the service-stats surface.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorityStats {
	/// Sessions currently tracked by the ledger.
	pub sessions: usize,
	/// Credentials currently tracked (including exhausted audit entries).
	pub tracked_credentials: usize,
	/// Total credentials minted.
	pub issued: u64,
	/// Total successful consumptions.
	pub consumed: u64,
	/// Total rotation passes.
	pub rotated: u64,
	/// Total revocations.
	pub revoked: u64,
	/// Parameter/quota rejections.
	pub rejected: u64,
	/// Credential-state faults observed by `consume`.
	pub faulted: u64,
	/// Credentials removed by sweeps.
	pub swept: u64,
}

#[derive(Debug, Default)]
struct SessionRecord {
	tracked: Vec<CredentialId>,
	total_issued: u64,
	last_activity: Option<OffsetDateTime>,
}

#[derive(Debug, Default)]
struct Ledger {
	credentials: HashMap<CredentialId, Credential>,
	sessions: HashMap<SessionId, SessionRecord>,
}
impl Ledger {
	fn valid_count(&self, session: &SessionId, now: OffsetDateTime) -> usize {
		self.sessions
			.get(session)
			.map(|record| {
				record
					.tracked
					.iter()
					.filter_map(|id| self.credentials.get(id))
					.filter(|credential| credential.is_valid_at(now))
					.count()
			})
			.unwrap_or(0)
	}
}

/// Issues, tracks, and retires ephemeral credentials against session quotas.
pub struct CredentialAuthority {
	issuer: Arc<dyn TokenIssuer>,
	policy: IssuePolicy,
	ledger: RwLock<Ledger>,
	metrics: Arc<AuthorityMetrics>,
}
impl CredentialAuthority {
	/// Creates an authority backed by the provided issuer and policy.
	pub fn new(issuer: Arc<dyn TokenIssuer>, policy: IssuePolicy) -> Self {
		Self { issuer, policy, ledger: RwLock::new(Ledger::default()), metrics: Default::default() }
	}

	/// Issuance policy in force.
	pub fn policy(&self) -> &IssuePolicy {
		&self.policy
	}

	/// Shared metrics recorder.
	pub fn metrics(&self) -> &Arc<AuthorityMetrics> {
		&self.metrics
	}

	/// Issues a fresh credential, enforcing parameter ranges and the session quota.
	pub async fn issue(&self, options: IssueOptions) -> Result<Credential> {
		self.issue_at(options, OffsetDateTime::now_utc()).await
	}

	/// Clock-injected variant of [`issue`](Self::issue).
	pub async fn issue_at(&self, options: IssueOptions, now: OffsetDateTime) -> Result<Credential> {
		const KIND: OpKind = OpKind::Issue;

		let span = OpSpan::new(KIND, "issue");

		obs::record_op_outcome(KIND, OpOutcome::Attempt);

		let result = span.instrument(self.issue_inner(options, now)).await;

		match &result {
			Ok(_) => obs::record_op_outcome(KIND, OpOutcome::Success),
			Err(_) => obs::record_op_outcome(KIND, OpOutcome::Failure),
		}

		result
	}

	async fn issue_inner(&self, options: IssueOptions, now: OffsetDateTime) -> Result<Credential> {
		let uses = options.uses.unwrap_or(self.policy.default_uses);

		if !USES_RANGE.contains(&uses) {
			self.metrics.record_rejected();

			return Err(Error::InvalidParams {
				reason: format!(
					"uses must be between {} and {}, got {uses}",
					USES_RANGE.start(),
					USES_RANGE.end()
				),
			});
		}

		let ttl = match options.ttl_minutes {
			Some(minutes) if !TTL_MINUTES_RANGE.contains(&minutes) => {
				self.metrics.record_rejected();

				return Err(Error::InvalidParams {
					reason: format!(
						"expiration must be between {} and {} minutes, got {minutes}",
						TTL_MINUTES_RANGE.start(),
						TTL_MINUTES_RANGE.end()
					),
				});
			},
			Some(minutes) => Duration::minutes(minutes),
			None => self.policy.default_ttl,
		};
		let session = options.session.unwrap_or_else(SessionId::generate);
		let scope = options.scope.unwrap_or_else(|| self.policy.default_scope.clone());

		// Early quota check keeps hopeless requests off the issuer; the
		// binding check happens again under the write lock below.
		if self.ledger.read().valid_count(&session, now)
			>= self.policy.max_credentials_per_session
		{
			self.metrics.record_rejected();

			return Err(Error::SessionQuotaExceeded {
				session: session.to_string(),
				limit: self.policy.max_credentials_per_session,
			});
		}

		let minted =
			self.issuer.mint(MintRequest { uses, expire_time: now + ttl }).await?;
		let credential = Credential::builder(session.clone(), scope)
			.value(minted.name.expose())
			.uses(uses)
			.created_at(now)
			.expires_at(now + ttl)
			.build()
			.map_err(ConfigError::from)?;
		let id = credential.id();

		{
			let mut ledger = self.ledger.write();

			if ledger.valid_count(&session, now) >= self.policy.max_credentials_per_session {
				self.metrics.record_rejected();

				return Err(Error::SessionQuotaExceeded {
					session: session.to_string(),
					limit: self.policy.max_credentials_per_session,
				});
			}

			let record = ledger.sessions.entry(session).or_default();

			record.tracked.push(id.clone());
			record.total_issued += 1;
			record.last_activity = Some(now);
			ledger.credentials.insert(id, credential.clone());
		}

		self.metrics.record_issued();

		Ok(credential)
	}

	/// Exhausts every credential the session currently holds, then issues a
	/// replacement. Superseded records stay in the ledger for auditing.
	pub async fn rotate(
		&self,
		session: &SessionId,
		options: IssueOptions,
	) -> Result<Credential> {
		self.rotate_at(session, options, OffsetDateTime::now_utc()).await
	}

	/// Clock-injected variant of [`rotate`](Self::rotate).
	pub async fn rotate_at(
		&self,
		session: &SessionId,
		options: IssueOptions,
		now: OffsetDateTime,
	) -> Result<Credential> {
		const KIND: OpKind = OpKind::Rotate;

		let span = OpSpan::new(KIND, "rotate");

		obs::record_op_outcome(KIND, OpOutcome::Attempt);

		let result = span
			.instrument(async move {
				{
					let mut ledger = self.ledger.write();

					if let Some(record) = ledger.sessions.get(session) {
						let ids = record.tracked.clone();

						for id in ids {
							if let Some(credential) = ledger.credentials.get_mut(&id) {
								credential.exhaust(now);
							}
						}
					}
					if let Some(record) = ledger.sessions.get_mut(session) {
						record.last_activity = Some(now);
					}
				}

				self.metrics.record_rotated();
				self.issue_inner(
					IssueOptions { session: Some(session.clone()), ..options },
					now,
				)
				.await
			})
			.await;

		match &result {
			Ok(_) => obs::record_op_outcome(KIND, OpOutcome::Success),
			Err(_) => obs::record_op_outcome(KIND, OpOutcome::Failure),
		}

		result
	}

	/// Validates a presented bearer value and decrements its usage budget.
	pub fn consume(&self, value: &str) -> Result<Credential> {
		self.consume_at(value, OffsetDateTime::now_utc())
	}

	/// Clock-injected variant of [`consume`](Self::consume).
	///
	/// The lookup, validity check, and decrement happen under one write lock,
	/// so two consumers of the same credential can never both succeed past the
	/// final use.
	pub fn consume_at(&self, value: &str, now: OffsetDateTime) -> Result<Credential> {
		let _span = OpSpan::new(OpKind::Consume, "consume").entered();
		let id = CredentialId::derive(value);
		let mut ledger = self.ledger.write();
		let Some(credential) = ledger.credentials.get_mut(&id) else {
			self.metrics.record_faulted();

			return Err(CredentialFault::NotFound.into());
		};

		if credential.is_expired_at(now) {
			self.metrics.record_faulted();

			return Err(CredentialFault::Expired.into());
		}
		if credential.is_exhausted() {
			self.metrics.record_faulted();

			return Err(CredentialFault::UsesExhausted.into());
		}

		credential.uses_remaining -= 1;
		credential.last_used_at = Some(now);

		let consumed = credential.clone();

		if let Some(record) = ledger.sessions.get_mut(&consumed.session) {
			record.last_activity = Some(now);
		}

		drop(ledger);
		self.metrics.record_consumed();
		obs::record_op_outcome(OpKind::Consume, OpOutcome::Success);

		Ok(consumed)
	}

	/// Point-in-time status for a session, if the ledger knows it.
	pub fn status(&self, session: &SessionId) -> Option<SessionStatus> {
		self.status_at(session, OffsetDateTime::now_utc())
	}

	/// Clock-injected variant of [`status`](Self::status).
	pub fn status_at(&self, session: &SessionId, now: OffsetDateTime) -> Option<SessionStatus> {
		let ledger = self.ledger.read();
		let record = ledger.sessions.get(session)?;
		let freshest = record
			.tracked
			.iter()
			.filter_map(|id| ledger.credentials.get(id))
			.filter(|credential| credential.is_valid_at(now))
			.max_by_key(|credential| credential.created_at);

		Some(SessionStatus {
			session: session.clone(),
			active_count: ledger.valid_count(session, now),
			total_issued: record.total_issued,
			last_activity: record.last_activity,
			expires_at: freshest.map(|credential| credential.expires_at),
			uses_remaining: freshest.map(|credential| credential.uses_remaining),
		})
	}

	/// Exhausts every valid credential for the session; returns how many were hit.
	pub fn revoke(&self, session: &SessionId) -> usize {
		self.revoke_at(session, OffsetDateTime::now_utc())
	}

	/// Clock-injected variant of [`revoke`](Self::revoke).
	pub fn revoke_at(&self, session: &SessionId, now: OffsetDateTime) -> usize {
		let mut ledger = self.ledger.write();
		let Some(record) = ledger.sessions.get(session) else {
			return 0;
		};
		let ids = record.tracked.clone();
		let mut revoked = 0;

		for id in ids {
			if let Some(credential) = ledger.credentials.get_mut(&id)
				&& credential.is_valid_at(now)
			{
				credential.exhaust(now);

				revoked += 1;
			}
		}
		if let Some(record) = ledger.sessions.get_mut(session) {
			record.last_activity = Some(now);
		}

		drop(ledger);
		self.metrics.record_revoked(revoked as u64);

		revoked
	}

	/// Removes credentials that are invalid and past the idle grace period.
	pub fn sweep(&self) -> usize {
		self.sweep_at(OffsetDateTime::now_utc())
	}

	/// Clock-injected variant of [`sweep`](Self::sweep).
	///
	/// Operates on the removal path only: live entries are never mutated, so
	/// the sweep is safe to run concurrently with issuance and consumption.
	pub fn sweep_at(&self, now: OffsetDateTime) -> usize {
		let _span = OpSpan::new(OpKind::Sweep, "sweep").entered();
		let grace = self.policy.cleanup_grace;
		let mut ledger = self.ledger.write();
		let removable: Vec<CredentialId> = ledger
			.credentials
			.iter()
			.filter(|(_, credential)| {
				(credential.is_expired_at(now) || credential.is_exhausted())
					&& now - credential.last_activity() >= grace
			})
			.map(|(id, _)| id.clone())
			.collect();

		for id in &removable {
			ledger.credentials.remove(id);
		}
		for record in ledger.sessions.values_mut() {
			record.tracked.retain(|id| !removable.contains(id));
		}

		ledger.sessions.retain(|_, record| {
			!record.tracked.is_empty()
				|| record.last_activity.is_none_or(|instant| now - instant < grace)
		});

		drop(ledger);
		self.metrics.record_swept(removable.len() as u64);
		obs::record_op_outcome(OpKind::Sweep, OpOutcome::Success);

		removable.len()
	}

	/// Spawns the periodic sweep task; abort the handle to stop it.
	pub fn spawn_sweeper(
		self: &Arc<Self>,
		interval: std::time::Duration,
	) -> tokio::task::JoinHandle<()> {
		let authority = self.clone();

		tokio::spawn(async move {
			loop {
				tokio::time::sleep(interval).await;
				authority.sweep();
			}
		})
	}

	/// Aggregate counters for the service-stats surface.
	pub fn stats(&self) -> AuthorityStats {
		let ledger = self.ledger.read();

		AuthorityStats {
			sessions: ledger.sessions.len(),
			tracked_credentials: ledger.credentials.len(),
			issued: self.metrics.issued(),
			consumed: self.metrics.consumed(),
			rotated: self.metrics.rotated(),
			revoked: self.metrics.revoked(),
			rejected: self.metrics.rejected(),
			faulted: self.metrics.faulted(),
			swept: self.metrics.swept(),
		}
	}
}
impl Debug for CredentialAuthority {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CredentialAuthority").field("policy", &self.policy).finish()
	}
}
