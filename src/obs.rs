//! Optional observability helpers for broker operations.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `ephemeral_broker.op` with the `op` and
//!   `stage` (call site) fields.
//! - Enable `metrics` to increment the `ephemeral_broker_op_total` counter for every
//!   attempt/success/failure, labeled by `op` + `outcome`.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Broker operations observed by the instrumentation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
	/// Credential issuance.
	Issue,
	/// Session-wide credential rotation.
	Rotate,
	/// Usage-counted credential consumption.
	Consume,
	/// Proactive credential refresh driven by the connector.
	Refresh,
	/// Initial streaming-session connect.
	Connect,
	/// Backoff-driven reconnection.
	Reconnect,
	/// Periodic stale-entry sweep.
	Sweep,
}
impl OpKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			OpKind::Issue => "issue",
			OpKind::Rotate => "rotate",
			OpKind::Consume => "consume",
			OpKind::Refresh => "refresh",
			OpKind::Connect => "connect",
			OpKind::Reconnect => "reconnect",
			OpKind::Sweep => "sweep",
		}
	}
}
impl Display for OpKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpOutcome {
	/// Entry to a broker operation.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl OpOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			OpOutcome::Attempt => "attempt",
			OpOutcome::Success => "success",
			OpOutcome::Failure => "failure",
		}
	}
}
impl Display for OpOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
