//! Optional observability helpers shared by every component.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `lookup_broker.op` with the `component` and
//!   `stage` (call site) fields, plus debug/warn events for retries, evictions, and cleanup
//!   failures.
//! - Enable `metrics` to increment the `lookup_broker_op_total` counter for every
//!   attempt/success/failure/rejection, labeled by `component` + `outcome`.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Components observed by the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
	/// Credential broker queue and drain worker.
	CredentialBroker,
	/// In-flight request deduplicator.
	Deduplicator,
	/// Batch coordinator.
	BatchCoordinator,
	/// Memory-pressure monitor.
	ResourceMonitor,
}
impl Component {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Component::CredentialBroker => "credential_broker",
			Component::Deduplicator => "deduplicator",
			Component::BatchCoordinator => "batch_coordinator",
			Component::ResourceMonitor => "resource_monitor",
		}
	}
}
impl Display for Component {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
	/// Entry to a component operation.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
	/// Request turned away before any work started.
	Rejected,
}
impl Outcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Outcome::Attempt => "attempt",
			Outcome::Success => "success",
			Outcome::Failure => "failure",
			Outcome::Rejected => "rejected",
		}
	}

	/// Maps a result to [`Outcome::Success`] or [`Outcome::Failure`].
	pub fn of<T>(result: &Result<T>) -> Self {
		if result.is_ok() { Outcome::Success } else { Outcome::Failure }
	}
}
impl Display for Outcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
