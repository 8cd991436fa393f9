// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for deduplicator activity.
#[derive(Debug, Default)]
pub struct DedupMetrics {
	started: AtomicU64,
	joined: AtomicU64,
	rejected: AtomicU64,
	timed_out: AtomicU64,
}
impl DedupMetrics {
	/// Returns the number of operations actually started.
	pub fn started(&self) -> u64 {
		self.started.load(Ordering::Relaxed)
	}

	/// Returns the number of calls served by an operation another caller started.
	pub fn joined(&self) -> u64 {
		self.joined.load(Ordering::Relaxed)
	}

	/// Returns the number of calls turned away at capacity.
	pub fn rejected(&self) -> u64 {
		self.rejected.load(Ordering::Relaxed)
	}

	/// Returns the number of operations that exceeded their timeout.
	pub fn timed_out(&self) -> u64 {
		self.timed_out.load(Ordering::Relaxed)
	}

	pub(crate) fn record_started(&self) {
		self.started.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_joined(&self) {
		self.joined.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_rejected(&self) {
		self.rejected.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_timed_out(&self) {
		self.timed_out.fetch_add(1, Ordering::Relaxed);
	}
}
