// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for broker activity.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
	attempts: AtomicU64,
	issued: AtomicU64,
	failure: AtomicU64,
	reset: AtomicU64,
	abandoned: AtomicU64,
}
impl BrokerMetrics {
	/// Returns the total number of issuer calls, retries included.
	pub fn attempts(&self) -> u64 {
		self.attempts.load(Ordering::Relaxed)
	}

	/// Returns the number of credentials handed to waiters.
	pub fn issued(&self) -> u64 {
		self.issued.load(Ordering::Relaxed)
	}

	/// Returns the number of waiters rejected after exhausting retries.
	pub fn failures(&self) -> u64 {
		self.failure.load(Ordering::Relaxed)
	}

	/// Returns the number of waiters failed by resets or shutdown.
	pub fn resets(&self) -> u64 {
		self.reset.load(Ordering::Relaxed)
	}

	/// Returns the number of waiters whose caller left before being served.
	pub fn abandoned(&self) -> u64 {
		self.abandoned.load(Ordering::Relaxed)
	}

	pub(crate) fn record_attempt(&self) {
		self.attempts.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_issued(&self) {
		self.issued.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_failure(&self) {
		self.failure.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_resets(&self, count: u64) {
		self.reset.fetch_add(count, Ordering::Relaxed);
	}

	pub(crate) fn record_abandoned(&self) {
		self.abandoned.fetch_add(1, Ordering::Relaxed);
	}
}
