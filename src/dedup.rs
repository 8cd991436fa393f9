//! Single-flight execution keyed by request fingerprints.
//!
//! [`RequestDeduplicator::execute`] attaches callers with the same [`RequestKey`] to one
//! in-flight operation; every attached caller observes the same value or the same error. The
//! number of distinct keys in flight is capped: low-priority requests are turned away at the
//! cap, everything else waits for a slot on a counting semaphore for a bounded time.
//!
//! Operations run on a spawned task, so an entry settles (and leaves the table) even when
//! all of its callers stop waiting.

mod metrics;

pub use metrics::DedupMetrics;

// std
use std::{
	panic::AssertUnwindSafe,
	sync::{
		Weak,
		atomic::{AtomicU64, Ordering},
	},
};
// crates.io
use async_lock::SemaphoreGuardArc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
// self
use crate::{
	_prelude::*,
	auth::RequestKey,
	error::ConfigError,
	obs::{self, Component, OpSpan, Outcome},
};

const COMPONENT: Component = Component::Deduplicator;

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Operation panicked before producing an outcome.
#[derive(Debug, ThisError)]
#[error("Operation for `{key}` panicked before settling.")]
pub struct OperationAborted {
	/// Key of the aborted operation.
	pub key: String,
}

/// Limits applied by a [`RequestDeduplicator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DedupConfig {
	/// Maximum number of distinct keys in flight at once.
	pub max_in_flight: usize,
	/// Timeout applied when [`ExecuteOptions::timeout`] is unset.
	pub default_timeout: Duration,
	/// Longest a non-low-priority request waits for a free slot.
	pub max_slot_wait: Duration,
}
impl DedupConfig {
	/// Rejects configurations that could never admit a request.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.max_in_flight == 0 {
			return Err(ConfigError::invalid("max_in_flight", "must be at least 1"));
		}
		if self.default_timeout.is_zero() {
			return Err(ConfigError::invalid("default_timeout", "must be greater than zero"));
		}

		Ok(())
	}
}
impl Default for DedupConfig {
	fn default() -> Self {
		Self {
			max_in_flight: 10,
			default_timeout: Duration::from_secs(30),
			max_slot_wait: Duration::from_secs(5),
		}
	}
}

/// Scheduling priority of a request when the in-flight cap is reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	/// Rejected immediately at capacity.
	Low,
	/// Waits for a slot.
	#[default]
	Normal,
	/// Waits for a slot.
	High,
}

/// Per-call options for [`RequestDeduplicator::execute`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
	/// Overrides [`DedupConfig::default_timeout`] when this call starts the operation.
	pub timeout: Option<Duration>,
	/// Behavior at capacity.
	pub priority: Priority,
}
impl ExecuteOptions {
	/// Options for a low-priority call.
	pub fn low() -> Self {
		Self { priority: Priority::Low, ..Self::default() }
	}

	/// Overrides the operation timeout.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);

		self
	}

	/// Overrides the priority.
	pub fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;

		self
	}
}

/// Point-in-time view of the deduplicator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DedupSnapshot {
	/// Keys currently in flight.
	pub in_flight: usize,
	/// Configured cap.
	pub capacity: usize,
	/// Operations started.
	pub started: u64,
	/// Calls that attached to an existing operation.
	pub joined: u64,
	/// Calls turned away at capacity (immediately or after waiting).
	pub rejected: u64,
	/// Operations that lost the race against their timeout.
	pub timed_out: u64,
}

/// Collapses concurrent identical requests into one in-flight operation.
pub struct RequestDeduplicator<T>
where
	T: 'static + Clone + Send + Sync,
{
	shared: Arc<DedupShared<T>>,
}
impl<T> RequestDeduplicator<T>
where
	T: 'static + Clone + Send + Sync,
{
	/// Creates a deduplicator with the provided limits.
	pub fn new(config: DedupConfig) -> Result<Self, ConfigError> {
		config.validate()?;

		Ok(Self {
			shared: Arc::new(DedupShared {
				config,
				entries: Mutex::new(HashMap::new()),
				slots: Arc::new(Semaphore::new(config.max_in_flight)),
				metrics: DedupMetrics::default(),
				next_entry: AtomicU64::new(1),
			}),
		})
	}

	/// Runs `operation` for `key`, or attaches to the operation already in flight for it.
	///
	/// `operation` is only invoked when this call starts a new entry.
	pub async fn execute<F, Fut>(
		&self,
		key: RequestKey,
		operation: F,
		options: ExecuteOptions,
	) -> Result<T>
	where
		F: 'static + Send + FnOnce() -> Fut,
		Fut: 'static + Send + Future<Output = Result<T>>,
	{
		let span = OpSpan::new(COMPONENT, "execute");

		obs::record_outcome(COMPONENT, Outcome::Attempt);

		let result = span.instrument(self.execute_inner(key, operation, options)).await;
		let outcome = match &result {
			Err(Error::CapacityExceeded { .. } | Error::SlotWaitTimeout { .. }) =>
				Outcome::Rejected,
			other => Outcome::of(other),
		};

		obs::record_outcome(COMPONENT, outcome);

		result
	}

	/// Number of keys currently in flight.
	pub fn in_flight(&self) -> usize {
		self.shared.entries.lock().len()
	}

	/// Returns `true` while an operation for `key` is unsettled.
	pub fn is_in_flight(&self, key: &str) -> bool {
		self.shared.entries.lock().contains_key(key)
	}

	/// Returns the deduplicator's counters.
	pub fn metrics(&self) -> &DedupMetrics {
		&self.shared.metrics
	}

	/// Captures the table size and counters.
	pub fn snapshot(&self) -> DedupSnapshot {
		let metrics = &self.shared.metrics;

		DedupSnapshot {
			in_flight: self.in_flight(),
			capacity: self.shared.config.max_in_flight,
			started: metrics.started(),
			joined: metrics.joined(),
			rejected: metrics.rejected(),
			timed_out: metrics.timed_out(),
		}
	}

	async fn execute_inner<F, Fut>(
		&self,
		key: RequestKey,
		operation: F,
		options: ExecuteOptions,
	) -> Result<T>
	where
		F: 'static + Send + FnOnce() -> Fut,
		Fut: 'static + Send + Future<Output = Result<T>>,
	{
		if let Some(outcome) = self.join(&key) {
			return outcome.await;
		}

		let permit = self.acquire_slot(&key, options.priority).await?;
		let timeout = options.timeout.unwrap_or(self.shared.config.default_timeout);
		let (outcome, started) = {
			let mut entries = self.shared.entries.lock();

			// Another caller may have started this key while we waited for a slot.
			if let Some(entry) = entries.get(&key) {
				self.shared.metrics.record_joined();

				(entry.outcome.clone(), false)
			} else {
				let id = self.shared.next_entry.fetch_add(1, Ordering::Relaxed);
				let outcome = DedupShared::launch(
					Arc::downgrade(&self.shared),
					id,
					key.clone(),
					operation,
					timeout,
					permit,
				);

				entries.insert(key, InFlightEntry { id, outcome: outcome.clone() });
				self.shared.metrics.record_started();

				(outcome, true)
			}
		};

		if started {
			tokio::spawn(outcome.clone());
		}

		outcome.await
	}

	fn join(&self, key: &RequestKey) -> Option<SharedOutcome<T>> {
		let outcome = self.shared.entries.lock().get(key).map(|entry| entry.outcome.clone())?;

		self.shared.metrics.record_joined();

		Some(outcome)
	}

	async fn acquire_slot(&self, key: &RequestKey, priority: Priority) -> Result<SemaphoreGuardArc> {
		if let Some(permit) = self.shared.slots.try_acquire_arc() {
			return Ok(permit);
		}

		let limit = self.shared.config.max_in_flight;

		if priority == Priority::Low {
			self.shared.metrics.record_rejected();
			obs::event!(debug, key = %key, limit, "deduplicator at capacity; rejecting low priority");

			return Err(Error::CapacityExceeded { key: key.to_string(), limit });
		}

		let waited = self.shared.config.max_slot_wait;

		match tokio::time::timeout(waited, self.shared.slots.acquire_arc()).await {
			Ok(permit) => Ok(permit),
			Err(_) => {
				self.shared.metrics.record_rejected();

				Err(Error::SlotWaitTimeout { key: key.to_string(), waited })
			},
		}
	}
}
impl<T> Clone for RequestDeduplicator<T>
where
	T: 'static + Clone + Send + Sync,
{
	fn clone(&self) -> Self {
		Self { shared: self.shared.clone() }
	}
}
impl<T> Debug for RequestDeduplicator<T>
where
	T: 'static + Clone + Send + Sync,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RequestDeduplicator")
			.field("config", &self.shared.config)
			.field("snapshot", &self.snapshot())
			.finish()
	}
}

struct DedupShared<T>
where
	T: 'static + Clone + Send + Sync,
{
	config: DedupConfig,
	entries: Mutex<HashMap<RequestKey, InFlightEntry<T>>>,
	slots: Arc<Semaphore>,
	metrics: DedupMetrics,
	next_entry: AtomicU64,
}
impl<T> DedupShared<T>
where
	T: 'static + Clone + Send + Sync,
{
	fn launch<F, Fut>(
		this: Weak<Self>,
		id: u64,
		key: RequestKey,
		operation: F,
		timeout: Duration,
		permit: SemaphoreGuardArc,
	) -> SharedOutcome<T>
	where
		F: 'static + Send + FnOnce() -> Fut,
		Fut: 'static + Send + Future<Output = Result<T>>,
	{
		async move {
			let _permit = permit;
			let guarded = AssertUnwindSafe(async move { operation().await }).catch_unwind();
			let outcome = match tokio::time::timeout(timeout, guarded).await {
				Ok(Ok(outcome)) => outcome,
				Ok(Err(_)) => {
					obs::event!(warn, key = %key, "deduplicated operation panicked");

					Err(Error::operation(OperationAborted { key: key.to_string() }))
				},
				Err(_) => Err(Error::OperationTimeout { key: key.to_string(), after: timeout }),
			};

			// Removal precedes both the slot release and the fan-out to attached callers.
			if let Some(shared) = this.upgrade() {
				shared.settle(&key, id, &outcome);
			}

			outcome
		}
		.boxed()
		.shared()
	}

	fn settle(&self, key: &RequestKey, id: u64, outcome: &Result<T>) {
		{
			let mut entries = self.entries.lock();

			if entries.get(key).is_some_and(|entry| entry.id == id) {
				entries.remove(key);
			}
		}

		if matches!(outcome, Err(Error::OperationTimeout { .. })) {
			self.metrics.record_timed_out();
			obs::event!(warn, key = %key, "deduplicated operation timed out");
		}
	}
}

struct InFlightEntry<T>
where
	T: 'static + Clone + Send + Sync,
{
	id: u64,
	outcome: SharedOutcome<T>,
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn config_validation_rejects_zero_capacity() {
		let err = DedupConfig { max_in_flight: 0, ..DedupConfig::default() }
			.validate()
			.expect_err("Zero capacity should be rejected.");

		assert!(matches!(err, ConfigError::InvalidSetting { name: "max_in_flight", .. }));
		assert!(RequestDeduplicator::<u8>::new(DedupConfig::default()).is_ok());
	}

	#[test]
	fn options_builders_compose() {
		let options = ExecuteOptions::low().with_timeout(Duration::from_secs(2));

		assert_eq!(options.priority, Priority::Low);
		assert_eq!(options.timeout, Some(Duration::from_secs(2)));
		assert_eq!(ExecuteOptions::default().priority, Priority::Normal);
		assert_eq!(
			ExecuteOptions::default().with_priority(Priority::High).priority,
			Priority::High
		);
	}

	#[tokio::test]
	async fn settled_entries_leave_the_table() {
		let dedup = RequestDeduplicator::new(DedupConfig::default())
			.expect("Default configuration should be valid.");
		let key = RequestKey::new("dns:example.com").expect("Fixture key should be valid.");
		let value = dedup
			.execute(key.clone(), || async { Ok(7_u32) }, ExecuteOptions::default())
			.await
			.expect("Operation should succeed.");

		assert_eq!(value, 7);
		assert!(!dedup.is_in_flight(&key));
		assert_eq!(dedup.snapshot().started, 1);
	}
}
