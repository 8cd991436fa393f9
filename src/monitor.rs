//! Memory-pressure sampling and cleanup callbacks.
//!
//! A [`ResourceMonitor`] samples a [`MemoryProbe`] on a fixed interval and, when usage crosses
//! [`MonitorConfig::threshold`], runs every registered cleanup callback. Callbacks are isolated
//! from each other: one that fails or panics is logged and the rest still run.

mod probe;

pub use probe::*;

// std
use std::{
	panic::{self, AssertUnwindSafe},
	sync::{
		Weak,
		atomic::{AtomicU64, Ordering},
	},
};
// crates.io
use tokio::{
	runtime::Handle,
	task::AbortHandle,
	time::{self, MissedTickBehavior},
};
// self
use crate::{
	_prelude::*,
	error::ConfigError,
	obs::{self, Component, Outcome},
};

const COMPONENT: Component = Component::ResourceMonitor;

/// Error type returned by cleanup callbacks.
pub type CleanupError = Box<dyn StdError + Send + Sync>;

type CleanupFn = dyn Fn() -> Result<(), CleanupError> + Send + Sync;

/// Threshold configuration for a [`ResourceMonitor`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MonitorConfig {
	/// Usage ratio (`used / limit`) above which cleanups run.
	pub threshold: f64,
}
impl MonitorConfig {
	/// Ensures the threshold is a ratio in `(0, 1]`.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.threshold.is_nan() || self.threshold <= 0.0 || self.threshold > 1.0 {
			return Err(ConfigError::invalid("threshold", "must be within (0, 1]"));
		}

		Ok(())
	}
}
impl Default for MonitorConfig {
	fn default() -> Self {
		Self { threshold: 0.8 }
	}
}

/// Result of one sampling step or forced cleanup.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CleanupReport {
	/// Sample taken for this step; `None` for forced cleanups and failed probes.
	pub sample: Option<MemorySample>,
	/// Whether the callbacks were run.
	pub triggered: bool,
	/// Callbacks invoked.
	pub invoked: usize,
	/// Callbacks that returned an error or panicked.
	pub failed: usize,
}

/// Point-in-time view of the monitor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
	/// Whether the sampling loop is running.
	pub running: bool,
	/// Registered callbacks.
	pub callbacks: usize,
	/// Sampling steps performed.
	pub checks: u64,
	/// Steps (or forced cleanups) that ran the callbacks.
	pub cleanups: u64,
	/// Callback invocations that failed.
	pub failures: u64,
}

/// Samples memory pressure and runs registered cleanups when it gets too high.
#[derive(Clone)]
pub struct ResourceMonitor {
	shared: Arc<MonitorShared>,
}
impl ResourceMonitor {
	/// Creates a monitor over `probe`.
	pub fn new(probe: impl MemoryProbe, config: MonitorConfig) -> Result<Self, ConfigError> {
		config.validate()?;

		Ok(Self {
			shared: Arc::new(MonitorShared {
				config,
				probe: Box::new(probe),
				callbacks: Mutex::new(Vec::new()),
				next_callback: AtomicU64::new(1),
				ticker: Mutex::new(None),
				checks: AtomicU64::new(0),
				cleanups: AtomicU64::new(0),
				failures: AtomicU64::new(0),
			}),
		})
	}

	/// Creates a monitor that samples the current process via [`SysinfoProbe`].
	pub fn with_sysinfo(config: MonitorConfig) -> Result<Self, ConfigError> {
		Self::new(SysinfoProbe::new(), config)
	}

	/// Starts sampling every `interval`.
	///
	/// Returns `Ok(false)` when the loop is already running. Must be called from within a
	/// Tokio runtime.
	pub fn start(&self, interval: Duration) -> Result<bool, ConfigError> {
		if interval.is_zero() {
			return Err(ConfigError::invalid("interval", "must be greater than zero"));
		}

		let runtime =
			Handle::try_current().map_err(|e| ConfigError::invalid("runtime", e.to_string()))?;
		let mut ticker = self.shared.ticker.lock();

		if ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
			return Ok(false);
		}

		let task = runtime.spawn(MonitorShared::run(Arc::downgrade(&self.shared), interval));

		*ticker = Some(task.abort_handle());
		obs::event!(debug, ?interval, "resource monitor started");

		Ok(true)
	}

	/// Stops the sampling loop. Returns `false` when it was not running.
	pub fn stop(&self) -> bool {
		let Some(handle) = self.shared.ticker.lock().take() else {
			return false;
		};

		handle.abort();
		obs::event!(debug, "resource monitor stopped");

		true
	}

	/// Returns `true` while the sampling loop is running.
	pub fn is_running(&self) -> bool {
		self.shared.ticker.lock().as_ref().is_some_and(|handle| !handle.is_finished())
	}

	/// Registers a cleanup callback and returns a handle that can remove it again.
	pub fn register_cleanup<F>(&self, callback: F) -> CleanupHandle
	where
		F: 'static + Send + Sync + Fn() -> Result<(), CleanupError>,
	{
		let id = self.shared.next_callback.fetch_add(1, Ordering::Relaxed);

		self.shared.callbacks.lock().push((id, Arc::new(callback)));

		CleanupHandle { id, monitor: Arc::downgrade(&self.shared) }
	}

	/// Samples once and runs the callbacks if usage exceeds the threshold.
	pub fn check_now(&self) -> CleanupReport {
		self.shared.check()
	}

	/// Runs every callback regardless of current usage.
	pub fn force_cleanup(&self) -> CleanupReport {
		self.shared.run_callbacks(None)
	}

	/// Captures loop state and counters.
	pub fn snapshot(&self) -> MonitorSnapshot {
		MonitorSnapshot {
			running: self.is_running(),
			callbacks: self.shared.callbacks.lock().len(),
			checks: self.shared.checks.load(Ordering::Relaxed),
			cleanups: self.shared.cleanups.load(Ordering::Relaxed),
			failures: self.shared.failures.load(Ordering::Relaxed),
		}
	}
}
impl Debug for ResourceMonitor {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ResourceMonitor")
			.field("config", &self.shared.config)
			.field("snapshot", &self.snapshot())
			.finish()
	}
}

/// Removes one cleanup registration from its monitor.
#[derive(Debug)]
pub struct CleanupHandle {
	id: u64,
	monitor: Weak<MonitorShared>,
}
impl CleanupHandle {
	/// Unregisters the callback. Returns `false` if it was already gone.
	pub fn unregister(self) -> bool {
		let Some(monitor) = self.monitor.upgrade() else {
			return false;
		};
		let mut callbacks = monitor.callbacks.lock();
		let before = callbacks.len();

		callbacks.retain(|(id, _)| *id != self.id);

		callbacks.len() != before
	}
}

struct MonitorShared {
	config: MonitorConfig,
	probe: Box<dyn MemoryProbe>,
	callbacks: Mutex<Vec<(u64, Arc<CleanupFn>)>>,
	next_callback: AtomicU64,
	ticker: Mutex<Option<AbortHandle>>,
	checks: AtomicU64,
	cleanups: AtomicU64,
	failures: AtomicU64,
}
impl MonitorShared {
	async fn run(this: Weak<Self>, interval: Duration) {
		let mut ticker = time::interval(interval);

		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// The first tick completes immediately.
		ticker.tick().await;

		loop {
			ticker.tick().await;

			let Some(shared) = this.upgrade() else {
				return;
			};

			shared.check();
		}
	}

	#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
	fn check(&self) -> CleanupReport {
		self.checks.fetch_add(1, Ordering::Relaxed);

		let sample = match self.probe.sample() {
			Ok(sample) => sample,
			Err(e) => {
				obs::event!(warn, error = %e, "memory probe failed");

				return CleanupReport::default();
			},
		};

		if sample.ratio() <= self.config.threshold {
			return CleanupReport { sample: Some(sample), ..Default::default() };
		}

		obs::event!(
			warn,
			used = sample.used_bytes,
			limit = sample.limit_bytes,
			threshold = self.config.threshold,
			"memory threshold exceeded; running cleanups"
		);

		self.run_callbacks(Some(sample))
	}

	#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
	fn run_callbacks(&self, sample: Option<MemorySample>) -> CleanupReport {
		// Callbacks may register or unregister others, so they run outside the lock.
		let callbacks = self.callbacks.lock().iter().map(|(_, cb)| cb.clone()).collect::<Vec<_>>();
		let mut failed = 0;

		for (index, callback) in callbacks.iter().enumerate() {
			let outcome = match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
				Ok(Ok(())) => Outcome::Success,
				Ok(Err(e)) => {
					obs::event!(warn, index, error = %e, "cleanup callback failed");

					Outcome::Failure
				},
				Err(_) => {
					obs::event!(warn, index, "cleanup callback panicked");

					Outcome::Failure
				},
			};

			if outcome == Outcome::Failure {
				failed += 1;
			}

			obs::record_outcome(COMPONENT, outcome);
		}

		self.cleanups.fetch_add(1, Ordering::Relaxed);
		self.failures.fetch_add(failed as u64, Ordering::Relaxed);

		CleanupReport { sample, triggered: true, invoked: callbacks.len(), failed }
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::AtomicUsize;
	// self
	use super::*;

	#[derive(Debug, ThisError)]
	#[error("cache eviction failed")]
	struct EvictionFailed;

	fn monitor(used: u64) -> (ResourceMonitor, Arc<FixedProbe>) {
		let probe = Arc::new(FixedProbe::new(used, 100));
		let monitor = ResourceMonitor::new(probe.clone(), MonitorConfig::default())
			.expect("Default configuration should be valid.");

		(monitor, probe)
	}

	fn counting(counter: &Arc<AtomicUsize>) -> impl Fn() -> Result<(), CleanupError> + use<> {
		let counter = counter.clone();

		move || {
			counter.fetch_add(1, Ordering::SeqCst);

			Ok(())
		}
	}

	#[test]
	fn threshold_must_be_a_ratio() {
		for threshold in [0.0, 1.5, f64::NAN] {
			assert!(MonitorConfig { threshold }.validate().is_err(), "{threshold} should fail.");
		}

		assert!(MonitorConfig { threshold: 1.0 }.validate().is_ok());
	}

	#[test]
	fn callbacks_run_only_above_threshold() {
		let (monitor, probe) = monitor(50);
		let calls = Arc::new(AtomicUsize::new(0));

		monitor.register_cleanup(counting(&calls));

		let report = monitor.check_now();

		assert!(!report.triggered);
		assert_eq!(report.sample, Some(MemorySample { used_bytes: 50, limit_bytes: 100 }));
		assert_eq!(calls.load(Ordering::SeqCst), 0);

		probe.set_used(80);

		assert!(!monitor.check_now().triggered, "Exactly at the threshold is not over it.");

		probe.set_used(95);

		let report = monitor.check_now();

		assert!(report.triggered);
		assert_eq!(report.invoked, 1);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(monitor.snapshot().checks, 3);
	}

	#[test]
	fn failing_and_panicking_callbacks_do_not_stop_the_rest() {
		let (monitor, _) = monitor(0);
		let calls = Arc::new(AtomicUsize::new(0));

		monitor.register_cleanup(|| Err(Box::new(EvictionFailed) as CleanupError));
		monitor.register_cleanup(|| panic!("cleanup exploded"));
		monitor.register_cleanup(counting(&calls));

		let report = monitor.force_cleanup();

		assert_eq!(report, CleanupReport { sample: None, triggered: true, invoked: 3, failed: 2 });
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(monitor.snapshot().failures, 2);
	}

	#[test]
	fn unregister_removes_exactly_one_registration() {
		let (monitor, _) = monitor(0);
		let first = Arc::new(AtomicUsize::new(0));
		let second = Arc::new(AtomicUsize::new(0));
		let handle = monitor.register_cleanup(counting(&first));

		monitor.register_cleanup(counting(&second));

		assert!(handle.unregister());
		assert_eq!(monitor.force_cleanup().invoked, 1);
		assert_eq!(first.load(Ordering::SeqCst), 0);
		assert_eq!(second.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn probe_failures_skip_the_step() {
		let monitor = ResourceMonitor::new(FixedProbe::new(10, 0), MonitorConfig::default())
			.expect("Default configuration should be valid.");

		assert_eq!(monitor.check_now(), CleanupReport::default());
	}

	#[test]
	fn start_requires_a_runtime() {
		let (monitor, _) = monitor(0);

		assert!(monitor.start(Duration::from_secs(1)).is_err());
		assert!(!monitor.is_running());
	}

	#[tokio::test(start_paused = true)]
	async fn start_and_stop_are_idempotent() {
		let (monitor, _) = monitor(95);
		let calls = Arc::new(AtomicUsize::new(0));

		monitor.register_cleanup(counting(&calls));

		assert!(monitor.start(Duration::from_secs(1)).expect("Start should succeed."));
		assert!(!monitor.start(Duration::from_secs(1)).expect("Second start should succeed."));

		time::sleep(Duration::from_millis(3_500)).await;

		assert_eq!(calls.load(Ordering::SeqCst), 3);
		assert!(monitor.stop());
		assert!(!monitor.stop());

		time::sleep(Duration::from_secs(5)).await;

		assert_eq!(calls.load(Ordering::SeqCst), 3);
		assert!(!monitor.snapshot().running);
	}
}
