// std
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use sysinfo::{Pid, ProcessesToUpdate, System};
// self
use crate::_prelude::*;

/// Failure to obtain a memory sample.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("Memory usage could not be sampled: {reason}.")]
pub struct ProbeError {
	/// Human-readable explanation.
	pub reason: String,
}
impl ProbeError {
	fn new(reason: impl Into<String>) -> Self {
		Self { reason: reason.into() }
	}
}

/// One memory reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MemorySample {
	/// Bytes in use.
	pub used_bytes: u64,
	/// Bytes available to the process; usage is measured against this.
	pub limit_bytes: u64,
}
impl MemorySample {
	/// Returns `used / limit`; a zero limit reads as fully used.
	pub fn ratio(&self) -> f64 {
		if self.limit_bytes == 0 {
			return 1.0;
		}

		self.used_bytes as f64 / self.limit_bytes as f64
	}
}

/// Source of memory readings for a [`super::ResourceMonitor`].
pub trait MemoryProbe
where
	Self: 'static + Send + Sync,
{
	/// Takes one reading.
	fn sample(&self) -> Result<MemorySample, ProbeError>;
}
impl<P> MemoryProbe for Arc<P>
where
	P: ?Sized + MemoryProbe,
{
	fn sample(&self) -> Result<MemorySample, ProbeError> {
		(**self).sample()
	}
}

/// Reads the resident memory of the current process with `sysinfo`.
///
/// Usage is measured against an explicit budget when one is configured, otherwise against
/// total system memory.
pub struct SysinfoProbe {
	system: Mutex<System>,
	pid: Option<Pid>,
	budget: Option<u64>,
}
impl SysinfoProbe {
	/// Measures against total system memory.
	pub fn new() -> Self {
		Self { system: Mutex::new(System::new()), pid: sysinfo::get_current_pid().ok(), budget: None }
	}

	/// Measures against a fixed budget in bytes.
	pub fn with_budget(budget_bytes: u64) -> Self {
		Self { budget: Some(budget_bytes), ..Self::new() }
	}
}
impl Default for SysinfoProbe {
	fn default() -> Self {
		Self::new()
	}
}
impl Debug for SysinfoProbe {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SysinfoProbe").field("pid", &self.pid).field("budget", &self.budget).finish()
	}
}
impl MemoryProbe for SysinfoProbe {
	fn sample(&self) -> Result<MemorySample, ProbeError> {
		let pid = self.pid.ok_or_else(|| ProbeError::new("current process id is unavailable"))?;
		let mut system = self.system.lock();

		system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

		let used_bytes = system
			.process(pid)
			.map(sysinfo::Process::memory)
			.ok_or_else(|| ProbeError::new(format!("process {pid} is not visible")))?;
		let limit_bytes = match self.budget {
			Some(budget) => budget,
			None => {
				system.refresh_memory();

				system.total_memory()
			},
		};

		Ok(MemorySample { used_bytes, limit_bytes })
	}
}

/// Probe reporting whatever usage was last stored in it.
///
/// Useful when usage is accounted elsewhere (e.g. a cache that tracks its own size) and in
/// tests. A zero limit is reported as a probe failure.
#[derive(Debug, Default)]
pub struct FixedProbe {
	used: AtomicU64,
	limit: AtomicU64,
}
impl FixedProbe {
	/// Creates a probe with the given usage and limit in bytes.
	pub fn new(used_bytes: u64, limit_bytes: u64) -> Self {
		Self { used: AtomicU64::new(used_bytes), limit: AtomicU64::new(limit_bytes) }
	}

	/// Replaces the reported usage.
	pub fn set_used(&self, used_bytes: u64) {
		self.used.store(used_bytes, Ordering::Relaxed);
	}

	/// Replaces the reported limit.
	pub fn set_limit(&self, limit_bytes: u64) {
		self.limit.store(limit_bytes, Ordering::Relaxed);
	}
}
impl MemoryProbe for FixedProbe {
	fn sample(&self) -> Result<MemorySample, ProbeError> {
		let limit_bytes = self.limit.load(Ordering::Relaxed);

		if limit_bytes == 0 {
			return Err(ProbeError::new("no memory limit configured"));
		}

		Ok(MemorySample { used_bytes: self.used.load(Ordering::Relaxed), limit_bytes })
	}
}
