//! Demonstrates the in-process components without any network:
//!
//! 1. Deduplicate concurrent identical lookups with [`RequestDeduplicator`].
//! 2. Coalesce bulk lookups into batches with [`BatchCoordinator`].
//! 3. Register a cache cleanup with [`ResourceMonitor`] and force it to run.

// std
use std::sync::{
	Arc,
	atomic::{AtomicUsize, Ordering},
};
// crates.io
use color_eyre::Result;
// self
use lookup_broker::{
	auth::RequestKey,
	batch::{BatchConfig, BatchCoordinator},
	dedup::{DedupConfig, ExecuteOptions, RequestDeduplicator},
	error::Error,
	monitor::{MonitorConfig, ResourceMonitor},
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let dedup = RequestDeduplicator::<String>::new(DedupConfig::default())?;
	let backend_calls = Arc::new(AtomicUsize::new(0));
	let lookup = |calls: Arc<AtomicUsize>| {
		move || async move {
			calls.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(std::time::Duration::from_millis(20)).await;

			Ok::<_, Error>("93.184.215.14".to_owned())
		}
	};
	let key = RequestKey::compose("dns", ["example.com", "A"])?;
	let (first, second) = tokio::join!(
		dedup.execute(key.clone(), lookup(backend_calls.clone()), ExecuteOptions::default()),
		dedup.execute(key, lookup(backend_calls.clone()), ExecuteOptions::default()),
	);

	println!(
		"DNS answers: {} / {} from {} backend call(s).",
		first?,
		second?,
		backend_calls.load(Ordering::SeqCst)
	);

	let batches = BatchCoordinator::new(
		|domains: Vec<String>| async move {
			Ok::<_, Error>(domains.into_iter().map(|domain| domain.len() > 10).collect())
		},
		BatchConfig::default(),
	)?;
	let (short, long) =
		tokio::join!(batches.submit("a.io".into()), batches.submit("long-domain.example".into()));

	println!("Availability: a.io={}, long-domain.example={}.", short?, long?);

	let monitor = ResourceMonitor::with_sysinfo(MonitorConfig::default())?;
	let evicted = Arc::new(AtomicUsize::new(0));
	let handle = monitor.register_cleanup({
		let evicted = evicted.clone();

		move || {
			evicted.fetch_add(1, Ordering::SeqCst);

			Ok(())
		}
	});
	let report = monitor.force_cleanup();

	println!("Forced cleanup ran {} callback(s), {} failed.", report.invoked, report.failed);
	println!("Unregistered: {}.", handle.unregister());

	Ok(())
}
