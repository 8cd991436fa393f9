#![cfg(feature = "test")]

// std
use std::sync::atomic::{AtomicUsize, Ordering};
// crates.io
use futures_util::future;
// self
use lookup_broker::{
	_preludet::*,
	batch::{BatchConfig, BatchCoordinator, BatchFuture, BatchProcessor},
};

#[derive(Debug, ThisError)]
#[error("bulk whois rejected the batch")]
struct BulkRejected;

/// Upper-cases domains and records every batch it receives.
#[derive(Clone, Debug, Default)]
struct RecordingProcessor {
	batches: Arc<Mutex<Vec<Vec<String>>>>,
	calls: Arc<AtomicUsize>,
}
impl RecordingProcessor {
	fn batches(&self) -> Vec<Vec<String>> {
		self.batches.lock().clone()
	}
}
impl BatchProcessor<String, String> for RecordingProcessor {
	fn process(&self, items: Vec<String>) -> BatchFuture<'_, String> {
		Box::pin(async move {
			self.calls.fetch_add(1, Ordering::SeqCst);
			self.batches.lock().push(items.clone());

			Ok(items.into_iter().map(|item| item.to_uppercase()).collect())
		})
	}
}

fn coordinator(config: BatchConfig) -> (BatchCoordinator<String, String>, RecordingProcessor) {
	let processor = RecordingProcessor::default();
	let coordinator = BatchCoordinator::new(processor.clone(), config)
		.expect("Fixture configuration should be valid.");

	(coordinator, processor)
}

fn domains(count: usize) -> Vec<String> {
	(0..count).map(|i| format!("domain-{i}.example")).collect()
}

#[tokio::test(start_paused = true)]
async fn full_batches_flush_without_waiting_for_the_delay() {
	let (coordinator, processor) = coordinator(BatchConfig {
		batch_size: 3,
		batch_delay: Duration::from_secs(60),
		..BatchConfig::default()
	});
	let started = Instant::now();
	let results = future::join_all(domains(3).into_iter().map(|d| coordinator.submit(d))).await;

	assert_eq!(started.elapsed(), Duration::ZERO, "Size flush must not wait for the timer.");
	assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
	assert_eq!(processor.batches(), [domains(3)]);
	assert_eq!(
		results.into_iter().map(|r| r.expect("Item should succeed.")).collect::<Vec<_>>(),
		["DOMAIN-0.EXAMPLE", "DOMAIN-1.EXAMPLE", "DOMAIN-2.EXAMPLE"]
	);
	assert!(!coordinator.snapshot().timer_armed, "Size flush cancels the pending timer.");
}

#[tokio::test(start_paused = true)]
async fn partial_batches_flush_after_the_delay() {
	let (coordinator, processor) = coordinator(BatchConfig::default());
	let started = Instant::now();
	let result = coordinator.submit("solo.example".into()).await.expect("Item should succeed.");
	let elapsed = started.elapsed();

	assert_eq!(result, "SOLO.EXAMPLE");
	assert!(elapsed >= Duration::from_millis(50), "Flushed too early after {elapsed:?}.");
	assert!(elapsed < Duration::from_millis(100), "Flushed too late after {elapsed:?}.");
	assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn overflowing_items_start_a_new_batch() {
	let (coordinator, processor) =
		coordinator(BatchConfig { batch_size: 2, ..BatchConfig::default() });
	let results = future::join_all(domains(5).into_iter().map(|d| coordinator.submit(d))).await;

	let all = domains(5);

	assert!(results.iter().all(Result::is_ok));
	assert_eq!(processor.batches(), [all[..2].to_vec(), all[2..4].to_vec(), all[4..].to_vec()]);
	assert_eq!(coordinator.pending(), 0);
	assert_eq!(coordinator.snapshot().batches, 3);
}

#[tokio::test(start_paused = true)]
async fn short_result_lists_fail_the_missing_items() {
	let coordinator = BatchCoordinator::new(
		|items: Vec<u32>| async move {
			Ok::<_, Error>(items.into_iter().take(1).map(|item| item * 10).collect())
		},
		BatchConfig { batch_size: 3, ..BatchConfig::default() },
	)
	.expect("Fixture configuration should be valid.");
	let (first, second, third) =
		tokio::join!(coordinator.submit(1), coordinator.submit(2), coordinator.submit(3));

	assert_eq!(first.expect("First item has a result."), 10);

	for missing in [second, third] {
		assert!(matches!(missing, Err(Error::BatchIncomplete { expected: 3, received: 1 })));
	}
}

#[tokio::test(start_paused = true)]
async fn processor_failure_fails_the_whole_batch() {
	let coordinator = BatchCoordinator::new(
		|_: Vec<u32>| async { Err::<Vec<u32>, _>(Error::operation(BulkRejected)) },
		BatchConfig { batch_size: 2, ..BatchConfig::default() },
	)
	.expect("Fixture configuration should be valid.");
	let (first, second) = tokio::join!(coordinator.submit(1), coordinator.submit(2));

	for result in [first, second] {
		match result {
			Err(Error::Operation(source)) =>
				assert_eq!(source.to_string(), "bulk whois rejected the batch"),
			other => panic!("Expected the processor error, got {other:?}."),
		}
	}
}

#[tokio::test(start_paused = true)]
async fn stale_items_are_evicted_before_processing() {
	let calls = Arc::new(AtomicUsize::new(0));
	let coordinator = BatchCoordinator::new(
		{
			let calls = calls.clone();

			move |items: Vec<u32>| {
				calls.fetch_add(1, Ordering::SeqCst);

				async move { Ok::<_, Error>(items) }
			}
		},
		BatchConfig {
			batch_size: 10,
			batch_delay: Duration::from_secs(2),
			max_wait: Duration::from_secs(1),
		},
	)
	.expect("Fixture configuration should be valid.");
	let err = coordinator.submit(7).await.expect_err("Item should age out before the flush.");

	match err {
		Error::BatchWaitTimeout { waited, max_wait } => {
			assert!(waited > max_wait);
			assert_eq!(max_wait, Duration::from_secs(1));
		},
		other => panic!("Expected a batch wait timeout, got {other:?}."),
	}

	assert_eq!(calls.load(Ordering::SeqCst), 0, "Evicted items are never processed.");
	assert_eq!(coordinator.snapshot().expired, 1);
}

#[tokio::test(start_paused = true)]
async fn manual_flush_skips_the_delay() {
	let (coordinator, processor) = coordinator(BatchConfig {
		batch_delay: Duration::from_secs(60),
		..BatchConfig::default()
	});
	let pending = tokio::spawn({
		let coordinator = coordinator.clone();

		async move { coordinator.submit("manual.example".into()).await }
	});

	while coordinator.pending() == 0 {
		tokio::task::yield_now().await;
	}

	assert_eq!(coordinator.flush().await, 1);
	assert_eq!(
		pending.await.expect("Submit task should not panic.").expect("Item should succeed."),
		"MANUAL.EXAMPLE"
	);
	assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
	assert_eq!(coordinator.flush().await, 0, "Nothing left to flush.");
}
