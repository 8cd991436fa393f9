//! Coalesces discrete work items into bounded batches for a single downstream call.
//!
//! A batch is flushed as soon as [`BatchConfig::batch_size`] items are queued, or once
//! [`BatchConfig::batch_delay`] has elapsed since the first unflushed item. Only one delay
//! timer is pending at a time; a flush by size cancels it. Before every flush, items older
//! than [`BatchConfig::max_wait`] are failed with [`Error::BatchWaitTimeout`].

// std
use std::{
	panic::AssertUnwindSafe,
	sync::atomic::{AtomicU64, Ordering},
};
// crates.io
use futures_util::FutureExt;
use tokio::task::AbortHandle;
// self
use crate::{
	_prelude::*,
	error::ConfigError,
	obs::{self, Component, OpSpan, Outcome},
};

const COMPONENT: Component = Component::BatchCoordinator;

/// Boxed future returned by [`BatchProcessor::process`].
pub type BatchFuture<'a, O> = Pin<Box<dyn Future<Output = Result<Vec<O>>> + 'a + Send>>;

/// Downstream operation that handles a whole batch in one call.
///
/// Results must be returned in the same order as `items`. Returning fewer results than items
/// fails the callers without a result with [`Error::BatchIncomplete`]; returning an error
/// fails every caller in the batch with a clone of it.
pub trait BatchProcessor<I, O>
where
	Self: 'static + Send + Sync,
{
	/// Processes one batch.
	fn process(&self, items: Vec<I>) -> BatchFuture<'_, O>;
}
impl<I, O, F, Fut> BatchProcessor<I, O> for F
where
	F: 'static + Send + Sync + Fn(Vec<I>) -> Fut,
	Fut: 'static + Send + Future<Output = Result<Vec<O>>>,
{
	fn process(&self, items: Vec<I>) -> BatchFuture<'_, O> {
		Box::pin(self(items))
	}
}

/// Batch dropped before its results were delivered, e.g. because the processor panicked.
#[derive(Debug, ThisError)]
#[error("Batch was aborted before its results were delivered.")]
pub struct BatchAborted;

/// Flush thresholds for a [`BatchCoordinator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchConfig {
	/// Queue length that triggers an immediate flush.
	pub batch_size: usize,
	/// Delay after the first unflushed item before a flush is forced.
	pub batch_delay: Duration,
	/// Maximum age of an item at flush time.
	pub max_wait: Duration,
}
impl BatchConfig {
	/// Rejects configurations that could never flush.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.batch_size == 0 {
			return Err(ConfigError::invalid("batch_size", "must be at least 1"));
		}
		if self.max_wait.is_zero() {
			return Err(ConfigError::invalid("max_wait", "must be greater than zero"));
		}

		Ok(())
	}
}
impl Default for BatchConfig {
	fn default() -> Self {
		Self {
			batch_size: 10,
			batch_delay: Duration::from_millis(50),
			max_wait: Duration::from_secs(5),
		}
	}
}

/// Point-in-time view of the coordinator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchSnapshot {
	/// Items waiting for a flush.
	pub pending: usize,
	/// Whether a delay timer is armed.
	pub timer_armed: bool,
	/// Batches handed to the processor.
	pub batches: u64,
	/// Items failed for exceeding [`BatchConfig::max_wait`].
	pub expired: u64,
}

/// Accumulates items and submits them to a [`BatchProcessor`] in bounded batches.
pub struct BatchCoordinator<I, O>
where
	I: 'static + Send,
	O: 'static + Send,
{
	shared: Arc<BatchShared<I, O>>,
}
impl<I, O> BatchCoordinator<I, O>
where
	I: 'static + Send,
	O: 'static + Send,
{
	/// Creates a coordinator that feeds `processor`.
	pub fn new<P>(processor: P, config: BatchConfig) -> Result<Self, ConfigError>
	where
		P: BatchProcessor<I, O>,
	{
		config.validate()?;

		Ok(Self {
			shared: Arc::new(BatchShared {
				config,
				processor: Arc::new(processor),
				state: Mutex::new(BatchState {
					queue: VecDeque::new(),
					timer: None,
					next_timer: 0,
				}),
				batches: AtomicU64::new(0),
				expired: AtomicU64::new(0),
			}),
		})
	}

	/// Queues `item` and resolves once its batch has been processed.
	pub async fn submit(&self, item: I) -> Result<O> {
		let span = OpSpan::new(COMPONENT, "submit");

		obs::record_outcome(COMPONENT, Outcome::Attempt);

		let result = span
			.instrument(async {
				let receiver = BatchShared::enqueue(&self.shared, item);

				receiver.await.unwrap_or_else(|_| Err(Error::operation(BatchAborted)))
			})
			.await;

		obs::record_outcome(COMPONENT, Outcome::of(&result));

		result
	}

	/// Flushes the queued items now, without waiting for the size or delay trigger.
	///
	/// Returns the number of items handed to the processor.
	pub async fn flush(&self) -> usize {
		let batch = {
			let mut state = self.shared.state.lock();

			state.cancel_timer();

			self.shared.take_batch(&mut state)
		};
		let dispatched = batch.len();

		BatchShared::dispatch(&self.shared, batch);

		dispatched
	}

	/// Number of items waiting for a flush.
	pub fn pending(&self) -> usize {
		self.shared.state.lock().queue.len()
	}

	/// Captures queue depth and counters.
	pub fn snapshot(&self) -> BatchSnapshot {
		let (pending, timer_armed) = {
			let state = self.shared.state.lock();

			(state.queue.len(), state.timer.is_some())
		};

		BatchSnapshot {
			pending,
			timer_armed,
			batches: self.shared.batches.load(Ordering::Relaxed),
			expired: self.shared.expired.load(Ordering::Relaxed),
		}
	}
}
impl<I, O> Clone for BatchCoordinator<I, O>
where
	I: 'static + Send,
	O: 'static + Send,
{
	fn clone(&self) -> Self {
		Self { shared: self.shared.clone() }
	}
}
impl<I, O> Debug for BatchCoordinator<I, O>
where
	I: 'static + Send,
	O: 'static + Send,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("BatchCoordinator")
			.field("config", &self.shared.config)
			.field("snapshot", &self.snapshot())
			.finish()
	}
}

struct BatchShared<I, O>
where
	I: 'static + Send,
	O: 'static + Send,
{
	config: BatchConfig,
	processor: Arc<dyn BatchProcessor<I, O>>,
	state: Mutex<BatchState<I, O>>,
	batches: AtomicU64,
	expired: AtomicU64,
}
impl<I, O> BatchShared<I, O>
where
	I: 'static + Send,
	O: 'static + Send,
{
	fn enqueue(this: &Arc<Self>, payload: I) -> oneshot::Receiver<Result<O>> {
		let (sender, receiver) = oneshot::channel();
		let full_batch = {
			let mut state = this.state.lock();

			state.queue.push_back(BatchSlot { payload, sender, submitted_at: Instant::now() });
			obs::record_queue_depth(COMPONENT, state.queue.len());

			if state.queue.len() >= this.config.batch_size {
				state.cancel_timer();

				Some(this.take_batch(&mut state))
			} else {
				if state.timer.is_none() {
					Self::arm_timer(this, &mut state);
				}

				None
			}
		};

		if let Some(batch) = full_batch {
			Self::dispatch(this, batch);
		}

		receiver
	}

	/// Evicts expired items, then removes up to one batch from the queue. Re-arms the timer
	/// when items remain.
	fn take_batch(self: &Arc<Self>, state: &mut BatchState<I, O>) -> Vec<BatchSlot<I, O>> {
		let now = Instant::now();
		let max_wait = self.config.max_wait;
		let mut expired = 0;

		// Submission timestamps are monotonic, so expired items always form a prefix.
		while let Some(slot) = state.queue.front() {
			let waited = now.saturating_duration_since(slot.submitted_at);

			if waited <= max_wait {
				break;
			}
			if let Some(slot) = state.queue.pop_front() {
				slot.sender.send(Err(Error::BatchWaitTimeout { waited, max_wait })).ok();

				expired += 1;
			}
		}

		if expired > 0 {
			self.expired.fetch_add(expired, Ordering::Relaxed);
			obs::event!(warn, expired, ?max_wait, "evicted batch items past their maximum wait");
		}

		let take = state.queue.len().min(self.config.batch_size);
		let batch = state.queue.drain(..take).collect::<Vec<_>>();

		if !state.queue.is_empty() && state.timer.is_none() {
			Self::arm_timer(self, state);
		}

		obs::record_queue_depth(COMPONENT, state.queue.len());

		batch
	}

	fn arm_timer(this: &Arc<Self>, state: &mut BatchState<I, O>) {
		state.next_timer += 1;

		let generation = state.next_timer;
		let shared = this.clone();
		let delay = this.config.batch_delay;
		let handle = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			shared.on_timer(generation);
		});

		state.timer = Some(ArmedTimer { generation, abort: handle.abort_handle() });
	}

	fn on_timer(self: &Arc<Self>, generation: u64) {
		let batch = {
			let mut state = self.state.lock();

			// A flush may have replaced this timer after it woke up but before it got the lock.
			if state.timer.as_ref().is_none_or(|timer| timer.generation != generation) {
				return;
			}

			state.timer = None;

			self.take_batch(&mut state)
		};

		Self::dispatch(self, batch);
	}

	fn dispatch(this: &Arc<Self>, batch: Vec<BatchSlot<I, O>>) {
		if batch.is_empty() {
			return;
		}

		this.batches.fetch_add(1, Ordering::Relaxed);
		tokio::spawn(Self::run_batch(this.processor.clone(), batch));
	}

	async fn run_batch(
		processor: Arc<dyn BatchProcessor<I, O>>,
		batch: Vec<BatchSlot<I, O>>,
	) {
		let expected = batch.len();
		let (payloads, senders) = batch
			.into_iter()
			.map(|slot| (slot.payload, slot.sender))
			.unzip::<_, _, Vec<_>, Vec<_>>();
		let outcome = AssertUnwindSafe(processor.process(payloads))
			.catch_unwind()
			.await
			.unwrap_or_else(|_| Err(Error::operation(BatchAborted)));

		match outcome {
			Ok(results) => {
				let received = results.len();

				if received != expected {
					obs::event!(warn, expected, received, "batch processor result count mismatch");
				}

				let mut results = results.into_iter();

				for sender in senders {
					let result =
						results.next().ok_or(Error::BatchIncomplete { expected, received });

					sender.send(result).ok();
				}
			},
			Err(err) => {
				obs::event!(warn, expected, error = %err, "batch processor failed");

				for sender in senders {
					sender.send(Err(err.clone())).ok();
				}
			},
		}
	}
}

struct BatchState<I, O> {
	queue: VecDeque<BatchSlot<I, O>>,
	timer: Option<ArmedTimer>,
	next_timer: u64,
}
impl<I, O> BatchState<I, O> {
	fn cancel_timer(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.abort.abort();
		}
	}
}

struct ArmedTimer {
	generation: u64,
	abort: AbortHandle,
}

struct BatchSlot<I, O> {
	payload: I,
	sender: oneshot::Sender<Result<O>>,
	submitted_at: Instant,
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn config_validation_rejects_empty_batches() {
		let err = BatchConfig { batch_size: 0, ..BatchConfig::default() }
			.validate()
			.expect_err("Zero batch size should be rejected.");

		assert!(matches!(err, ConfigError::InvalidSetting { name: "batch_size", .. }));
		assert!(BatchConfig::default().validate().is_ok());
	}

	#[tokio::test(start_paused = true)]
	async fn delay_timer_is_armed_by_first_item() {
		let coordinator = BatchCoordinator::new(
			|items: Vec<u32>| async move { Ok::<_, Error>(items) },
			BatchConfig::default(),
		)
		.expect("Default configuration should be valid.");
		let pending = tokio::spawn({
			let coordinator = coordinator.clone();

			async move { coordinator.submit(1).await }
		});

		tokio::task::yield_now().await;

		let snapshot = coordinator.snapshot();

		assert_eq!(snapshot.pending, 1);
		assert!(snapshot.timer_armed);

		let value = pending
			.await
			.expect("Submit task should not panic.")
			.expect("Item should be processed after the delay.");

		assert_eq!(value, 1);
		assert_eq!(coordinator.snapshot(), BatchSnapshot { batches: 1, ..Default::default() });
	}
}
