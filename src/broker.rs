//! FIFO broker for single-use backend credentials.
//!
//! [`CredentialBroker::acquire`] enqueues a waiter and suspends until the broker's drain
//! worker resolves it. A single worker task pops waiters strictly in arrival order and
//! fetches one fresh credential per waiter, so at most one issuing call is in flight and no
//! credential is ever shared. Each fetch retries up to [`RetryPolicy::max_attempts`] times
//! with linear backoff, and every attempt races a deadline.
//!
//! The worker is started on demand by the enqueue that finds the broker idle. The decision
//! to go idle is taken under the same lock as the final empty-queue check, so a waiter
//! enqueued while the worker winds down is either popped by that worker or starts a new one.
//!
//! [`CredentialBroker::reset`] and [`CredentialBroker::shutdown`] are explicit lifecycle hooks
//! for the host process (e.g. hot-reload or teardown); there is no implicit staleness timer.

mod metrics;
mod worker;

pub use metrics::BrokerMetrics;

// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::{
	_prelude::*,
	auth::Credential,
	config::RuntimeMode,
	issuer::CredentialIssuer,
	obs::{self, Component, OpSpan, Outcome},
};
#[cfg(feature = "reqwest")]
use crate::{config::IssuerConfig, issuer::ReqwestIssuer};

const COMPONENT: Component = Component::CredentialBroker;

#[cfg(feature = "reqwest")]
/// Broker specialized for the crate's default reqwest issuer.
pub type ReqwestBroker = CredentialBroker<ReqwestIssuer>;

/// Retry and deadline settings applied to every waiter's fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Total issuer calls allowed per waiter, including the first one.
	pub max_attempts: u32,
	/// Backoff unit; the sleep after attempt `n` is `n × base_backoff`.
	pub base_backoff: Duration,
	/// Deadline for a single issuer call.
	pub attempt_timeout: Duration,
}
impl RetryPolicy {
	/// Returns the sleep applied after the given (1-based) failed attempt.
	pub fn backoff(&self, attempt: u32) -> Duration {
		self.base_backoff.saturating_mul(attempt)
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 2,
			base_backoff: Duration::from_millis(100),
			attempt_timeout: Duration::from_secs(10),
		}
	}
}

/// Point-in-time view of the broker for diagnostics endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BrokerSnapshot {
	/// Waiters currently queued (excluding the one being served).
	pub queued: usize,
	/// Whether a drain worker is running.
	pub draining: bool,
	/// Whether [`CredentialBroker::shutdown`] has been called.
	pub closed: bool,
	/// Issuer calls performed, including retries.
	pub attempts: u64,
	/// Credentials delivered to waiters.
	pub issued: u64,
	/// Waiters rejected after exhausting their retries.
	pub failed: u64,
	/// Waiters failed by [`CredentialBroker::reset`] or [`CredentialBroker::shutdown`].
	pub reset: u64,
	/// Waiters whose caller stopped waiting before being served.
	pub abandoned: u64,
}

/// Serializes acquisition of single-use credentials from a [`CredentialIssuer`].
///
/// The broker is cheap to clone; clones share the same queue and worker. Construct one per
/// process and pass it to the code that needs credentials.
pub struct CredentialBroker<I>
where
	I: ?Sized + CredentialIssuer,
{
	shared: Arc<Shared<I>>,
}
impl<I> CredentialBroker<I>
where
	I: ?Sized + CredentialIssuer,
{
	/// Creates a broker with the default [`RetryPolicy`].
	pub fn new(issuer: Arc<I>) -> Self {
		Self::builder(issuer).build()
	}

	/// Creates a broker with a custom [`RetryPolicy`].
	pub fn with_policy(issuer: Arc<I>, policy: RetryPolicy) -> Self {
		Self::builder(issuer).policy(policy).build()
	}

	/// Starts a builder for the provided issuer.
	pub fn builder(issuer: Arc<I>) -> CredentialBrokerBuilder<I> {
		CredentialBrokerBuilder {
			issuer,
			policy: RetryPolicy::default(),
			mode: RuntimeMode::default(),
		}
	}

	/// Waits for a fresh credential.
	///
	/// Fails with [`Error::RetriesExhausted`] when every attempt for this waiter failed,
	/// [`Error::StateReset`] when the broker is reset while the waiter is queued, and
	/// [`Error::Closed`] after [`shutdown`](Self::shutdown).
	pub async fn acquire(&self) -> Result<Credential> {
		let span = OpSpan::new(COMPONENT, "acquire");

		obs::record_outcome(COMPONENT, Outcome::Attempt);

		let result = span
			.instrument(async {
				let receiver = self.enqueue()?;

				// A dropped sender means the worker died mid-fetch; surface it like a reset.
				receiver.await.unwrap_or(Err(Error::StateReset))
			})
			.await;

		obs::record_outcome(COMPONENT, Outcome::of(&result));

		result
	}

	/// Fails every queued waiter with [`Error::StateReset`] and returns how many were failed.
	///
	/// A waiter whose fetch is already in progress is not queued and still completes.
	pub fn reset(&self) -> usize {
		self.shared.fail_queued()
	}

	/// Resets the broker and refuses further [`acquire`](Self::acquire) calls.
	///
	/// Idempotent; returns how many queued waiters were failed by this call.
	pub fn shutdown(&self) -> usize {
		self.shared.state.lock().closed = true;

		self.shared.fail_queued()
	}

	/// Returns `true` once [`shutdown`](Self::shutdown) has been called.
	pub fn is_closed(&self) -> bool {
		self.shared.state.lock().closed
	}

	/// Returns the broker's counters.
	pub fn metrics(&self) -> &BrokerMetrics {
		&self.shared.metrics
	}

	/// Captures the queue state and counters.
	pub fn snapshot(&self) -> BrokerSnapshot {
		let (queued, draining, closed) = {
			let state = self.shared.state.lock();

			(state.queue.len(), state.draining, state.closed)
		};
		let metrics = &self.shared.metrics;

		BrokerSnapshot {
			queued,
			draining,
			closed,
			attempts: metrics.attempts(),
			issued: metrics.issued(),
			failed: metrics.failures(),
			reset: metrics.resets(),
			abandoned: metrics.abandoned(),
		}
	}

	fn enqueue(&self) -> Result<oneshot::Receiver<Result<Credential>>> {
		let (sender, receiver) = oneshot::channel();
		let id = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);
		let start_worker = {
			let mut state = self.shared.state.lock();

			if state.closed {
				return Err(Error::Closed);
			}

			state.queue.push_back(Waiter { id, sender, enqueued_at: Instant::now() });
			obs::record_queue_depth(COMPONENT, state.queue.len());

			!std::mem::replace(&mut state.draining, true)
		};

		if start_worker {
			Shared::spawn_worker(&self.shared);
		}

		Ok(receiver)
	}
}
#[cfg(feature = "reqwest")]
impl CredentialBroker<ReqwestIssuer> {
	/// Creates a broker talking to the issuer described by `config`.
	///
	/// The config's fetch timeout becomes the per-attempt deadline and its mode controls
	/// diagnostic verbosity.
	pub fn from_config(config: IssuerConfig) -> Result<Self> {
		let policy =
			RetryPolicy { attempt_timeout: config.fetch_timeout, ..RetryPolicy::default() };
		let mode = config.mode;
		let issuer = ReqwestIssuer::new(config)?;

		Ok(Self::builder(Arc::new(issuer)).policy(policy).mode(mode).build())
	}
}
impl<I> Clone for CredentialBroker<I>
where
	I: ?Sized + CredentialIssuer,
{
	fn clone(&self) -> Self {
		Self { shared: self.shared.clone() }
	}
}
impl<I> Debug for CredentialBroker<I>
where
	I: ?Sized + CredentialIssuer,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CredentialBroker")
			.field("policy", &self.shared.policy)
			.field("mode", &self.shared.mode)
			.field("snapshot", &self.snapshot())
			.finish()
	}
}

/// Builder for [`CredentialBroker`] values.
pub struct CredentialBrokerBuilder<I>
where
	I: ?Sized + CredentialIssuer,
{
	issuer: Arc<I>,
	policy: RetryPolicy,
	mode: RuntimeMode,
}
impl<I> CredentialBrokerBuilder<I>
where
	I: ?Sized + CredentialIssuer,
{
	/// Overrides the retry policy.
	pub fn policy(mut self, policy: RetryPolicy) -> Self {
		self.policy = policy;

		self
	}

	/// Overrides the runtime mode (development mode logs every attempt).
	pub fn mode(mut self, mode: RuntimeMode) -> Self {
		self.mode = mode;

		self
	}

	/// Finishes the broker. The drain worker is not started until the first waiter arrives.
	pub fn build(self) -> CredentialBroker<I> {
		let policy = RetryPolicy { max_attempts: self.policy.max_attempts.max(1), ..self.policy };

		CredentialBroker {
			shared: Arc::new(Shared {
				issuer: self.issuer,
				policy,
				mode: self.mode,
				state: Mutex::new(BrokerState::default()),
				fetch_gate: AsyncMutex::new(()),
				metrics: BrokerMetrics::default(),
				next_waiter: AtomicU64::new(1),
			}),
		}
	}
}

struct Shared<I>
where
	I: ?Sized + CredentialIssuer,
{
	issuer: Arc<I>,
	policy: RetryPolicy,
	mode: RuntimeMode,
	state: Mutex<BrokerState>,
	// Serializes issuer calls even if a replacement worker starts while an old one unwinds.
	fetch_gate: AsyncMutex<()>,
	metrics: BrokerMetrics,
	next_waiter: AtomicU64,
}
impl<I> Shared<I>
where
	I: ?Sized + CredentialIssuer,
{
	fn fail_queued(&self) -> usize {
		let drained = std::mem::take(&mut self.state.lock().queue);

		self.reject_waiters(drained)
	}

	fn reject_waiters(&self, drained: VecDeque<Waiter>) -> usize {
		let count = drained.len();

		for waiter in drained {
			let _ = waiter.sender.send(Err(Error::StateReset));
		}

		if count > 0 {
			self.metrics.record_resets(count as u64);
			obs::record_queue_depth(COMPONENT, 0);
			obs::event!(warn, count, "credential broker reset failed queued waiters");
		}

		count
	}
}

#[derive(Default)]
struct BrokerState {
	queue: VecDeque<Waiter>,
	draining: bool,
	closed: bool,
}

struct Waiter {
	id: u64,
	sender: oneshot::Sender<Result<Credential>>,
	enqueued_at: Instant,
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::_preludet::{IssueStep, ScriptedIssuer, build_test_broker};

	#[test]
	fn backoff_grows_linearly() {
		let policy = RetryPolicy::default();

		assert_eq!(policy.backoff(1), Duration::from_millis(100));
		assert_eq!(policy.backoff(2), Duration::from_millis(200));
	}

	#[test]
	fn builder_clamps_attempts_to_one() {
		let broker = CredentialBroker::with_policy(
			Arc::new(ScriptedIssuer::default()),
			RetryPolicy { max_attempts: 0, ..RetryPolicy::default() },
		);

		assert_eq!(broker.shared.policy.max_attempts, 1);
	}

	#[tokio::test]
	async fn idle_broker_reports_empty_snapshot() {
		let broker = build_test_broker(Arc::new(ScriptedIssuer::default()));

		assert_eq!(broker.snapshot(), BrokerSnapshot::default());
		assert_eq!(broker.reset(), 0);
	}

	#[tokio::test]
	async fn worker_goes_idle_after_draining() {
		let issuer = Arc::new(ScriptedIssuer::new([IssueStep::Token("T1".into())]));
		let broker = build_test_broker(issuer.clone());
		let credential = broker.acquire().await.expect("Acquire should succeed.");

		assert_eq!(credential.expose(), "T1");

		// The worker clears the flag after handing out the last credential.
		while broker.snapshot().draining {
			tokio::task::yield_now().await;
		}

		let snapshot = broker.snapshot();

		assert_eq!(snapshot.queued, 0);
		assert_eq!(snapshot.issued, 1);
		assert_eq!(snapshot.attempts, 1);
	}
}
