//! Drain worker: pops waiters in FIFO order and fetches one credential per waiter.

// self
use crate::{
	_prelude::*,
	auth::Credential,
	broker::{COMPONENT, Shared, Waiter},
	error::IssuerError,
	issuer::CredentialIssuer,
	obs,
};

impl<I> Shared<I>
where
	I: ?Sized + CredentialIssuer,
{
	/// Spawns a drain worker. The caller must have flipped `draining` to `true`.
	pub(super) fn spawn_worker(this: &Arc<Self>) {
		let guard = DrainGuard { shared: this.clone(), finished: false };

		tokio::spawn(guard.run());
	}

	#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
	async fn fetch_with_retry(&self, waiter: u64) -> Result<Credential> {
		let _gate = self.fetch_gate.lock().await;
		let max_attempts = self.policy.max_attempts;
		let mut attempt = 0;

		loop {
			attempt += 1;
			self.metrics.record_attempt();

			let outcome =
				match tokio::time::timeout(self.policy.attempt_timeout, self.issuer.issue()).await {
					Ok(outcome) => outcome,
					Err(_) =>
						Err(IssuerError::Timeout { after: self.policy.attempt_timeout }.into()),
				};

			match outcome {
				Ok(credential) => {
					if self.mode.is_development() {
						obs::event!(debug, waiter, attempt, "credential issued");
					}

					return Ok(credential);
				},
				Err(err) if attempt >= max_attempts => {
					obs::event!(
						warn,
						waiter,
						attempt,
						error = %err,
						"credential fetch exhausted retries"
					);

					return Err(Error::RetriesExhausted { attempts: attempt, last: Box::new(err) });
				},
				Err(err) => {
					let backoff = self.policy.backoff(attempt);

					if self.mode.is_development() {
						obs::event!(
							debug,
							waiter,
							attempt,
							?backoff,
							error = %err,
							"credential fetch failed; retrying"
						);
					}

					tokio::time::sleep(backoff).await;
				},
			}
		}
	}

	#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
	async fn serve(&self, waiter: Waiter) {
		let Waiter { id, sender, enqueued_at } = waiter;

		if sender.is_closed() {
			self.metrics.record_abandoned();

			return;
		}

		let queued_for = enqueued_at.elapsed();
		let result = self.fetch_with_retry(id).await;

		match &result {
			Ok(_) => self.metrics.record_issued(),
			Err(_) => self.metrics.record_failure(),
		}

		if sender.send(result).is_err() {
			// Credentials are single-use; one nobody is waiting for is discarded, never requeued.
			self.metrics.record_abandoned();
			obs::event!(debug, waiter = id, "waiter left during fetch; discarding outcome");
		}

		obs::event!(trace, waiter = id, ?queued_for, "waiter served");
	}
}

/// Owns the worker loop and settles the queue if the loop ends abnormally.
struct DrainGuard<I>
where
	I: ?Sized + CredentialIssuer,
{
	shared: Arc<Shared<I>>,
	finished: bool,
}
impl<I> DrainGuard<I>
where
	I: ?Sized + CredentialIssuer,
{
	async fn run(mut self) {
		loop {
			let next = {
				let mut state = self.shared.state.lock();

				match state.queue.pop_front() {
					Some(waiter) => {
						obs::record_queue_depth(COMPONENT, state.queue.len());

						waiter
					},
					None => {
						// Checked and cleared under one lock: an enqueue racing with this
						// transition either lands before the pop or sees `draining == false`.
						state.draining = false;
						self.finished = true;

						return;
					},
				}
			};

			self.shared.serve(next).await;
		}
	}
}
impl<I> Drop for DrainGuard<I>
where
	I: ?Sized + CredentialIssuer,
{
	fn drop(&mut self) {
		if self.finished {
			return;
		}

		// Only an issuer panic hands the queue to a fresh worker. Runtime teardown cancels every
		// task, so a replacement would be cancelled too; fail the queue instead.
		let restart = std::thread::panicking() && {
			let mut state = self.shared.state.lock();

			state.draining =
				!state.queue.is_empty() && tokio::runtime::Handle::try_current().is_ok();

			state.draining
		};

		obs::event!(warn, restart, "credential drain worker stopped unexpectedly");

		if restart {
			Shared::spawn_worker(&self.shared);

			return;
		}

		let stranded = {
			let mut state = self.shared.state.lock();

			state.draining = false;

			std::mem::take(&mut state.queue)
		};

		self.shared.reject_waiters(stranded);
	}
}
