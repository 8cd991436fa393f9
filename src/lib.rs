//! Concurrency and credential control for lookup backends: a FIFO broker for single-use
//! credentials, request deduplication, batch coordination, and memory-pressure cleanup.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod batch;
pub mod broker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod ext;
pub mod issuer;
pub mod monitor;
pub mod obs;
#[cfg(any(test, feature = "test"))]
#[doc(hidden)]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` feature.

	pub use crate::_prelude::*;

	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use crate::{
		auth::Credential,
		broker::{CredentialBroker, RetryPolicy},
		error::IssuerError,
		issuer::{CredentialIssuer, IssueFuture},
	};

	/// Scripted outcome replayed by [`ScriptedIssuer`].
	#[derive(Clone, Debug)]
	pub enum IssueStep {
		/// Issue the provided token.
		Token(String),
		/// Fail with an issuer rejection carrying the provided reason.
		Reject(String),
		/// Sleep for the provided duration before issuing the token.
		Delayed(Duration, String),
		/// Panic inside the issuer call.
		Panic,
	}

	/// In-process issuer that replays scripted steps and records call concurrency.
	///
	/// Once the script is exhausted it mints `token-{n}` values so every call stays unique.
	#[derive(Debug, Default)]
	pub struct ScriptedIssuer {
		steps: Mutex<VecDeque<IssueStep>>,
		calls: AtomicUsize,
		active: AtomicUsize,
		peak: AtomicUsize,
		log: Mutex<Vec<usize>>,
	}
	impl ScriptedIssuer {
		/// Creates an issuer that replays `steps` in order.
		pub fn new(steps: impl IntoIterator<Item = IssueStep>) -> Self {
			Self { steps: Mutex::new(steps.into_iter().collect()), ..Default::default() }
		}

		/// Total number of issuer calls observed so far.
		pub fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}

		/// Highest number of simultaneously active calls.
		pub fn peak_concurrency(&self) -> usize {
			self.peak.load(Ordering::SeqCst)
		}

		/// Call ordinals in the order their calls started.
		pub fn started(&self) -> Vec<usize> {
			self.log.lock().clone()
		}
	}
	impl CredentialIssuer for ScriptedIssuer {
		fn issue(&self) -> IssueFuture<'_> {
			Box::pin(async move {
				let ordinal = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
				let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;

				self.peak.fetch_max(active, Ordering::SeqCst);
				self.log.lock().push(ordinal);

				let step = self.steps.lock().pop_front();
				let result = match step {
					Some(IssueStep::Token(token)) => Ok(Credential::new(token)),
					Some(IssueStep::Reject(reason)) =>
						Err(IssuerError::Rejected { status: Some(500), reason }.into()),
					Some(IssueStep::Delayed(delay, token)) => {
						tokio::time::sleep(delay).await;

						Ok(Credential::new(token))
					},
					Some(IssueStep::Panic) => panic!("scripted issuer panicked"),
					None => {
						tokio::task::yield_now().await;

						Ok(Credential::new(format!("token-{ordinal}")))
					},
				};

				self.active.fetch_sub(1, Ordering::SeqCst);

				result
			})
		}
	}

	/// Builds a broker over `issuer` with the default retry policy and a zero backoff so tests
	/// that exercise retries stay fast.
	pub fn build_test_broker(issuer: Arc<ScriptedIssuer>) -> CredentialBroker<ScriptedIssuer> {
		CredentialBroker::with_policy(
			issuer,
			RetryPolicy { base_backoff: Duration::ZERO, ..RetryPolicy::default() },
		)
	}
}

mod _prelude {
	pub use std::{
		collections::{HashMap, VecDeque},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
		time::Duration,
	};

	pub use async_lock::{Mutex as AsyncMutex, Semaphore};
	pub use parking_lot::Mutex;
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::OffsetDateTime;
	pub use tokio::{sync::oneshot, time::Instant};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
