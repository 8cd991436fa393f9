//! Crate-level error types shared by the broker, deduplicator, batch coordinator, and monitor.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shareable foreign error. Outcomes are fanned out to many callers, so sources are
/// reference-counted rather than boxed.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

/// Canonical error exposed by public APIs.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Credential issuer failure for a single attempt.
	#[error(transparent)]
	Issuer(#[from] IssuerError),

	/// Every fetch attempt for a waiter failed.
	#[error("Credential issuer failed after {attempts} attempt(s).")]
	RetriesExhausted {
		/// Number of attempts performed.
		attempts: u32,
		/// Error returned by the final attempt.
		#[source]
		last: Box<Error>,
	},
	/// The deduplicator is at capacity and the request was low priority.
	#[error("In-flight capacity of {limit} reached; rejected `{key}`.")]
	CapacityExceeded {
		/// Key of the rejected request.
		key: String,
		/// Configured in-flight cap.
		limit: usize,
	},
	/// The deduplicator stayed at capacity for the whole bounded wait.
	#[error("No in-flight slot freed for `{key}` within {waited:?}.")]
	SlotWaitTimeout {
		/// Key of the waiting request.
		key: String,
		/// Time spent waiting for a slot.
		waited: Duration,
	},
	/// A deduplicated operation lost its race against the timeout.
	#[error("Operation `{key}` timed out after {after:?}.")]
	OperationTimeout {
		/// Key of the timed-out operation.
		key: String,
		/// Timeout that elapsed.
		after: Duration,
	},
	/// An item aged out of the batch queue before its batch was flushed.
	#[error("Batch item waited {waited:?}, exceeding the maximum of {max_wait:?}.")]
	BatchWaitTimeout {
		/// Age of the item when it was evicted.
		waited: Duration,
		/// Configured maximum age.
		max_wait: Duration,
	},
	/// The downstream batch operation returned fewer results than items.
	#[error("Batch processor returned {received} result(s) for {expected} item(s).")]
	BatchIncomplete {
		/// Number of items submitted downstream.
		expected: usize,
		/// Number of results returned.
		received: usize,
	},
	/// The broker was reset while the request was pending.
	#[error("Credential broker state was reset while the request was pending.")]
	StateReset,
	/// The broker has been shut down and no longer accepts requests.
	#[error("Credential broker is shut down.")]
	Closed,
	/// Caller-supplied operation or batch processor failure.
	#[error("Operation failed: {0}")]
	Operation(#[source] SharedError),
}
impl Error {
	/// Wraps a caller-supplied failure so it can be shared by every attached caller.
	pub fn operation(src: impl 'static + Send + Sync + StdError) -> Self {
		Self::Operation(Arc::new(src))
	}

	/// Returns `true` when the error (or the last attempt it wraps) is a timeout.
	pub fn is_timeout(&self) -> bool {
		match self {
			Self::Issuer(IssuerError::Timeout { .. })
			| Self::SlotWaitTimeout { .. }
			| Self::OperationTimeout { .. }
			| Self::BatchWaitTimeout { .. } => true,
			Self::RetriesExhausted { last, .. } => last.is_timeout(),
			_ => false,
		}
	}
}

/// Configuration and validation failures.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ConfigError {
	/// Issuer base URL cannot be parsed.
	#[error("Issuer base URL is invalid.")]
	InvalidIssuerUrl {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Issuer base URL uses an unsupported scheme or cannot act as a base.
	#[error("Issuer base URL must be an absolute http(s) URL: {url}.")]
	UnsupportedIssuerUrl {
		/// Rejected URL.
		url: String,
	},
	/// A required environment variable is missing.
	#[error("Environment variable `{name}` is not set.")]
	MissingVariable {
		/// Variable name.
		name: &'static str,
	},
	/// A setting holds a value outside its accepted range.
	#[error("Setting `{name}` is invalid: {reason}.")]
	InvalidSetting {
		/// Setting name.
		name: &'static str,
		/// Human-readable explanation.
		reason: String,
	},
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed: {message}.")]
	HttpClientBuild {
		/// Builder failure summary.
		message: String,
	},
}
impl ConfigError {
	/// Shorthand for [`ConfigError::InvalidSetting`].
	pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
		Self::InvalidSetting { name, reason: reason.into() }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::HttpClientBuild { message: e.to_string() }
	}
}

/// Single-attempt failures reported by a credential issuer.
#[derive(Clone, Debug, ThisError)]
pub enum IssuerError {
	/// The issuing endpoint could not be reached (DNS, TCP, TLS).
	#[error("Credential issuer is unavailable.")]
	Unavailable {
		/// Transport-specific network error.
		#[source]
		source: SharedError,
	},
	/// The issuing call exceeded its deadline.
	#[error("Credential issuer did not respond within {after:?}.")]
	Timeout {
		/// Deadline that elapsed.
		after: Duration,
	},
	/// The issuing endpoint answered with a non-2xx status or an unusable payload.
	#[error("Credential issuer rejected the request: {reason}.")]
	Rejected {
		/// HTTP status code, when available.
		status: Option<u16>,
		/// Provider- or crate-supplied reason string.
		reason: String,
	},
}
impl IssuerError {
	/// Wraps a transport-specific network error.
	pub fn unavailable(src: impl 'static + Send + Sync + StdError) -> Self {
		Self::Unavailable { source: Arc::new(src) }
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[derive(Debug, ThisError)]
	#[error("lookup backend exploded")]
	struct Boom;

	#[test]
	fn retries_exhausted_exposes_last_attempt_as_source() {
		let last = Error::from(IssuerError::Rejected { status: Some(503), reason: "busy".into() });
		let err = Error::RetriesExhausted { attempts: 2, last: Box::new(last) };
		let source = StdError::source(&err).expect("Exhausted retries should expose a source.");

		assert_eq!(err.to_string(), "Credential issuer failed after 2 attempt(s).");
		assert_eq!(source.to_string(), "Credential issuer rejected the request: busy.");
	}

	#[test]
	fn timeout_classification_looks_through_retries() {
		let timeout = Error::from(IssuerError::Timeout { after: Duration::from_secs(10) });

		assert!(timeout.is_timeout());
		assert!(Error::RetriesExhausted { attempts: 2, last: Box::new(timeout) }.is_timeout());
		assert!(!Error::StateReset.is_timeout());
		assert!(
			!Error::from(IssuerError::Rejected { status: Some(400), reason: "bad".into() })
				.is_timeout()
		);
	}

	#[test]
	fn shared_operation_errors_clone_cheaply() {
		let err = Error::operation(Boom);
		let cloned = err.clone();

		match (&err, &cloned) {
			(Error::Operation(a), Error::Operation(b)) => assert!(Arc::ptr_eq(a, b)),
			other => panic!("Unexpected variants: {other:?}."),
		}

		assert_eq!(cloned.to_string(), "Operation failed: lookup backend exploded");
	}
}
