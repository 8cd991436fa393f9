// self
use crate::{
	_prelude::*,
	config::{IssuerConfig, RuntimeMode},
	error::ConfigError,
};

const TOKEN_PATH: [&str; 3] = ["api", "auth", "token"];

/// Builder for [`IssuerConfig`] values.
#[derive(Debug)]
pub struct IssuerConfigBuilder {
	/// Base URL the issuer is mounted under.
	pub base_url: Url,
	/// Optional API key sent as `X-API-Key`.
	pub api_key: Option<String>,
	/// Runtime mode of the hosting process.
	pub mode: RuntimeMode,
	/// Deadline for a single issuing call.
	pub fetch_timeout: Duration,
}
impl IssuerConfigBuilder {
	/// Creates a new builder seeded with the provided base URL.
	pub fn new(base_url: Url) -> Self {
		Self {
			base_url,
			api_key: None,
			mode: RuntimeMode::default(),
			fetch_timeout: IssuerConfig::DEFAULT_FETCH_TIMEOUT,
		}
	}

	/// Sets the API key forwarded as `X-API-Key`.
	pub fn api_key(mut self, key: impl Into<String>) -> Self {
		self.api_key = Some(key.into());

		self
	}

	/// Overrides the runtime mode.
	pub fn mode(mut self, mode: RuntimeMode) -> Self {
		self.mode = mode;

		self
	}

	/// Overrides the per-call deadline (defaults to 10 seconds).
	pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
		self.fetch_timeout = timeout;

		self
	}

	/// Consumes the builder and validates the resulting configuration.
	pub fn build(self) -> Result<IssuerConfig, ConfigError> {
		validate_base_url(&self.base_url)?;

		if self.fetch_timeout.is_zero() {
			return Err(ConfigError::invalid("fetch_timeout", "must be greater than zero"));
		}

		let token_endpoint = token_endpoint(&self.base_url)?;

		Ok(IssuerConfig {
			base_url: self.base_url,
			token_endpoint,
			api_key: self.api_key,
			mode: self.mode,
			fetch_timeout: self.fetch_timeout,
		})
	}
}

fn validate_base_url(url: &Url) -> Result<(), ConfigError> {
	if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
		Err(ConfigError::UnsupportedIssuerUrl { url: url.to_string() })
	} else {
		Ok(())
	}
}

fn token_endpoint(base: &Url) -> Result<Url, ConfigError> {
	let mut endpoint = base.clone();

	endpoint.set_query(None);
	endpoint.set_fragment(None);
	endpoint
		.path_segments_mut()
		.map_err(|_| ConfigError::UnsupportedIssuerUrl { url: base.to_string() })?
		.pop_if_empty()
		.extend(TOKEN_PATH);

	Ok(endpoint)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn url(value: &str) -> Url {
		Url::parse(value).expect("Failed to parse fixture URL.")
	}

	#[test]
	fn token_endpoint_appends_to_base_path() {
		let root = IssuerConfig::builder(url("https://backend.example.com"))
			.build()
			.expect("Root base URL should build.");
		let nested = IssuerConfig::builder(url("http://127.0.0.1:8080/lookup/?cache=1"))
			.build()
			.expect("Nested base URL should build.");

		assert_eq!(root.token_endpoint.as_str(), "https://backend.example.com/api/auth/token");
		assert_eq!(nested.token_endpoint.as_str(), "http://127.0.0.1:8080/lookup/api/auth/token");
	}

	#[test]
	fn rejects_unsupported_schemes_and_zero_timeouts() {
		let err = IssuerConfig::builder(url("ftp://backend.example.com"))
			.build()
			.expect_err("Non-HTTP schemes should be rejected.");

		assert!(matches!(err, ConfigError::UnsupportedIssuerUrl { .. }));

		let err = IssuerConfig::builder(url("mailto:ops@example.com"))
			.build()
			.expect_err("Cannot-be-a-base URLs should be rejected.");

		assert!(matches!(err, ConfigError::UnsupportedIssuerUrl { .. }));

		let err = IssuerConfig::builder(url("https://backend.example.com"))
			.fetch_timeout(Duration::ZERO)
			.build()
			.expect_err("Zero timeouts should be rejected.");

		assert!(matches!(err, ConfigError::InvalidSetting { name: "fetch_timeout", .. }));
	}
}
