//! Issuer configuration consumed by the broker, plus environment loading.

mod builder;

pub use builder::*;

// self
use crate::{_prelude::*, error::ConfigError};

/// Environment variable holding the issuer base URL.
pub const ENV_ISSUER_URL: &str = "LOOKUP_ISSUER_URL";
/// Environment variable holding the optional issuer API key.
pub const ENV_ISSUER_API_KEY: &str = "LOOKUP_ISSUER_API_KEY";
/// Environment variable selecting the runtime mode.
pub const ENV_MODE: &str = "LOOKUP_MODE";

/// Runtime mode of the hosting process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
	/// Local development; enables per-attempt diagnostics.
	Development,
	/// Production deployment.
	#[default]
	Production,
}
impl RuntimeMode {
	/// Returns a stable label suitable for logs.
	pub const fn as_str(self) -> &'static str {
		match self {
			RuntimeMode::Development => "development",
			RuntimeMode::Production => "production",
		}
	}

	/// Returns `true` in development mode.
	pub const fn is_development(self) -> bool {
		matches!(self, RuntimeMode::Development)
	}
}
impl Display for RuntimeMode {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
impl FromStr for RuntimeMode {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"development" | "dev" => Ok(RuntimeMode::Development),
			"production" | "prod" => Ok(RuntimeMode::Production),
			other => Err(ConfigError::invalid(
				ENV_MODE,
				format!("expected `development` or `production`, got `{other}`"),
			)),
		}
	}
}

/// Validated description of the credential-issuing endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuerConfig {
	/// Base URL the issuer is mounted under.
	pub base_url: Url,
	/// Fully resolved `POST` endpoint (`<base>/api/auth/token`).
	pub token_endpoint: Url,
	/// Optional API key sent as `X-API-Key`.
	pub api_key: Option<String>,
	/// Runtime mode of the hosting process.
	pub mode: RuntimeMode,
	/// Deadline for a single issuing call.
	pub fetch_timeout: Duration,
}
impl IssuerConfig {
	/// Default deadline for one issuing call.
	pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

	/// Creates a builder for the provided base URL.
	pub fn builder(base_url: Url) -> IssuerConfigBuilder {
		IssuerConfigBuilder::new(base_url)
	}

	/// Loads the configuration from process environment variables.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	/// Loads the configuration through an arbitrary variable lookup.
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let raw_url = lookup(ENV_ISSUER_URL)
			.filter(|value| !value.trim().is_empty())
			.ok_or(ConfigError::MissingVariable { name: ENV_ISSUER_URL })?;
		let base_url = Url::parse(raw_url.trim())
			.map_err(|source| ConfigError::InvalidIssuerUrl { source })?;
		let mut builder = Self::builder(base_url);

		if let Some(key) = lookup(ENV_ISSUER_API_KEY).filter(|value| !value.is_empty()) {
			builder = builder.api_key(key);
		}
		if let Some(mode) = lookup(ENV_MODE) {
			builder = builder.mode(mode.parse()?);
		}

		builder.build()
	}
}
impl Debug for IssuerConfig {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("IssuerConfig")
			.field("token_endpoint", &self.token_endpoint.as_str())
			.field("api_key_set", &self.api_key.is_some())
			.field("mode", &self.mode)
			.field("fetch_timeout", &self.fetch_timeout)
			.finish()
	}
}
