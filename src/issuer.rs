//! Transport seam for the credential-issuing endpoint.
//!
//! The broker only depends on [`CredentialIssuer`]; the bundled [`ReqwestIssuer`] speaks the
//! issuing endpoint's contract (`POST <base>/api/auth/token`, JSON `{ "token": string }`),
//! while tests and alternative transports implement the trait directly. Payload
//! classification lives in [`parse_token_response`] so every transport maps status codes
//! and malformed bodies the same way.

// self
use crate::{_prelude::*, auth::Credential, error::IssuerError};
#[cfg(feature = "reqwest")]
use crate::{config::IssuerConfig, error::ConfigError};

/// Boxed future returned by [`CredentialIssuer::issue`].
pub type IssueFuture<'a> = Pin<Box<dyn Future<Output = Result<Credential>> + 'a + Send>>;

const BODY_PREVIEW_LEN: usize = 128;

/// Source of single-use credentials.
///
/// Each call must mint a fresh credential; the broker never hands one value to two waiters
/// and relies on the issuer for uniqueness. Implementations are shared behind `Arc` and must
/// be `Send + Sync + 'static`. The broker bounds every call with its own deadline, so
/// transports need not enforce one, although a transport-level timeout should be classified
/// as [`IssuerError::Timeout`] when it fires first.
pub trait CredentialIssuer
where
	Self: 'static + Send + Sync,
{
	/// Requests one credential from the issuing endpoint.
	fn issue(&self) -> IssueFuture<'_>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	token: Option<String>,
}

/// Classifies an issuing-endpoint response.
///
/// Non-2xx statuses, malformed JSON, and a missing or empty `token` field all map to
/// [`IssuerError::Rejected`].
pub fn parse_token_response(status: u16, body: &[u8]) -> Result<Credential> {
	if !(200..300).contains(&status) {
		return Err(IssuerError::Rejected {
			status: Some(status),
			reason: format!("HTTP {status}: {}", body_preview(body)),
		}
		.into());
	}

	let de = &mut serde_json::Deserializer::from_slice(body);
	let payload: TokenResponse = serde_path_to_error::deserialize(de).map_err(|err| {
		IssuerError::Rejected {
			status: Some(status),
			reason: format!("malformed token payload at `{}`: {}", err.path(), err.inner()),
		}
	})?;

	match payload.token {
		Some(token) if !token.trim().is_empty() => Ok(Credential::new(token)),
		_ => Err(IssuerError::Rejected {
			status: Some(status),
			reason: "response is missing the `token` field".into(),
		}
		.into()),
	}
}

fn body_preview(body: &[u8]) -> String {
	let text = String::from_utf8_lossy(body);
	let trimmed = text.trim();

	if trimmed.is_empty() {
		return "<empty body>".into();
	}

	match trimmed.char_indices().nth(BODY_PREVIEW_LEN) {
		Some((idx, _)) => format!("{}...", &trimmed[..idx]),
		None => trimmed.to_owned(),
	}
}

/// [`CredentialIssuer`] backed by a reqwest client.
///
/// Requests carry `Content-Type: application/json`, the optional `X-API-Key`, and
/// anti-cache headers. Redirects are not followed: the issuing endpoint answers directly.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug)]
pub struct ReqwestIssuer {
	client: ReqwestClient,
	config: IssuerConfig,
}
#[cfg(feature = "reqwest")]
impl ReqwestIssuer {
	/// Builds an issuer with its own client honoring `config.fetch_timeout`.
	pub fn new(config: IssuerConfig) -> Result<Self> {
		let client = ReqwestClient::builder()
			.timeout(config.fetch_timeout)
			.redirect(reqwest::redirect::Policy::none())
			.build()
			.map_err(ConfigError::from)?;

		Ok(Self { client, config })
	}

	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient, config: IssuerConfig) -> Self {
		Self { client, config }
	}

	/// Returns the configuration the issuer was built from.
	pub fn config(&self) -> &IssuerConfig {
		&self.config
	}
}
#[cfg(feature = "reqwest")]
impl CredentialIssuer for ReqwestIssuer {
	fn issue(&self) -> IssueFuture<'_> {
		use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA};

		Box::pin(async move {
			let mut request = self
				.client
				.post(self.config.token_endpoint.clone())
				.header(CONTENT_TYPE, "application/json")
				.header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
				.header(PRAGMA, "no-cache")
				.header(EXPIRES, "0")
				.body("{}");

			if let Some(key) = self.config.api_key.as_deref() {
				request = request.header("X-API-Key", key);
			}

			let timeout = self.config.fetch_timeout;
			let response =
				request.send().await.map_err(|err| map_reqwest_error(err, timeout))?;
			let status = response.status().as_u16();
			let body = response.bytes().await.map_err(|err| map_reqwest_error(err, timeout))?;

			parse_token_response(status, &body)
		})
	}
}

#[cfg(feature = "reqwest")]
fn map_reqwest_error(err: ReqwestError, timeout: Duration) -> Error {
	if err.is_builder() {
		return ConfigError::from(err).into();
	}
	if err.is_timeout() {
		return IssuerError::Timeout { after: timeout }.into();
	}

	IssuerError::unavailable(err).into()
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn rejection(result: Result<Credential>) -> (Option<u16>, String) {
		match result {
			Err(Error::Issuer(IssuerError::Rejected { status, reason })) => (status, reason),
			other => panic!("Expected an issuer rejection, got {other:?}."),
		}
	}

	#[test]
	fn parses_successful_payload() {
		let credential = parse_token_response(200, br#"{"token":"T1","expiresIn":60}"#)
			.expect("Well-formed payload should parse.");

		assert_eq!(credential.expose(), "T1");
	}

	#[test]
	fn non_success_status_is_rejected_with_preview() {
		let (status, reason) = rejection(parse_token_response(503, b"upstream busy"));

		assert_eq!(status, Some(503));
		assert_eq!(reason, "HTTP 503: upstream busy");

		let (_, reason) = rejection(parse_token_response(500, b""));

		assert_eq!(reason, "HTTP 500: <empty body>");
	}

	#[test]
	fn malformed_payload_reports_json_path() {
		let (status, reason) = rejection(parse_token_response(200, br#"{"token":42}"#));

		assert_eq!(status, Some(200));
		assert!(reason.starts_with("malformed token payload at `token`"), "{reason}");
	}

	#[test]
	fn missing_or_blank_token_is_rejected() {
		let (_, reason) = rejection(parse_token_response(200, br#"{"ok":true}"#));

		assert_eq!(reason, "response is missing the `token` field");

		let (_, reason) = rejection(parse_token_response(201, br#"{"token":"  "}"#));

		assert_eq!(reason, "response is missing the `token` field");
	}

	#[test]
	fn long_bodies_are_truncated() {
		let body = "x".repeat(BODY_PREVIEW_LEN * 2);
		let (_, reason) = rejection(parse_token_response(400, body.as_bytes()));

		assert_eq!(reason.len(), "HTTP 400: ".len() + BODY_PREVIEW_LEN + "...".len());
	}
}
