//! Attaches single-use credentials to outbound backend requests.

// self
use crate::{_prelude::*, auth::Credential, broker::CredentialBroker, issuer::CredentialIssuer};

/// Describes how to attach a [`Credential`] to an outbound request without constraining the
/// HTTP client type.
pub trait RequestSigner<Request, E = Error>
where
	Self: Send + Sync,
{
	/// Consumes the request and returns it with authorization derived from `credential`.
	fn attach_credential(&self, request: Request, credential: &Credential) -> Result<Request, E>;
}

/// Signs `Authorization: Bearer <token>` onto reqwest requests.
#[cfg(feature = "reqwest")]
#[derive(Clone, Copy, Debug, Default)]
pub struct BearerSigner;
#[cfg(feature = "reqwest")]
impl RequestSigner<reqwest::RequestBuilder> for BearerSigner {
	fn attach_credential(
		&self,
		request: reqwest::RequestBuilder,
		credential: &Credential,
	) -> Result<reqwest::RequestBuilder> {
		Ok(request.bearer_auth(credential.expose()))
	}
}

/// Acquires a fresh credential from `broker` and signs `request` with it.
///
/// The credential is consumed by this request; call again for the next one.
pub async fn sign_request<I, S, R>(
	broker: &CredentialBroker<I>,
	signer: &S,
	request: R,
) -> Result<R>
where
	I: ?Sized + CredentialIssuer,
	S: RequestSigner<R>,
{
	let credential = broker.acquire().await?;

	signer.attach_credential(request, &credential)
}

#[cfg(all(test, feature = "reqwest"))]
mod tests {
	// self
	use super::*;
	use crate::_preludet::{ScriptedIssuer, build_test_broker};

	#[tokio::test]
	async fn bearer_signer_sets_authorization_header() {
		let broker = build_test_broker(Arc::new(ScriptedIssuer::default()));
		let client = ReqwestClient::new();
		let request = sign_request(&broker, &BearerSigner, client.get("http://backend.test/whois"))
			.await
			.expect("Signing should succeed.")
			.build()
			.expect("Request should build.");
		let header = request
			.headers()
			.get(reqwest::header::AUTHORIZATION)
			.expect("Authorization header should be present.");

		assert_eq!(header, "Bearer token-1");
		assert!(header.is_sensitive());
	}
}
