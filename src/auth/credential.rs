//! Single-use bearer credential with redacted formatting.

// self
use crate::_prelude::*;

/// Single-use bearer credential minted by the issuing endpoint.
///
/// A credential is handed to exactly one waiter and is consumed by the downstream call it
/// authorizes, so the type is deliberately not `Clone`.
#[derive(PartialEq, Eq)]
pub struct Credential {
	secret: String,
	/// Wall-clock instant the broker received the credential.
	pub issued_at: OffsetDateTime,
}
impl Credential {
	/// Wraps a freshly issued secret.
	pub fn new(secret: impl Into<String>) -> Self {
		Self { secret: secret.into(), issued_at: OffsetDateTime::now_utc() }
	}

	/// Returns the inner token value. Callers must avoid logging this string.
	pub fn expose(&self) -> &str {
		&self.secret
	}

	/// Consumes the credential, returning the raw token.
	pub fn into_secret(self) -> String {
		self.secret
	}

	/// Formats the value of an `Authorization` header for the credential.
	pub fn bearer(&self) -> String {
		format!("Bearer {}", self.secret)
	}
}
impl AsRef<str> for Credential {
	fn as_ref(&self) -> &str {
		self.expose()
	}
}
impl Debug for Credential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Credential")
			.field("secret", &"<redacted>")
			.field("issued_at", &self.issued_at)
			.finish()
	}
}
impl Display for Credential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}
