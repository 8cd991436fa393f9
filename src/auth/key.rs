//! Validated operation fingerprints used to deduplicate in-flight requests.

// std
use std::{borrow::Borrow, ops::Deref};
// self
use crate::_prelude::*;

const KEY_MAX_LEN: usize = 512;

/// Error returned when key validation fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum KeyError {
	/// The key was empty.
	#[error("Request key cannot be empty.")]
	Empty,
	/// The key contains control characters.
	#[error("Request key contains control characters.")]
	ContainsControl,
	/// The key exceeded the allowed byte length.
	#[error("Request key exceeds {max} bytes.")]
	TooLong {
		/// Maximum permitted byte length.
		max: usize,
	},
}

/// Fingerprint identifying a logical operation, e.g. `whois:example.com`.
///
/// Two calls with equal keys are considered the same request and share one in-flight
/// operation.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestKey(String);
impl RequestKey {
	/// Creates a new key after validation.
	pub fn new(value: impl AsRef<str>) -> Result<Self, KeyError> {
		let view = value.as_ref();

		validate_view(view)?;

		Ok(Self(view.to_owned()))
	}

	/// Builds a key from a namespace and its parts, joined with `:`.
	pub fn compose<'a>(
		namespace: &str,
		parts: impl IntoIterator<Item = &'a str>,
	) -> Result<Self, KeyError> {
		let mut buf = String::from(namespace);

		for part in parts {
			buf.push(':');
			buf.push_str(part);
		}

		Self::new(buf)
	}
}
impl Deref for RequestKey {
	type Target = str;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
impl AsRef<str> for RequestKey {
	fn as_ref(&self) -> &str {
		&self.0
	}
}
impl From<RequestKey> for String {
	fn from(value: RequestKey) -> Self {
		value.0
	}
}
impl TryFrom<String> for RequestKey {
	type Error = KeyError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		validate_view(&value)?;

		Ok(Self(value))
	}
}
impl TryFrom<&str> for RequestKey {
	type Error = KeyError;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}
impl Borrow<str> for RequestKey {
	fn borrow(&self) -> &str {
		&self.0
	}
}
impl Debug for RequestKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "RequestKey({})", self.0)
	}
}
impl Display for RequestKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}
impl FromStr for RequestKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s)
	}
}

fn validate_view(view: &str) -> Result<(), KeyError> {
	if view.is_empty() {
		return Err(KeyError::Empty);
	}
	if view.chars().any(char::is_control) {
		return Err(KeyError::ContainsControl);
	}
	if view.len() > KEY_MAX_LEN {
		return Err(KeyError::TooLong { max: KEY_MAX_LEN });
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn keys_validate_content_and_length() {
		assert_eq!(RequestKey::new(""), Err(KeyError::Empty));
		assert_eq!(RequestKey::new("dns:\nexample.com"), Err(KeyError::ContainsControl));
		assert!(RequestKey::new("search:best domains").is_ok(), "Spaces are legal in keys.");

		let exact = "k".repeat(KEY_MAX_LEN);

		RequestKey::new(&exact).expect("Exact length should succeed.");

		assert_eq!(
			RequestKey::new("k".repeat(KEY_MAX_LEN + 1)),
			Err(KeyError::TooLong { max: KEY_MAX_LEN })
		);
	}

	#[test]
	fn compose_joins_namespace_and_parts() {
		let key = RequestKey::compose("whois", ["example.com", "raw"])
			.expect("Composed key should be valid.");

		assert_eq!(key.as_ref(), "whois:example.com:raw");
		assert!(RequestKey::compose("dns", ["bad\u{7}"]).is_err());
	}

	#[test]
	fn serde_round_trip_enforces_validation() {
		let key: RequestKey = serde_json::from_str("\"screenshot:example.org\"")
			.expect("Key should deserialize successfully.");

		assert_eq!(key.as_ref(), "screenshot:example.org");
		assert!(serde_json::from_str::<RequestKey>("\"\"").is_err());
	}

	#[test]
	fn borrow_supports_fast_lookup() {
		let map: HashMap<RequestKey, u8> = HashMap::from_iter([(
			RequestKey::new("whois:example.com").expect("Key used for lookup should be valid."),
			7_u8,
		)]);

		assert_eq!(map.get("whois:example.com"), Some(&7));
	}
}
