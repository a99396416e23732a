use crate::access::Access;
use crate::codec::{Reader, Writer};
use crate::crypto;
use crate::error::{Error, Result};
use crate::util;

pub(crate) const NAME: &str = "bind_to_parent_token";

/// Length of the digest prefix a discharge is pinned with; matches the HMAC
/// truncation convention.
pub const BINDING_PREFIX_LEN: usize = 16;

/// Pins a discharge token to a specific parent token: the payload must be a
/// prefix of the SHA-256 of one of the parent's chain tails. Only meaningful
/// on discharge tokens; resolved by the signature machinery, never evaluated
/// against an access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindToParentToken(pub Vec<u8>);

impl BindToParentToken {
	/// Binding payload for a parent with the given tail.
	pub fn from_parent_tail(tail: &[u8]) -> Self {
		BindToParentToken(crypto::digest(tail)[..BINDING_PREFIX_LEN].to_vec())
	}

	/// Whether this binding pins to a chain tail with digest `binding_id`.
	pub(crate) fn matches(&self, binding_id: &[u8]) -> bool {
		self.0.len() <= binding_id.len() && crypto::ct_eq(&self.0, &binding_id[..self.0.len()])
	}

	pub(crate) fn prohibits(&self, _access: &dyn Access) -> Result<()> {
		Err(Error::BadCaveat(
			"parent-token bindings are checked during signature verification".into(),
		))
	}

	pub(crate) fn encode_body(&self) -> Result<Vec<u8>> {
		let mut w = Writer::new();
		w.bin(&self.0);
		Ok(w.into_inner())
	}

	pub(crate) fn decode_body(body: &[u8]) -> Result<Self> {
		let mut r = Reader::new(body);
		let bytes = r.bin()?;
		r.finish()?;
		Ok(BindToParentToken(bytes))
	}

	pub(crate) fn body_json(&self) -> Result<serde_json::Value> {
		Ok(serde_json::Value::String(util::to_base64(&self.0)))
	}

	pub(crate) fn from_json(value: &serde_json::Value) -> Result<Self> {
		let s = value
			.as_str()
			.ok_or_else(|| Error::Encoding("binding body must be a base64 string".into()))?;
		Ok(BindToParentToken(util::from_base64(s)?))
	}
}
