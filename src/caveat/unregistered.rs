use super::CaveatType;
use crate::access::Access;
use crate::error::{Error, Result};

/// Opaque pass-through for caveat types this process does not know.
///
/// Carries the raw bytes it arrived in so that signature verification still
/// works, and refuses every access: a verifier that does not understand a
/// caveat must refuse the request. Serializable only in the format it
/// arrived in.
#[derive(Clone, Debug, PartialEq)]
pub struct UnregisteredCaveat {
	pub caveat_type: CaveatType,
	pub raw_msgpack: Option<Vec<u8>>,
	pub raw_json: Option<serde_json::Value>,
}

impl UnregisteredCaveat {
	pub(crate) fn from_msgpack(caveat_type: CaveatType, body: Vec<u8>) -> Self {
		UnregisteredCaveat { caveat_type, raw_msgpack: Some(body), raw_json: None }
	}

	pub(crate) fn from_json(caveat_type: CaveatType, body: serde_json::Value) -> Self {
		UnregisteredCaveat { caveat_type, raw_msgpack: None, raw_json: Some(body) }
	}

	pub(crate) fn prohibits(&self, _access: &dyn Access) -> Result<()> {
		Err(Error::BadCaveat(format!("unregistered caveat type {}", self.caveat_type)))
	}

	pub(crate) fn encode_body(&self) -> Result<Vec<u8>> {
		self.raw_msgpack.clone().ok_or_else(|| {
			Error::BadCaveat(format!(
				"unregistered caveat type {} has no msgpack form",
				self.caveat_type
			))
		})
	}

	pub(crate) fn body_json(&self) -> Result<serde_json::Value> {
		self.raw_json.clone().ok_or_else(|| {
			Error::BadCaveat(format!(
				"unregistered caveat type {} has no JSON form",
				self.caveat_type
			))
		})
	}
}
