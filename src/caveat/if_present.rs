use super::{is_resource_unspecified, CaveatSet};
use crate::access::{Access, Action};
use crate::codec::{Reader, Writer};
use crate::error::{Error, Result};

pub(crate) const NAME: &str = "if_present";

/// Wrapper realizing the "applies only when the resource is referenced"
/// pattern.
///
/// The nested caveats are evaluated against the access. If every one of them
/// reports `ResourceUnspecified` — the access never mentions the resources
/// they restrict — the wrapper falls back to checking the access's action
/// against the `otherwise` mask. Any harder nested verdict is passed through.
#[derive(Clone, Debug)]
pub struct IfPresent {
	pub ifs: CaveatSet,
	pub otherwise: Action,
}

impl IfPresent {
	pub(crate) fn prohibits(&self, access: &dyn Access) -> Result<()> {
		let mut hard = Vec::new();
		let mut applied = false;
		for caveat in self.ifs.iter() {
			if caveat.is_attestation() {
				continue;
			}
			match caveat.prohibits(access) {
				Ok(()) => applied = true,
				Err(e) if is_resource_unspecified(&e) => {}
				Err(e) => {
					applied = true;
					hard.push(e);
				}
			}
		}
		if applied {
			return Error::join(hard);
		}
		// None of the nested caveats spoke to this access; restrict it to
		// the fallback action mask instead.
		match access.action() {
			Some(action) if !action.is_subset_of(self.otherwise) => Err(Error::Unauthorized(
				format!("action {action} exceeds the permitted fallback {}", self.otherwise),
			)),
			_ => Ok(()),
		}
	}

	pub(crate) fn encode_body(&self) -> Result<Vec<u8>> {
		let mut w = Writer::new();
		w.array_len(2);
		w.raw(&self.ifs.encode());
		w.uint(u64::from(self.otherwise.bits()));
		Ok(w.into_inner())
	}

	pub(crate) fn decode_body(body: &[u8]) -> Result<Self> {
		let mut r = Reader::new(body);
		if r.array_len()? != 2 {
			return Err(Error::Encoding("if-present body must have 2 fields".into()));
		}
		let ifs = CaveatSet::read_from(&mut r)?;
		let bits = r.uint()?;
		r.finish()?;
		let bits = u32::try_from(bits)
			.map_err(|_| Error::Encoding("if-present action mask exceeds 32 bits".into()))?;
		Ok(IfPresent { ifs, otherwise: Action::from_bits(bits) })
	}

	pub(crate) fn body_json(&self) -> Result<serde_json::Value> {
		Ok(serde_json::json!({
			"ifs": crate::json::caveats_to_json(self.ifs.iter())?,
			"else": self.otherwise,
		}))
	}

	pub(crate) fn from_json(value: &serde_json::Value) -> Result<Self> {
		let ifs_json = value
			.get("ifs")
			.ok_or_else(|| Error::Encoding("if-present body needs \"ifs\"".into()))?;
		let ifs = CaveatSet::from_caveats(crate::json::caveats_from_json(ifs_json)?)?;
		let otherwise = value
			.get("else")
			.cloned()
			.map(serde_json::from_value)
			.transpose()
			.map_err(|e| Error::Encoding(e.to_string()))?
			.unwrap_or(Action::NONE);
		Ok(IfPresent { ifs, otherwise })
	}
}
