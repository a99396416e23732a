//! JSON representation for IPC with non-msgpack callers.
//!
//! Caveats cross this boundary as `{"type": <name>, "body": <json>}`, where
//! `type` is the canonical registered name, any registered alias, or the
//! decimal caveat-type number for a type this process has no registration
//! for. Unregistered caveats round-trip as opaque JSON but cannot be
//! converted to the msgpack wire form (nor vice versa).

use serde_json::Value;

use crate::caveat::{registry, Caveat, CaveatType, UnregisteredCaveat};
use crate::error::{Error, Result};

/// Encode caveats as a JSON array of `{"type", "body"}` objects.
pub fn caveats_to_json<'a>(caveats: impl IntoIterator<Item = &'a Caveat>) -> Result<Value> {
	let mut out = Vec::new();
	for caveat in caveats {
		out.push(serde_json::json!({
			"type": caveat.name(),
			"body": caveat.body_json()?,
		}));
	}
	Ok(Value::Array(out))
}

/// Decode a JSON array of `{"type", "body"}` objects.
pub fn caveats_from_json(value: &Value) -> Result<Vec<Caveat>> {
	let items = value
		.as_array()
		.ok_or_else(|| Error::Encoding("caveats must be a JSON array".into()))?;
	items.iter().map(caveat_from_json).collect()
}

/// Decode one `{"type", "body"}` object.
pub fn caveat_from_json(value: &Value) -> Result<Caveat> {
	let type_field = value
		.get("type")
		.ok_or_else(|| Error::Encoding("caveat object needs \"type\"".into()))?;
	let body = value.get("body").cloned().unwrap_or(Value::Null);

	match type_field {
		Value::String(name) => {
			if let Some(reg) = registry::lookup_name(name) {
				return (reg.decode_json)(&body);
			}
			if let Ok(n) = name.parse::<u64>() {
				return decode_by_number(CaveatType(n), body);
			}
			Err(Error::BadCaveat(format!("unknown caveat type {name:?}")))
		}
		Value::Number(n) => {
			let n = n
				.as_u64()
				.ok_or_else(|| Error::Encoding("caveat type number must be unsigned".into()))?;
			decode_by_number(CaveatType(n), body)
		}
		other => Err(Error::Encoding(format!("caveat type must be a string or number, found {other}"))),
	}
}

fn decode_by_number(caveat_type: CaveatType, body: Value) -> Result<Caveat> {
	match registry::lookup_type(caveat_type) {
		Some(reg) => (reg.decode_json)(&body),
		None => Ok(Caveat::Unregistered(UnregisteredCaveat::from_json(caveat_type, body))),
	}
}

/// IPC shape for minting and attenuation requests:
/// `{"location": "...", "caveats": [...]}`.
#[derive(Debug)]
pub struct TokenRequest {
	pub location: String,
	pub caveats: Vec<Caveat>,
}

impl TokenRequest {
	pub fn to_json(&self) -> Result<Value> {
		Ok(serde_json::json!({
			"location": self.location,
			"caveats": caveats_to_json(&self.caveats)?,
		}))
	}

	pub fn from_json(value: &Value) -> Result<Self> {
		let location = value
			.get("location")
			.and_then(Value::as_str)
			.ok_or_else(|| Error::Encoding("token request needs \"location\"".into()))?
			.to_string();
		let caveats = match value.get("caveats") {
			Some(caveats) => caveats_from_json(caveats)?,
			None => Vec::new(),
		};
		Ok(TokenRequest { location, caveats })
	}
}
