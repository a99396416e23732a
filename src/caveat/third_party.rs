use super::CaveatSet;
use crate::access::Access;
use crate::codec::{Reader, Writer};
use crate::crypto::{self, EncryptionKey, SigningKey};
use crate::error::{Error, Result};
use crate::util;

pub(crate) const NAME: &str = "third_party";

/// Demands that the bearer present a discharge token minted by the party at
/// `location`.
///
/// The `ticket` is sealed under the third party's encryption key and carries
/// the discharge signing key plus any caveats the third party must check
/// before discharging. The `verifier_key` seals the same discharge key under
/// the token's tail at the moment the caveat was appended, which is how the
/// original verifier recovers it.
#[derive(Clone, Debug)]
pub struct ThirdPartyCaveat {
	pub location: String,
	pub verifier_key: Vec<u8>,
	pub ticket: Vec<u8>,
	/// Issuer-side only, between `add_third_party` and signing. Never
	/// serialized.
	pub(crate) discharge_key: Option<SigningKey>,
}

impl ThirdPartyCaveat {
	pub(crate) fn prohibits(&self, _access: &dyn Access) -> Result<()> {
		Err(Error::BadCaveat(format!(
			"third-party caveat for {} is satisfied by a discharge token, not by evaluation",
			self.location
		)))
	}

	pub(crate) fn encode_body(&self) -> Result<Vec<u8>> {
		let mut w = Writer::new();
		w.array_len(3);
		w.str(&self.location);
		w.bin(&self.verifier_key);
		w.bin(&self.ticket);
		Ok(w.into_inner())
	}

	pub(crate) fn decode_body(body: &[u8]) -> Result<Self> {
		let mut r = Reader::new(body);
		if r.array_len()? != 3 {
			return Err(Error::Encoding("third-party caveat body must have 3 fields".into()));
		}
		let location = r.str()?;
		let verifier_key = r.bin()?;
		let ticket = r.bin()?;
		r.finish()?;
		Ok(ThirdPartyCaveat { location, verifier_key, ticket, discharge_key: None })
	}

	pub(crate) fn body_json(&self) -> Result<serde_json::Value> {
		Ok(serde_json::json!({
			"location": self.location,
			"verifier_key": util::to_base64(&self.verifier_key),
			"ticket": util::to_base64(&self.ticket),
		}))
	}

	pub(crate) fn from_json(value: &serde_json::Value) -> Result<Self> {
		let field = |name: &str| {
			value
				.get(name)
				.and_then(serde_json::Value::as_str)
				.ok_or_else(|| Error::Encoding(format!("third-party caveat body needs {name:?}")))
		};
		Ok(ThirdPartyCaveat {
			location: field("location")?.to_string(),
			verifier_key: util::from_base64(field("verifier_key")?)?,
			ticket: util::from_base64(field("ticket")?)?,
			discharge_key: None,
		})
	}
}

/// Plaintext of a sealed third-party ticket: the discharge signing key and
/// the caveats the third party must check before discharging.
#[derive(Debug)]
pub(crate) struct WireTicket {
	pub discharge_key: SigningKey,
	pub caveats: CaveatSet,
}

impl WireTicket {
	pub fn encode(&self) -> Result<Vec<u8>> {
		let mut w = Writer::new();
		w.array_len(2);
		w.bin(self.discharge_key.as_ref());
		w.raw(&self.caveats.encode());
		Ok(w.into_inner())
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let mut r = Reader::new(buf);
		if r.array_len()? != 2 {
			return Err(Error::Encoding("wire ticket must have 2 fields".into()));
		}
		let key = r.bin()?;
		let caveats = CaveatSet::read_from(&mut r)?;
		r.finish()?;
		Ok(WireTicket { discharge_key: SigningKey::try_from(key.as_slice())?, caveats })
	}

	/// Seal under the third party's encryption key.
	pub fn seal(&self, ka: &EncryptionKey) -> Result<Vec<u8>> {
		crypto::seal(ka, &self.encode()?)
	}

	/// Open a ticket sealed with [`WireTicket::seal`].
	pub fn unseal(ka: &EncryptionKey, ticket: &[u8]) -> Result<Self> {
		WireTicket::decode(&crypto::unseal(ka, ticket)?)
	}
}
