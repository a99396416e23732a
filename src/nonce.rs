use rand::RngCore;
use rmpv::Value;
use uuid::Uuid;

use crate::codec::Writer;
use crate::error::{Error, Result};

/// Length of the per-token randomness.
pub const RND_LEN: usize = 16;

/// Namespace for the derived token UUID.
const UUID_NAMESPACE: Uuid = Uuid::from_bytes(*b"florentine-nonce");

/// Per-token identifying header: which signing key the token was issued
/// under (`kid`, opaque), 16 bytes of randomness, and whether the token is a
/// finalized-signature proof.
///
/// Two wire versions coexist: v0 `[kid, rnd]` and v1 `[kid, rnd, proof]`.
/// New nonces always encode as v1; a nonce decoded from the v0 form
/// remembers that and re-encodes identically, since these bytes are the base
/// of the signature chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nonce {
	kid: Vec<u8>,
	rnd: [u8; RND_LEN],
	proof: bool,
	legacy: bool,
}

impl Nonce {
	pub(crate) fn new(kid: Vec<u8>, proof: bool) -> Self {
		let mut rnd = [0u8; RND_LEN];
		rand::thread_rng().fill_bytes(&mut rnd);
		Nonce { kid, rnd, proof, legacy: false }
	}

	/// The opaque key-id naming the signing key.
	pub fn kid(&self) -> &[u8] {
		&self.kid
	}

	pub fn rnd(&self) -> &[u8; RND_LEN] {
		&self.rnd
	}

	pub fn is_proof(&self) -> bool {
		self.proof
	}

	/// Stable human-readable identifier for the token:
	/// `uuid5(uuid5(namespace, kid), rnd)`.
	pub fn uuid(&self) -> Uuid {
		Uuid::new_v5(&Uuid::new_v5(&UUID_NAMESPACE, &self.kid), &self.rnd)
	}

	pub(crate) fn encode(&self) -> Vec<u8> {
		let mut w = Writer::new();
		self.encode_into(&mut w);
		w.into_inner()
	}

	pub(crate) fn encode_into(&self, w: &mut Writer) {
		w.array_len(if self.legacy { 2 } else { 3 });
		w.bin(&self.kid);
		w.bin(&self.rnd);
		if !self.legacy {
			w.bool(self.proof);
		}
	}

	pub(crate) fn from_value(value: Value) -> Result<Nonce> {
		let items = match value {
			Value::Array(items) => items,
			other => return Err(Error::Encoding(format!("expected nonce array, found {other}"))),
		};
		let (legacy, proof) = match items.len() {
			2 => (true, false),
			3 => (
				false,
				items[2]
					.as_bool()
					.ok_or_else(|| Error::Encoding("nonce proof flag is not a bool".into()))?,
			),
			n => return Err(Error::Encoding(format!("nonce array has {n} elements"))),
		};
		let kid = bytes_value(&items[0], "nonce kid")?;
		let rnd: [u8; RND_LEN] = bytes_value(&items[1], "nonce rnd")?
			.try_into()
			.map_err(|_| Error::Encoding(format!("nonce rnd must be {RND_LEN} bytes")))?;
		Ok(Nonce { kid, rnd, proof, legacy })
	}
}

fn bytes_value(value: &Value, what: &str) -> Result<Vec<u8>> {
	value
		.as_slice()
		.map(<[u8]>::to_vec)
		.ok_or_else(|| Error::Encoding(format!("{what} is not a byte string")))
}
