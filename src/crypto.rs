use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of an HMAC-SHA256 tail.
pub const TAIL_LEN: usize = 32;
/// Length of signing and encryption keys.
pub const KEY_LEN: usize = 32;
/// Length of the random prefix on a sealed blob.
pub const SEAL_NONCE_LEN: usize = 12;

/// Keyed hash applied to a proof tail on finalization. One-way: the
/// pre-image tail is required to extend the chain, but only the finalized
/// tail is ever transmitted.
const PROOF_FINALIZATION_KEY: &[u8] = b"proof-signature-finalization";

/// `HMAC-SHA256(key, msg)`. Every link of the caveat chain is one of these.
pub fn sign(key: &[u8], msg: &[u8]) -> [u8; TAIL_LEN] {
	<HmacSha256 as Mac>::new_from_slice(key)
		.expect("HMAC should be able to handle keys of any size")
		.chain_update(msg)
		.finalize()
		.into_bytes()
		.into()
}

/// `SHA-256(msg)`.
pub fn digest(msg: &[u8]) -> [u8; TAIL_LEN] {
	Sha256::digest(msg).into()
}

pub(crate) fn finalize_proof_tail(tail: &[u8]) -> [u8; TAIL_LEN] {
	sign(PROOF_FINALIZATION_KEY, tail)
}

/// Constant-time slice equality. Unequal lengths compare unequal.
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
	a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn random_bytes<const N: usize>() -> [u8; N] {
	let mut out = [0u8; N];
	rand::thread_rng().fill_bytes(&mut out);
	out
}

/// 32-byte HMAC key a token is issued and verified under.
///
/// `Debug` does not print key material.
#[derive(Clone)]
pub struct SigningKey([u8; KEY_LEN]);

impl SigningKey {
	/// Generate a fresh key from the system CSPRNG.
	pub fn generate() -> Self {
		SigningKey(random_bytes())
	}

	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		SigningKey(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.0
	}
}

impl AsRef<[u8]> for SigningKey {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

impl TryFrom<&[u8]> for SigningKey {
	type Error = Error;

	fn try_from(bytes: &[u8]) -> Result<Self> {
		let bytes: [u8; KEY_LEN] = bytes
			.try_into()
			.map_err(|_| Error::BadCaveat(format!("signing key must be {KEY_LEN} bytes")))?;
		Ok(SigningKey(bytes))
	}
}

impl PartialEq for SigningKey {
	fn eq(&self, other: &Self) -> bool {
		ct_eq(&self.0, &other.0)
	}
}

impl Eq for SigningKey {}

impl std::fmt::Debug for SigningKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("SigningKey(..)")
	}
}

/// 32-byte ChaCha20-Poly1305 key used to seal third-party tickets and
/// verifier keys.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
	/// Generate a fresh key from the system CSPRNG.
	pub fn generate() -> Self {
		EncryptionKey(random_bytes())
	}

	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		EncryptionKey(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.0
	}
}

impl From<[u8; KEY_LEN]> for EncryptionKey {
	fn from(bytes: [u8; KEY_LEN]) -> Self {
		EncryptionKey(bytes)
	}
}

impl PartialEq for EncryptionKey {
	fn eq(&self, other: &Self) -> bool {
		ct_eq(&self.0, &other.0)
	}
}

impl Eq for EncryptionKey {}

impl std::fmt::Debug for EncryptionKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("EncryptionKey(..)")
	}
}

/// Authenticated encryption: `nonce ‖ ChaCha20Poly1305(nonce, plaintext)`
/// with a fresh 12-byte random nonce per call. Two sealings of the same
/// plaintext produce different blobs.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
	let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
	let nonce: [u8; SEAL_NONCE_LEN] = random_bytes();
	let ciphertext = cipher
		.encrypt(Nonce::from_slice(&nonce), plaintext)
		.map_err(|_| Error::Encoding("sealing failed".into()))?;
	let mut out = Vec::with_capacity(SEAL_NONCE_LEN + ciphertext.len());
	out.extend_from_slice(&nonce);
	out.extend_from_slice(&ciphertext);
	Ok(out)
}

/// Open a blob produced by [`seal`]. Authentication failure and truncated
/// input both report `BadCaveat`: a ticket or verifier key that does not
/// open is indistinguishable from one we do not understand.
pub fn unseal(key: &EncryptionKey, blob: &[u8]) -> Result<Vec<u8>> {
	if blob.len() <= SEAL_NONCE_LEN {
		return Err(Error::BadCaveat("sealed blob is truncated".into()));
	}
	let (nonce, ciphertext) = blob.split_at(SEAL_NONCE_LEN);
	let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
	cipher
		.decrypt(Nonce::from_slice(nonce), ciphertext)
		.map_err(|_| Error::BadCaveat("sealed blob failed to open".into()))
}
