use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::caveat::{
	BindToParentToken, Caveat, CaveatSet, ThirdPartyCaveat, WireTicket,
};
use crate::codec::{Reader, Writer};
use crate::crypto::{self, EncryptionKey, SigningKey, TAIL_LEN};
use crate::error::{Error, Result};
use crate::nonce::Nonce;
use crate::util;

/// Prefix on the transport string of a wire macaroon.
pub const TOKEN_PREFIX: &str = "fm2_";

/// Which third parties a verifier trusts to attest facts, keyed by 3P
/// location. A discharge counts as trusted when one of the listed encryption
/// keys opens its ticket.
pub type TrustedThirdParties = HashMap<String, Vec<EncryptionKey>>;

/// A bearer token whose caveat chain is authenticated by a chained HMAC.
///
/// Any holder may append caveats ([`Macaroon::add`]) without possessing the
/// signing key, but no holder can remove one: each caveat folds into the
/// tail as `tail = sign(tail, packed_caveat)`, so stripping a link breaks
/// every signature after it. For an introduction to the construction, see
/// [fly.io's excellent blog post](https://fly.io/blog/macaroons-escalated-quickly/).
#[derive(Clone, Debug, PartialEq)]
pub struct Macaroon {
	nonce: Nonce,
	location: String,
	caveats: CaveatSet,
	tail: Vec<u8>,
	/// A proof minted locally whose tail has not been finalized yet. Never
	/// true for decoded tokens.
	new_proof: bool,
}

impl Macaroon {
	/// Issue a new token under `key`. The `kid` opaquely names the signing
	/// key so verifiers can find it again; `location` names the issuing
	/// service.
	pub fn new(kid: impl Into<Vec<u8>>, location: impl Into<String>, key: &SigningKey) -> Self {
		Macaroon::mint(kid.into(), location.into(), key, false)
	}

	/// Issue a discharge proof. Its tail is finalized on first encode, after
	/// which no further caveats can be appended by anyone.
	pub(crate) fn new_proof(
		kid: impl Into<Vec<u8>>,
		location: impl Into<String>,
		key: &SigningKey,
	) -> Self {
		Macaroon::mint(kid.into(), location.into(), key, true)
	}

	fn mint(kid: Vec<u8>, location: String, key: &SigningKey, proof: bool) -> Self {
		let nonce = Nonce::new(kid, proof);
		let tail = crypto::sign(key.as_ref(), &nonce.encode()).to_vec();
		Macaroon { nonce, location, caveats: CaveatSet::new(), tail, new_proof: proof }
	}

	pub fn nonce(&self) -> &Nonce {
		&self.nonce
	}

	pub fn location(&self) -> &str {
		&self.location
	}

	pub fn caveats(&self) -> &CaveatSet {
		&self.caveats
	}

	/// The current chained-HMAC tag.
	pub fn tail(&self) -> &[u8] {
		&self.tail
	}

	pub fn is_proof(&self) -> bool {
		self.nonce.is_proof()
	}

	/// Stable human-readable identifier derived from the nonce.
	pub fn uuid(&self) -> Uuid {
		self.nonce.uuid()
	}

	/// The narrowest validity window on the token, if any.
	pub fn expiration(&self) -> Option<crate::caveat::ValidityWindow> {
		self.caveats.expiration()
	}

	fn tail_key(&self) -> Result<EncryptionKey> {
		let tail: [u8; TAIL_LEN] = self
			.tail
			.as_slice()
			.try_into()
			.map_err(|_| Error::Encoding(format!("tail must be {TAIL_LEN} bytes")))?;
		Ok(EncryptionKey::from_bytes(tail))
	}

	/// Attenuate: append caveats and fold each into the tail.
	///
	/// A caveat whose packed bytes already appear on the chain (or twice in
	/// this call) is dropped silently. Appending to a finalized proof fails
	/// `ProofClosed`; an attestation on a non-proof token fails
	/// `AttestationNotAllowed`; a second third-party caveat for a location
	/// already demanded fails `Duplicate3P`.
	pub fn add(&mut self, caveats: impl IntoIterator<Item = Caveat>) -> Result<()> {
		if self.nonce.is_proof() && !self.new_proof {
			return Err(Error::ProofClosed);
		}
		let mut seen: HashSet<Vec<u8>> =
			self.caveats.packed().iter().map(|p| p.tuple().to_vec()).collect();
		let mut locations: HashSet<String> =
			self.caveats.third_party().iter().map(|tp| tp.location.clone()).collect();

		for mut caveat in caveats {
			if caveat.is_attestation() && !self.nonce.is_proof() {
				return Err(Error::AttestationNotAllowed);
			}
			if let Caveat::ThirdParty(tp) = &mut caveat {
				// Seal the transient discharge key under the tail as it is
				// right now; the verifier recovers it at the same point in
				// the chain walk.
				if tp.verifier_key.is_empty() {
					if let Some(rn) = &tp.discharge_key {
						tp.verifier_key = crypto::seal(&self.tail_key()?, rn.as_ref())?;
					}
				}
			}
			let packed = caveat.pack()?;
			if !seen.insert(packed.tuple().to_vec()) {
				continue;
			}
			if let Caveat::ThirdParty(tp) = &caveat {
				if !locations.insert(tp.location.clone()) {
					return Err(Error::Duplicate3P(tp.location.clone()));
				}
			}
			self.tail = crypto::sign(&self.tail, packed.tuple()).to_vec();
			self.caveats.push_packed(caveat, packed);
		}
		Ok(())
	}

	/// Append a third-party caveat demanding a discharge from the party at
	/// `location`, whose encryption key is `ka`. The `caveats` are sealed
	/// into the ticket for the third party to check before discharging.
	pub fn add_third_party(
		&mut self,
		ka: &EncryptionKey,
		location: impl Into<String>,
		caveats: impl IntoIterator<Item = Caveat>,
	) -> Result<()> {
		let rn = SigningKey::generate();
		let ticket = WireTicket {
			discharge_key: rn.clone(),
			caveats: CaveatSet::from_caveats(caveats)?,
		}
		.seal(ka)?;
		self.add([Caveat::ThirdParty(ThirdPartyCaveat {
			location: location.into(),
			verifier_key: Vec::new(),
			ticket,
			discharge_key: Some(rn),
		})])
	}

	/// Pin this (discharge) token to a parent token, so it cannot be
	/// replayed against a different one. May be applied repeatedly; each
	/// binding further narrows the set of parents that accept it.
	pub fn bind(&mut self, parent_encoded: &[u8]) -> Result<()> {
		let parent = Macaroon::decode(parent_encoded)?;
		self.add([Caveat::BindToParent(BindToParentToken::from_parent_tail(&parent.tail))])
	}

	/// Tickets of every third-party caveat on the token, keyed by location.
	pub fn third_party_tickets(&self) -> HashMap<String, Vec<Vec<u8>>> {
		let mut out: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
		for tp in self.caveats.third_party() {
			out.entry(tp.location.clone()).or_default().push(tp.ticket.clone());
		}
		out
	}

	/// Serialize to the wire format. A locally-minted proof is finalized
	/// here, on first encode; afterwards the token rejects further appends.
	pub fn encode(&mut self) -> Vec<u8> {
		if self.new_proof {
			self.tail = crypto::finalize_proof_tail(&self.tail).to_vec();
			self.new_proof = false;
		}
		let mut w = Writer::new();
		w.array_len(4);
		self.nonce.encode_into(&mut w);
		w.str(&self.location);
		w.raw(&self.caveats.encode());
		w.bin(&self.tail);
		w.into_inner()
	}

	/// The transport string: `fm2_` + base64 of the wire encoding.
	pub fn to_token_string(&mut self) -> String {
		format!("{TOKEN_PREFIX}{}", util::to_base64(self.encode()))
	}

	/// Parse the wire format. No signature check is performed.
	pub fn decode(buf: &[u8]) -> Result<Macaroon> {
		Macaroon::decode_inner(buf).map_err(|e| match e {
			Error::Encoding(msg) => Error::UnrecognizedToken(msg),
			other => other,
		})
	}

	fn decode_inner(buf: &[u8]) -> Result<Macaroon> {
		let mut r = Reader::new(buf);
		if r.array_len()? != 4 {
			return Err(Error::Encoding("macaroon must be a 4-element array".into()));
		}
		let nonce = Nonce::from_value(r.value()?)?;
		let location = r.str()?;
		let caveats = CaveatSet::read_from(&mut r)?;
		let tail = r.bin()?;
		r.finish()?;
		Ok(Macaroon { nonce, location, caveats, tail, new_proof: false })
	}

	/// Verify the chained HMAC under `key`, resolving third-party caveats
	/// against `discharges` (encoded) and trusting attestations from the
	/// third parties in `trusted`.
	///
	/// On success, returns the validated caveats of this token and of every
	/// verified discharge; evaluate them against an access with
	/// [`CaveatSet::validate`].
	pub fn verify(
		&self,
		key: &SigningKey,
		discharges: &[Vec<u8>],
		trusted: &TrustedThirdParties,
	) -> Result<CaveatSet> {
		let decoded = discharges
			.iter()
			.map(|buf| Macaroon::decode(buf))
			.collect::<Result<Vec<_>>>()?;
		self.verify_decoded(key, &decoded, trusted)
	}

	/// [`Macaroon::verify`] over already-decoded discharge tokens.
	pub fn verify_decoded(
		&self,
		key: &SigningKey,
		discharges: &[Macaroon],
		trusted: &TrustedThirdParties,
	) -> Result<CaveatSet> {
		if self.new_proof {
			return Err(Error::ProofClosed);
		}
		// A discharge's kid is the sealed ticket of the 3P caveat it answers.
		let mut by_kid: HashMap<&[u8], Vec<&Macaroon>> = HashMap::new();
		for discharge in discharges {
			by_kid.entry(discharge.nonce.kid()).or_default().push(discharge);
		}
		self.verify_inner(key.as_ref(), &by_kid, &[], true, trusted)
	}

	fn verify_inner(
		&self,
		key: &[u8],
		discharges: &HashMap<&[u8], Vec<&Macaroon>>,
		parent_binding_ids: &[[u8; TAIL_LEN]],
		trust_attestations: bool,
		trusted: &TrustedThirdParties,
	) -> Result<CaveatSet> {
		struct PendingDischarge<'a> {
			location: String,
			candidates: &'a [&'a Macaroon],
			discharge_key: SigningKey,
		}

		let mut cur = crypto::sign(key, &self.nonce.encode());
		let mut binding_ids = vec![crypto::digest(&cur)];
		let mut returned = CaveatSet::new();
		let mut pending = Vec::new();

		for (caveat, packed) in self.caveats.entries() {
			match caveat {
				Caveat::ThirdParty(tp) => {
					let Some(candidates) = discharges.get(tp.ticket.as_slice()) else {
						return Err(Error::NoMatchingDischarge(tp.location.clone()));
					};
					let rn = crypto::unseal(&EncryptionKey::from_bytes(cur), &tp.verifier_key)?;
					pending.push(PendingDischarge {
						location: tp.location.clone(),
						candidates: candidates.as_slice(),
						discharge_key: SigningKey::try_from(rn.as_slice())?,
					});
				}
				Caveat::BindToParent(binding) => {
					if !parent_binding_ids.iter().any(|id| binding.matches(id)) {
						return Err(Error::BindingMismatch);
					}
				}
				other => {
					if other.is_attestation() {
						if !self.nonce.is_proof() {
							return Err(Error::AttestationNotAllowed);
						}
						if trust_attestations {
							returned.push_packed(other.clone(), packed.clone());
						}
					} else {
						returned.push_packed(other.clone(), packed.clone());
					}
				}
			}
			cur = crypto::sign(&cur, packed.tuple());
			binding_ids.push(crypto::digest(&cur));
		}

		// Discharges verify against the complete binding-id list, so a
		// discharge bound before a later attenuation still matches.
		let no_discharges = HashMap::new();
		let no_trusted = TrustedThirdParties::new();
		for p in pending {
			let mut errs = Vec::new();
			let mut verified = false;
			for discharge in p.candidates {
				// Minted by a trusted third party? Only then do its
				// attestations count.
				let discharge_trusted = trusted
					.get(&discharge.location)
					.map_or(false, |keys| {
						keys.iter().any(|ka| {
							WireTicket::unseal(ka, discharge.nonce.kid())
								.map_or(false, |wt| wt.discharge_key == p.discharge_key)
						})
					});
				match discharge.verify_inner(
					p.discharge_key.as_ref(),
					&no_discharges,
					&binding_ids,
					trust_attestations && discharge_trusted,
					&no_trusted,
				) {
					Ok(caveats) => {
						returned.extend_from(&caveats);
						verified = true;
						break;
					}
					Err(e) => errs.push(e),
				}
			}
			if !verified {
				return match Error::join(errs) {
					Err(e) => Err(e),
					Ok(()) => Err(Error::NoMatchingDischarge(p.location)),
				};
			}
		}

		if self.nonce.is_proof() {
			cur = crypto::finalize_proof_tail(&cur);
		}
		if !crypto::ct_eq(&cur, &self.tail) {
			return Err(Error::InvalidSignature);
		}
		Ok(returned)
	}
}

/// Third-party side of the 3P protocol: open a ticket received from a
/// bearer, returning the caveats the issuer asked this party to check and a
/// proof discharge token keyed by the recovered discharge key. The caller
/// inspects (and enforces) the caveats, optionally attenuates the discharge,
/// and hands it back to the bearer.
pub fn discharge_ticket(
	ka: &EncryptionKey,
	location: impl Into<String>,
	ticket: &[u8],
) -> Result<(CaveatSet, Macaroon)> {
	let wire = WireTicket::unseal(ka, ticket)?;
	let discharge = Macaroon::new_proof(ticket.to_vec(), location, &wire.discharge_key);
	Ok((wire.caveats, discharge))
}
