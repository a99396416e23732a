use super::{Caveat, CaveatType, ThirdPartyCaveat, ValidityWindow};
use crate::access::Access;
use crate::codec::{uint_from_raw, Reader, Writer};
use crate::error::{Error, Result};

/// One caveat in its canonical wire form: the msgpack 2-tuple
/// `[type, body]`. Decoded caveats keep the bytes they arrived in, so the
/// HMAC chain reproduces even when the original encoder made different
/// width choices than ours would.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Packed {
	bytes: Vec<u8>,
	body_start: usize,
}

impl Packed {
	pub fn from_parts(caveat_type: CaveatType, body: &[u8]) -> Packed {
		let mut type_raw = Writer::new();
		type_raw.uint(caveat_type.0);
		let type_raw = type_raw.into_inner();

		let mut w = Writer::new();
		w.array_len(2);
		w.raw(&type_raw);
		w.raw(body);
		Packed { bytes: w.into_inner(), body_start: 1 + type_raw.len() }
	}

	pub fn from_raw(type_raw: &[u8], body_raw: &[u8]) -> Packed {
		let mut w = Writer::new();
		w.array_len(2);
		w.raw(type_raw);
		w.raw(body_raw);
		Packed { bytes: w.into_inner(), body_start: 1 + type_raw.len() }
	}

	/// The full `[type, body]` tuple; this is what each HMAC link signs.
	pub fn tuple(&self) -> &[u8] {
		&self.bytes
	}

	pub fn type_raw(&self) -> &[u8] {
		&self.bytes[1..self.body_start]
	}

	pub fn body(&self) -> &[u8] {
		&self.bytes[self.body_start..]
	}
}

/// Ordered caveat sequence with deterministic serialization.
///
/// Serializes as a flat array of `2·N` alternating `type, body` entries.
/// Each caveat's packed tuple is kept alongside the decoded variant and is
/// the authoritative input to signing.
#[derive(Clone, Debug, Default)]
pub struct CaveatSet {
	caveats: Vec<Caveat>,
	packed: Vec<Packed>,
}

impl CaveatSet {
	pub fn new() -> Self {
		CaveatSet::default()
	}

	pub fn from_caveats(caveats: impl IntoIterator<Item = Caveat>) -> Result<Self> {
		let mut set = CaveatSet::new();
		for caveat in caveats {
			set.push(caveat)?;
		}
		Ok(set)
	}

	pub fn len(&self) -> usize {
		self.caveats.len()
	}

	pub fn is_empty(&self) -> bool {
		self.caveats.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Caveat> {
		self.caveats.iter()
	}

	pub(crate) fn packed(&self) -> &[Packed] {
		&self.packed
	}

	pub(crate) fn entries(&self) -> impl Iterator<Item = (&Caveat, &Packed)> {
		self.caveats.iter().zip(&self.packed)
	}

	/// Append a caveat, packing it canonically.
	pub fn push(&mut self, caveat: Caveat) -> Result<()> {
		let packed = caveat.pack()?;
		self.push_packed(caveat, packed);
		Ok(())
	}

	pub(crate) fn push_packed(&mut self, caveat: Caveat, packed: Packed) {
		self.caveats.push(caveat);
		self.packed.push(packed);
	}

	/// Append clones of every caveat in `other`, packed bytes preserved.
	pub(crate) fn extend_from(&mut self, other: &CaveatSet) {
		for (caveat, packed) in other.caveats.iter().zip(&other.packed) {
			self.push_packed(caveat.clone(), packed.clone());
		}
	}

	/// Serialize as the flat `2·N` alternating array.
	pub fn encode(&self) -> Vec<u8> {
		let mut w = Writer::new();
		let len = u32::try_from(self.packed.len() * 2).expect("caveat count fits in u32");
		w.array_len(len);
		for packed in &self.packed {
			w.raw(packed.type_raw());
			w.raw(packed.body());
		}
		w.into_inner()
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let mut r = Reader::new(buf);
		let set = CaveatSet::read_from(&mut r)?;
		r.finish()?;
		Ok(set)
	}

	pub(crate) fn read_from(r: &mut Reader<'_>) -> Result<Self> {
		let len = r.array_len()?;
		if len % 2 != 0 {
			return Err(Error::Encoding(format!("caveat array has odd length {len}")));
		}
		let mut set = CaveatSet::new();
		for _ in 0..len / 2 {
			let (type_raw, _) = r.raw_value()?;
			let caveat_type = CaveatType(uint_from_raw(type_raw)?);
			let (body_raw, _) = r.raw_value()?;
			let caveat = Caveat::decode(caveat_type, body_raw)?;
			set.push_packed(caveat, Packed::from_raw(type_raw, body_raw));
		}
		Ok(set)
	}

	/// Evaluate every non-attestation caveat against every access,
	/// accumulating all errors with no short-circuit. Success iff every
	/// access validates structurally and every caveat approves every access.
	pub fn validate(&self, accesses: &[&dyn Access]) -> Result<()> {
		let mut errs = Vec::new();
		for access in accesses {
			if let Err(e) = access.validate() {
				errs.push(e);
				continue;
			}
			for caveat in &self.caveats {
				if caveat.is_attestation() {
					continue;
				}
				if let Err(e) = caveat.prohibits(*access) {
					errs.push(e);
				}
			}
		}
		Error::join(errs)
	}

	/// Visit every caveat, recursing into wrapper caveats' nested sets.
	pub(crate) fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Caveat)) {
		for caveat in &self.caveats {
			f(caveat);
			if let Caveat::IfPresent(wrapper) = caveat {
				wrapper.ifs.walk(f);
			}
		}
	}

	/// All third-party caveats in the tree, wrapper-nested ones included.
	pub fn third_party(&self) -> Vec<&ThirdPartyCaveat> {
		let mut out = Vec::new();
		self.walk(&mut |caveat| {
			if let Caveat::ThirdParty(tp) = caveat {
				out.push(tp);
			}
		});
		out
	}

	/// All validity windows in the tree.
	pub fn validity_windows(&self) -> Vec<&ValidityWindow> {
		let mut out = Vec::new();
		self.walk(&mut |caveat| {
			if let Caveat::ValidityWindow(w) = caveat {
				out.push(w);
			}
		});
		out
	}

	/// The narrowest window implied by every validity caveat on the set, or
	/// `None` when the set never restricts time.
	pub fn expiration(&self) -> Option<ValidityWindow> {
		self.validity_windows().into_iter().fold(None, |acc, w| match acc {
			None => Some(*w),
			Some(prev) => Some(ValidityWindow::new(
				prev.not_before.max(w.not_before),
				prev.not_after.min(w.not_after),
			)),
		})
	}
}

impl PartialEq for CaveatSet {
	fn eq(&self, other: &Self) -> bool {
		self.packed == other.packed
	}
}

impl Eq for CaveatSet {}
