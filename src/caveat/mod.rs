//! The caveat type system.
//!
//! A caveat is a predicate attached to a token; every caveat must approve a
//! request for the token to authorize it. The built-in variants live in a
//! closed sum ([`Caveat`]); caveat types defined downstream plug in through
//! the [`CustomCaveat`] object hook and the process-global [`registry`].

mod bind;
mod if_present;
pub(crate) mod registry;
mod set;
mod third_party;
mod unregistered;
mod window;

pub use bind::BindToParentToken;
pub use if_present::IfPresent;
pub use registry::{register, Registration};
pub use set::CaveatSet;
pub use third_party::ThirdPartyCaveat;
pub use unregistered::UnregisteredCaveat;
pub use window::ValidityWindow;

pub(crate) use set::Packed;
pub(crate) use third_party::WireTicket;

use crate::access::Access;
use crate::error::{Error, Result};

/// 64-bit caveat type identifier.
///
/// Ranges: `0..2^32` is reserved for this crate; `2^32..2^48` is for
/// globally-registered downstream types; `2^48..2^64-1` is for private
/// downstream types; `2^64-1` marks an unregistered caveat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaveatType(pub u64);

impl CaveatType {
	pub const RESERVED_END: CaveatType = CaveatType(1 << 32);
	pub const GLOBAL_END: CaveatType = CaveatType(1 << 48);
	pub const UNREGISTERED: CaveatType = CaveatType(u64::MAX);

	/// Reserved for built-in caveats.
	pub const fn is_reserved(self) -> bool {
		self.0 < Self::RESERVED_END.0
	}

	/// Open for globally-registered downstream caveats.
	pub const fn is_global(self) -> bool {
		self.0 >= Self::RESERVED_END.0 && self.0 < Self::GLOBAL_END.0
	}

	/// Open for privately-defined downstream caveats.
	pub const fn is_private(self) -> bool {
		self.0 >= Self::GLOBAL_END.0 && self.0 < Self::UNREGISTERED.0
	}
}

impl std::fmt::Display for CaveatType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

// Built-in type assignments. Stable wire constants; never renumber.
pub const TYPE_THIRD_PARTY: CaveatType = CaveatType(1);
pub const TYPE_VALIDITY_WINDOW: CaveatType = CaveatType(2);
pub const TYPE_BIND_TO_PARENT: CaveatType = CaveatType(3);
pub const TYPE_IF_PRESENT: CaveatType = CaveatType(4);

/// Hook for caveat types defined outside this crate.
///
/// Implement this for your own restriction, register a [`Registration`] for
/// its type id, and the caveat participates in encoding, verification, and
/// evaluation like the built-ins. The `prohibits` method should return
/// `Ok(())` if the caveat permits the access, `ResourceUnspecified` if the
/// access does not reference the resource it restricts, and any other error
/// to refuse:
///
/// ```
/// use florentine::{Access, CaveatType, CustomCaveat, Error};
///
/// #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
/// struct PathPrefix(String);
///
/// impl CustomCaveat for PathPrefix {
/// 	fn caveat_type(&self) -> CaveatType {
/// 		CaveatType(1 << 48)
/// 	}
///
/// 	fn name(&self) -> &str {
/// 		"path_prefix"
/// 	}
///
/// 	fn prohibits(&self, access: &dyn Access) -> Result<(), Error> {
/// 		let Some(req) = access.as_any().downcast_ref::<MyRequest>() else {
/// 			return Err(Error::ResourceUnspecified("no path in access".into()));
/// 		};
/// 		if req.path.starts_with(&self.0) {
/// 			Ok(())
/// 		} else {
/// 			Err(Error::Unauthorized(format!("path outside {}", self.0)))
/// 		}
/// 	}
/// 	// encode_body / body_json / clone_caveat elided
/// }
/// ```
pub trait CustomCaveat: std::fmt::Debug + Send + Sync {
	fn caveat_type(&self) -> CaveatType;

	/// Short name used in the JSON representation.
	fn name(&self) -> &str;

	fn prohibits(&self, access: &dyn Access) -> Result<()>;

	/// An attestation asserts a positive fact instead of restricting. It is
	/// only admissible inside finalized proof tokens.
	fn is_attestation(&self) -> bool {
		false
	}

	/// Deterministic msgpack encoding of the caveat body. Most
	/// implementations delegate to `rmp_serde::to_vec`.
	fn encode_body(&self) -> Result<Vec<u8>>;

	/// JSON encoding of the caveat body.
	fn body_json(&self) -> Result<serde_json::Value>;

	fn clone_caveat(&self) -> Box<dyn CustomCaveat>;
}

/// A single restriction (or attestation) on a token.
#[derive(Debug)]
pub enum Caveat {
	ThirdParty(ThirdPartyCaveat),
	ValidityWindow(ValidityWindow),
	BindToParent(BindToParentToken),
	IfPresent(IfPresent),
	Unregistered(UnregisteredCaveat),
	Custom(Box<dyn CustomCaveat>),
}

impl Clone for Caveat {
	fn clone(&self) -> Self {
		match self {
			Caveat::ThirdParty(c) => Caveat::ThirdParty(c.clone()),
			Caveat::ValidityWindow(c) => Caveat::ValidityWindow(*c),
			Caveat::BindToParent(c) => Caveat::BindToParent(c.clone()),
			Caveat::IfPresent(c) => Caveat::IfPresent(c.clone()),
			Caveat::Unregistered(c) => Caveat::Unregistered(c.clone()),
			Caveat::Custom(c) => Caveat::Custom(c.clone_caveat()),
		}
	}
}

impl Caveat {
	pub fn caveat_type(&self) -> CaveatType {
		match self {
			Caveat::ThirdParty(_) => TYPE_THIRD_PARTY,
			Caveat::ValidityWindow(_) => TYPE_VALIDITY_WINDOW,
			Caveat::BindToParent(_) => TYPE_BIND_TO_PARENT,
			Caveat::IfPresent(_) => TYPE_IF_PRESENT,
			Caveat::Unregistered(c) => c.caveat_type,
			Caveat::Custom(c) => c.caveat_type(),
		}
	}

	pub fn name(&self) -> String {
		match self {
			Caveat::ThirdParty(_) => third_party::NAME.into(),
			Caveat::ValidityWindow(_) => window::NAME.into(),
			Caveat::BindToParent(_) => bind::NAME.into(),
			Caveat::IfPresent(_) => if_present::NAME.into(),
			Caveat::Unregistered(c) => c.caveat_type.to_string(),
			Caveat::Custom(c) => c.name().into(),
		}
	}

	pub fn is_attestation(&self) -> bool {
		match self {
			Caveat::Custom(c) => c.is_attestation(),
			_ => false,
		}
	}

	/// Whether the caveat forbids the access. Third-party and
	/// bind-to-parent caveats are resolved by the signature machinery and
	/// refuse direct evaluation.
	pub fn prohibits(&self, access: &dyn Access) -> Result<()> {
		match self {
			Caveat::ThirdParty(c) => c.prohibits(access),
			Caveat::ValidityWindow(c) => c.prohibits(access),
			Caveat::BindToParent(c) => c.prohibits(access),
			Caveat::IfPresent(c) => c.prohibits(access),
			Caveat::Unregistered(c) => c.prohibits(access),
			Caveat::Custom(c) => c.prohibits(access),
		}
	}

	pub(crate) fn encode_body(&self) -> Result<Vec<u8>> {
		match self {
			Caveat::ThirdParty(c) => c.encode_body(),
			Caveat::ValidityWindow(c) => c.encode_body(),
			Caveat::BindToParent(c) => c.encode_body(),
			Caveat::IfPresent(c) => c.encode_body(),
			Caveat::Unregistered(c) => c.encode_body(),
			Caveat::Custom(c) => c.encode_body(),
		}
	}

	pub(crate) fn body_json(&self) -> Result<serde_json::Value> {
		match self {
			Caveat::ThirdParty(c) => c.body_json(),
			Caveat::ValidityWindow(c) => c.body_json(),
			Caveat::BindToParent(c) => c.body_json(),
			Caveat::IfPresent(c) => c.body_json(),
			Caveat::Unregistered(c) => c.body_json(),
			Caveat::Custom(c) => c.body_json(),
		}
	}

	/// Decode a caveat body by type. Unknown types become
	/// [`UnregisteredCaveat`], carrying the raw bytes so they still
	/// participate in signature verification.
	pub(crate) fn decode(caveat_type: CaveatType, body: &[u8]) -> Result<Caveat> {
		match caveat_type {
			TYPE_THIRD_PARTY => ThirdPartyCaveat::decode_body(body).map(Caveat::ThirdParty),
			TYPE_VALIDITY_WINDOW => ValidityWindow::decode_body(body).map(Caveat::ValidityWindow),
			TYPE_BIND_TO_PARENT => BindToParentToken::decode_body(body).map(Caveat::BindToParent),
			TYPE_IF_PRESENT => IfPresent::decode_body(body).map(Caveat::IfPresent),
			other => match registry::lookup_type(other) {
				Some(reg) => (reg.decode)(body),
				None => Ok(Caveat::Unregistered(UnregisteredCaveat::from_msgpack(
					other,
					body.to_vec(),
				))),
			},
		}
	}

	pub(crate) fn pack(&self) -> Result<Packed> {
		Ok(Packed::from_parts(self.caveat_type(), &self.encode_body()?))
	}
}

/// Whether every leaf of `err` is the soft `ResourceUnspecified` signal.
pub(crate) fn is_resource_unspecified(err: &Error) -> bool {
	match err {
		Error::Multiple(errs) => errs.iter().all(is_resource_unspecified),
		Error::ResourceUnspecified(_) => true,
		_ => false,
	}
}
