use std::any::Any;
use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What a token is being checked against.
///
/// The library never inspects an access beyond this trait; individual caveat
/// types interrogate it (via [`Access::action`] or a downcast through
/// [`Access::as_any`]) and answer `ResourceUnspecified` when it does not
/// reference the resource they restrict.
pub trait Access {
	/// Structural sanity check, run once per access before any caveat is
	/// evaluated. Fail with `InvalidAccess`.
	fn validate(&self) -> Result<()>;

	/// The instant caveats should treat as "now".
	fn now(&self) -> SystemTime {
		SystemTime::now()
	}

	/// The permission bits this access exercises, if it speaks that
	/// vocabulary. Consumed by the `IfPresent` else-mask.
	fn action(&self) -> Option<Action> {
		None
	}

	/// Downcast hook for caveat types defined outside this crate.
	fn as_any(&self) -> &dyn Any;
}

/// Permission bit-set: the `else` payload of `IfPresent` and the vocabulary
/// of [`Access::action`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(u32);

impl Action {
	pub const NONE: Action = Action(0);
	pub const READ: Action = Action(1 << 0);
	pub const WRITE: Action = Action(1 << 1);
	pub const CREATE: Action = Action(1 << 2);
	pub const DELETE: Action = Action(1 << 3);
	pub const CONTROL: Action = Action(1 << 4);
	pub const ALL: Action =
		Action(Self::READ.0 | Self::WRITE.0 | Self::CREATE.0 | Self::DELETE.0 | Self::CONTROL.0);

	pub const fn bits(self) -> u32 {
		self.0
	}

	pub const fn from_bits(bits: u32) -> Action {
		Action(bits)
	}

	/// Every bit of `self` is also set in `other`.
	pub const fn is_subset_of(self, other: Action) -> bool {
		self.0 & !other.0 == 0
	}

	pub const fn contains(self, other: Action) -> bool {
		other.is_subset_of(self)
	}

	pub const fn is_empty(self) -> bool {
		self.0 == 0
	}
}

impl BitOr for Action {
	type Output = Action;

	fn bitor(self, rhs: Action) -> Action {
		Action(self.0 | rhs.0)
	}
}

impl BitAnd for Action {
	type Output = Action;

	fn bitand(self, rhs: Action) -> Action {
		Action(self.0 & rhs.0)
	}
}

impl fmt::Display for Action {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_empty() {
			return f.write_str("-");
		}
		for (bit, c) in [
			(Action::READ, 'r'),
			(Action::WRITE, 'w'),
			(Action::CREATE, 'c'),
			(Action::DELETE, 'd'),
			(Action::CONTROL, 'C'),
		] {
			if self.contains(bit) {
				write!(f, "{c}")?;
			}
		}
		Ok(())
	}
}
