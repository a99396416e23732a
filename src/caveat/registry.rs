//! Process-global caveat-type registry.
//!
//! Maps numeric caveat types to decoders and names to types (with optional
//! JSON aliases). Built-ins are installed on first use; downstream types
//! should be registered during process initialization. Hot paths only ever
//! take the read lock.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::debug;

use super::{bind, if_present, third_party, window};
use super::{Caveat, CaveatType};
use crate::error::{Error, Result};

/// Everything the library needs to know about one caveat type.
pub struct Registration {
	pub caveat_type: CaveatType,
	/// Canonical short name, used in the JSON representation.
	pub name: &'static str,
	/// Extra names accepted when decoding JSON.
	pub aliases: &'static [&'static str],
	/// Decode a msgpack caveat body.
	pub decode: fn(&[u8]) -> Result<Caveat>,
	/// Decode a JSON caveat body.
	pub decode_json: fn(&serde_json::Value) -> Result<Caveat>,
}

struct Registry {
	by_type: HashMap<u64, Arc<Registration>>,
	by_name: HashMap<&'static str, u64>,
}

impl Registry {
	fn with_builtins() -> Self {
		let mut registry = Registry { by_type: HashMap::new(), by_name: HashMap::new() };
		for reg in [
			Registration {
				caveat_type: super::TYPE_THIRD_PARTY,
				name: third_party::NAME,
				aliases: &["3p"],
				decode: |b| third_party::ThirdPartyCaveat::decode_body(b).map(Caveat::ThirdParty),
				decode_json: |v| {
					third_party::ThirdPartyCaveat::from_json(v).map(Caveat::ThirdParty)
				},
			},
			Registration {
				caveat_type: super::TYPE_VALIDITY_WINDOW,
				name: window::NAME,
				aliases: &[],
				decode: |b| window::ValidityWindow::decode_body(b).map(Caveat::ValidityWindow),
				decode_json: |v| window::ValidityWindow::from_json(v).map(Caveat::ValidityWindow),
			},
			Registration {
				caveat_type: super::TYPE_BIND_TO_PARENT,
				name: bind::NAME,
				aliases: &[],
				decode: |b| bind::BindToParentToken::decode_body(b).map(Caveat::BindToParent),
				decode_json: |v| bind::BindToParentToken::from_json(v).map(Caveat::BindToParent),
			},
			Registration {
				caveat_type: super::TYPE_IF_PRESENT,
				name: if_present::NAME,
				aliases: &[],
				decode: |b| if_present::IfPresent::decode_body(b).map(Caveat::IfPresent),
				decode_json: |v| if_present::IfPresent::from_json(v).map(Caveat::IfPresent),
			},
		] {
			registry.insert(reg);
		}
		registry
	}

	fn insert(&mut self, reg: Registration) {
		let ty = reg.caveat_type.0;
		self.by_name.insert(reg.name, ty);
		for alias in reg.aliases {
			self.by_name.insert(alias, ty);
		}
		self.by_type.insert(ty, Arc::new(reg));
	}
}

fn global() -> &'static RwLock<Registry> {
	static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
	REGISTRY.get_or_init(|| RwLock::new(Registry::with_builtins()))
}

/// Register a downstream caveat type. The type id must be in the
/// globally-registered or private range, and the type, name, and aliases
/// must all be unused.
pub fn register(reg: Registration) -> Result<()> {
	if !reg.caveat_type.is_global() && !reg.caveat_type.is_private() {
		return Err(Error::Registry(format!(
			"caveat type {} is outside the registrable ranges",
			reg.caveat_type
		)));
	}
	let mut registry = global().write();
	if registry.by_type.contains_key(&reg.caveat_type.0) {
		return Err(Error::Registry(format!(
			"caveat type {} is already registered",
			reg.caveat_type
		)));
	}
	for name in std::iter::once(&reg.name).chain(reg.aliases) {
		if registry.by_name.contains_key(name) {
			return Err(Error::Registry(format!("caveat name {name:?} is already registered")));
		}
	}
	debug!(caveat_type = reg.caveat_type.0, name = reg.name, "registering caveat type");
	registry.insert(reg);
	Ok(())
}

pub(crate) fn lookup_type(caveat_type: CaveatType) -> Option<Arc<Registration>> {
	global().read().by_type.get(&caveat_type.0).cloned()
}

pub(crate) fn lookup_name(name: &str) -> Option<Arc<Registration>> {
	let registry = global().read();
	let ty = registry.by_name.get(name)?;
	registry.by_type.get(ty).cloned()
}
