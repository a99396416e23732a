use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::access::Access;
use crate::error::{Error, Result};

pub(crate) const NAME: &str = "validity_window";

/// Restricts the token to a time window, in seconds since the Unix epoch.
/// Both bounds are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
	pub not_before: i64,
	pub not_after: i64,
}

impl ValidityWindow {
	pub fn new(not_before: i64, not_after: i64) -> Self {
		ValidityWindow { not_before, not_after }
	}

	/// A window opening now and closing `ttl_seconds` from now.
	pub fn starting_now(ttl_seconds: i64) -> Self {
		let now = unix_seconds(SystemTime::now());
		ValidityWindow { not_before: now, not_after: now.saturating_add(ttl_seconds) }
	}

	pub fn contains(&self, t: SystemTime) -> bool {
		let secs = unix_seconds(t);
		secs >= self.not_before && secs <= self.not_after
	}

	pub(crate) fn prohibits(&self, access: &dyn Access) -> Result<()> {
		let now = unix_seconds(access.now());
		if now < self.not_before {
			return Err(Error::Unauthorized(format!(
				"token is not valid until {}",
				self.not_before
			)));
		}
		if now > self.not_after {
			return Err(Error::Unauthorized(format!("token expired at {}", self.not_after)));
		}
		Ok(())
	}

	pub(crate) fn encode_body(&self) -> Result<Vec<u8>> {
		rmp_serde::to_vec(self).map_err(|e| Error::Encoding(e.to_string()))
	}

	pub(crate) fn decode_body(body: &[u8]) -> Result<Self> {
		rmp_serde::from_slice(body).map_err(|e| Error::Encoding(e.to_string()))
	}

	pub(crate) fn body_json(&self) -> Result<serde_json::Value> {
		serde_json::to_value(self).map_err(|e| Error::Encoding(e.to_string()))
	}

	pub(crate) fn from_json(value: &serde_json::Value) -> Result<Self> {
		serde_json::from_value(value.clone()).map_err(|e| Error::Encoding(e.to_string()))
	}
}

pub(crate) fn unix_seconds(t: SystemTime) -> i64 {
	match t.duration_since(UNIX_EPOCH) {
		Ok(d) => d.as_secs() as i64,
		Err(e) => -(e.duration().as_secs() as i64),
	}
}
