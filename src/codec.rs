//! Deterministic msgpack plumbing.
//!
//! Wire structs encode as positional arrays and integers take their minimal
//! encoding, so identical values always produce identical bytes. That matters
//! here more than usual: the bytes are fed straight into the HMAC chain.
//!
//! Reading goes through [`Reader`], which can hand back the *exact* byte
//! range a value occupied. Decoded caveats keep those bytes so that a token
//! produced by any encoder still re-signs correctly (see
//! [`CaveatSet`](crate::caveat::CaveatSet)). `rmpv` only reads whole values,
//! so the array-header dance needed for element-wise iteration is done by
//! hand.

use rmpv::Value;

use crate::error::{Error, Result};

fn truncated() -> Error {
	Error::Encoding("unexpected end of input".into())
}

/// Append-only msgpack writer with deterministic output.
pub(crate) struct Writer {
	buf: Vec<u8>,
}

impl Writer {
	pub fn new() -> Self {
		Writer { buf: Vec::new() }
	}

	pub fn into_inner(self) -> Vec<u8> {
		self.buf
	}

	pub fn array_len(&mut self, len: u32) {
		if len < 16 {
			self.buf.push(0x90 | len as u8);
		} else if len <= u16::MAX as u32 {
			self.buf.push(0xdc);
			self.buf.extend_from_slice(&(len as u16).to_be_bytes());
		} else {
			self.buf.push(0xdd);
			self.buf.extend_from_slice(&len.to_be_bytes());
		}
	}

	pub fn value(&mut self, value: &Value) {
		rmpv::encode::write_value(&mut self.buf, value)
			.expect("writing msgpack to a Vec cannot fail");
	}

	pub fn bin(&mut self, bytes: &[u8]) {
		self.value(&Value::Binary(bytes.to_vec()));
	}

	pub fn str(&mut self, s: &str) {
		self.value(&Value::String(s.into()));
	}

	pub fn uint(&mut self, n: u64) {
		self.value(&Value::from(n));
	}

	pub fn int(&mut self, n: i64) {
		self.value(&Value::from(n));
	}

	pub fn bool(&mut self, b: bool) {
		self.value(&Value::Boolean(b));
	}

	/// Splice pre-encoded msgpack in verbatim.
	pub fn raw(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}
}

/// Cursor over a msgpack buffer with raw-byte capture.
pub(crate) struct Reader<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	pub fn new(buf: &'a [u8]) -> Self {
		Reader { buf, pos: 0 }
	}

	fn take(&mut self, n: usize) -> Result<&'a [u8]> {
		let end = self.pos.checked_add(n).ok_or_else(truncated)?;
		if end > self.buf.len() {
			return Err(truncated());
		}
		let out = &self.buf[self.pos..end];
		self.pos = end;
		Ok(out)
	}

	/// Read one complete value.
	pub fn value(&mut self) -> Result<Value> {
		let mut rest = &self.buf[self.pos..];
		let before = rest.len();
		let value = rmpv::decode::read_value(&mut rest)
			.map_err(|e| Error::Encoding(e.to_string()))?;
		self.pos += before - rest.len();
		Ok(value)
	}

	/// Read one complete value and the exact bytes it occupied.
	pub fn raw_value(&mut self) -> Result<(&'a [u8], Value)> {
		let start = self.pos;
		let value = self.value()?;
		Ok((&self.buf[start..self.pos], value))
	}

	/// Read an array header alone, leaving the elements unread.
	pub fn array_len(&mut self) -> Result<u32> {
		let marker = self.take(1)?[0];
		match marker {
			0x90..=0x9f => Ok((marker & 0x0f) as u32),
			0xdc => {
				let len = self.take(2)?;
				Ok(u16::from_be_bytes([len[0], len[1]]) as u32)
			}
			0xdd => {
				let len = self.take(4)?;
				Ok(u32::from_be_bytes([len[0], len[1], len[2], len[3]]))
			}
			other => Err(Error::Encoding(format!(
				"expected array, found marker 0x{other:02x}"
			))),
		}
	}

	pub fn bin(&mut self) -> Result<Vec<u8>> {
		match self.value()? {
			Value::Binary(bytes) => Ok(bytes),
			// Tolerate str-encoded byte fields from foreign encoders.
			Value::String(s) => Ok(s.into_bytes()),
			other => Err(Error::Encoding(format!("expected bytes, found {other}"))),
		}
	}

	pub fn str(&mut self) -> Result<String> {
		match self.value()? {
			Value::String(s) => s
				.into_str()
				.ok_or_else(|| Error::Encoding("string is not valid UTF-8".into())),
			other => Err(Error::Encoding(format!("expected string, found {other}"))),
		}
	}

	pub fn uint(&mut self) -> Result<u64> {
		let value = self.value()?;
		value
			.as_u64()
			.ok_or_else(|| Error::Encoding(format!("expected unsigned integer, found {value}")))
	}

	pub fn int(&mut self) -> Result<i64> {
		let value = self.value()?;
		value
			.as_i64()
			.ok_or_else(|| Error::Encoding(format!("expected integer, found {value}")))
	}

	pub fn bool(&mut self) -> Result<bool> {
		let value = self.value()?;
		value
			.as_bool()
			.ok_or_else(|| Error::Encoding(format!("expected bool, found {value}")))
	}

	/// Error unless the whole buffer was consumed.
	pub fn finish(&self) -> Result<()> {
		if self.pos == self.buf.len() {
			Ok(())
		} else {
			Err(Error::Encoding(format!(
				"{} trailing bytes after value",
				self.buf.len() - self.pos
			)))
		}
	}
}

/// Parse the integer value out of a raw msgpack integer encoding, however
/// wide the original encoder chose to make it.
pub(crate) fn uint_from_raw(raw: &[u8]) -> Result<u64> {
	let mut reader = Reader::new(raw);
	let n = reader.uint()?;
	reader.finish()?;
	Ok(n)
}
