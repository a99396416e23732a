use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{Error, Result};

// Token strings and JSON byte fields both use the standard padded alphabet.

pub(crate) fn to_base64(data: impl AsRef<[u8]>) -> String {
	STANDARD.encode(data.as_ref())
}

pub(crate) fn from_base64(s: &str) -> Result<Vec<u8>> {
	STANDARD
		.decode(s)
		.map_err(|err| Error::Encoding(err.to_string()))
}
