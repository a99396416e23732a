use thiserror::Error;

/// Crate-wide result alias. Nearly every fallible operation in this library
/// fails with [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The failure taxonomy surfaced to callers.
///
/// The variants are deliberately flat: callers match on *kind* (see
/// [`Error::is`]) rather than destructuring context strings. Aggregates keep
/// their members intact so that kind-membership can still be tested against a
/// composite error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
	/// The bytes are not a token this library understands.
	#[error("unrecognized token: {0}")]
	UnrecognizedToken(String),
	/// A caveat (or the absence of a verified token) forbids the request.
	#[error("unauthorized: {0}")]
	Unauthorized(String),
	/// The access structure handed to validation is malformed.
	#[error("invalid access: {0}")]
	InvalidAccess(String),
	/// A caveat refused to evaluate, or the verifier does not understand it.
	#[error("bad caveat: {0}")]
	BadCaveat(String),
	/// The caveat restricts a resource this access does not reference. A
	/// soft signal: [`IfPresent`](crate::caveat::IfPresent) consumes it
	/// before it reaches the caller.
	#[error("caveat does not apply to this access: {0}")]
	ResourceUnspecified(String),
	/// The chained HMAC does not reproduce the token's tail.
	#[error("invalid signature")]
	InvalidSignature,
	/// A third-party caveat has no discharge token among the candidates.
	#[error("no matching discharge token for {0}")]
	NoMatchingDischarge(String),
	/// A discharge token is pinned to a different parent token.
	#[error("discharge token is not bound to this token")]
	BindingMismatch,
	/// The token is a finalized proof and cannot be extended or re-signed.
	#[error("proof tokens cannot be modified")]
	ProofClosed,
	/// Two third-party caveats on one token name the same location.
	#[error("duplicate third-party caveat for {0}")]
	Duplicate3P(String),
	/// An attestation appeared outside of a proof token.
	#[error("attestations are only permitted in proof tokens")]
	AttestationNotAllowed,
	/// Wire-format encode/decode failure.
	#[error("encoding: {0}")]
	Encoding(String),
	/// Caveat-type registration conflict.
	#[error("registry: {0}")]
	Registry(String),
	/// Several sibling failures reported together.
	#[error("{}", render(.0))]
	Multiple(Vec<Error>),
}

/// Kind of an [`Error`], for membership tests that ignore context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	UnrecognizedToken,
	Unauthorized,
	InvalidAccess,
	BadCaveat,
	ResourceUnspecified,
	InvalidSignature,
	NoMatchingDischarge,
	BindingMismatch,
	ProofClosed,
	Duplicate3P,
	AttestationNotAllowed,
	Encoding,
	Registry,
	Multiple,
}

impl Error {
	pub fn kind(&self) -> Kind {
		match self {
			Error::UnrecognizedToken(_) => Kind::UnrecognizedToken,
			Error::Unauthorized(_) => Kind::Unauthorized,
			Error::InvalidAccess(_) => Kind::InvalidAccess,
			Error::BadCaveat(_) => Kind::BadCaveat,
			Error::ResourceUnspecified(_) => Kind::ResourceUnspecified,
			Error::InvalidSignature => Kind::InvalidSignature,
			Error::NoMatchingDischarge(_) => Kind::NoMatchingDischarge,
			Error::BindingMismatch => Kind::BindingMismatch,
			Error::ProofClosed => Kind::ProofClosed,
			Error::Duplicate3P(_) => Kind::Duplicate3P,
			Error::AttestationNotAllowed => Kind::AttestationNotAllowed,
			Error::Encoding(_) => Kind::Encoding,
			Error::Registry(_) => Kind::Registry,
			Error::Multiple(_) => Kind::Multiple,
		}
	}

	/// Whether this error, or any member of an aggregate, is of `kind`.
	pub fn is(&self, kind: Kind) -> bool {
		match self {
			Error::Multiple(errs) => {
				kind == Kind::Multiple || errs.iter().any(|e| e.is(kind))
			}
			other => other.kind() == kind,
		}
	}

	/// Combine sibling errors. Zero errors is success, one error passes
	/// through unchanged, several become [`Error::Multiple`]. Nested
	/// aggregates are spliced in so membership tests see every leaf.
	pub fn join(errs: Vec<Error>) -> Result<()> {
		let mut flat = Vec::with_capacity(errs.len());
		for err in errs {
			match err {
				Error::Multiple(inner) => flat.extend(inner),
				other => flat.push(other),
			}
		}
		match flat.len() {
			0 => Ok(()),
			1 => Err(flat.into_iter().next().expect("len checked")),
			_ => Err(Error::Multiple(flat)),
		}
	}
}

fn render(errs: &[Error]) -> String {
	errs.iter()
		.map(|e| e.to_string())
		.collect::<Vec<_>>()
		.join("; ")
}
