//! Attenuable bearer tokens. A [`Macaroon`] carries a chain of caveats
//! (restrictions) authenticated by a chained HMAC: any holder can append a
//! caveat without knowing any secret, and no holder can remove one. A
//! request is authorized iff every caveat approves it and the tail verifies
//! under the issuer's signing key. For an introduction to macaroons, see
//! [fly.io's excellent blog post](https://fly.io/blog/macaroons-escalated-quickly/);
//! this crate implements that token design, including its third-party caveat
//! protocol and `FlyV1` authorization-header bundles.
//!
//! Issuing and checking a token:
//!
//! ```
//! use florentine::{Caveat, Macaroon, SigningKey, TrustedThirdParties, ValidityWindow};
//!
//! let key = SigningKey::generate();
//! let mut token = Macaroon::new(b"key-id".to_vec(), "https://api.example.com", &key);
//!
//! // Anyone holding the token can narrow it further.
//! token.add([Caveat::ValidityWindow(ValidityWindow::starting_now(3600))])?;
//! let wire = token.encode();
//!
//! // The verifier recomputes the chain and evaluates the caveats.
//! let decoded = Macaroon::decode(&wire)?;
//! let caveats = decoded.verify(&key, &[], &TrustedThirdParties::new())?;
//! caveats.validate(&[&my_access])?;
//! ```
//!
//! Server-side request handling goes through [`bundle::Bundle`], which
//! parses an `Authorization` header into permission and discharge tokens,
//! verifies them in bulk, and evaluates an access against the survivors.

#[cfg(test)]
mod test;
mod util;

mod access;
mod codec;
mod crypto;
mod error;
mod macaroon;
mod nonce;

pub mod bundle;
pub mod caveat;
pub mod json;

pub use access::{Access, Action};
pub use bundle::{with_key, Bundle, Token, TokenState, VerificationCache, Verifier};
pub use caveat::{
	register, BindToParentToken, Caveat, CaveatSet, CaveatType, CustomCaveat, IfPresent,
	Registration, ThirdPartyCaveat, UnregisteredCaveat, ValidityWindow,
};
pub use crypto::{digest, seal, sign, unseal, EncryptionKey, SigningKey};
pub use error::{Error, Kind, Result};
pub use macaroon::{discharge_ticket, Macaroon, TrustedThirdParties, TOKEN_PREFIX};
pub use nonce::Nonce;
