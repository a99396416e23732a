//! A thread-safe collection of tokens parsed from an `Authorization` header:
//! permission macaroons, their discharges, and whatever else the client sent
//! along, preserved verbatim.

mod filter;
mod verify;

pub use filter::{And, DefaultFilter, Filter, HasLocation, Not, Predicate};
pub use verify::{
	with_key, KeyResolver, KeyResolverVerifier, VerificationCache, Verifier, VerifyRequest,
	WithKey,
};

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::access::Access;
use crate::caveat::{Caveat, CaveatSet, WireTicket};
use crate::crypto::EncryptionKey;
use crate::error::{Error, Result};
use crate::macaroon::{Macaroon, TOKEN_PREFIX};
use crate::util;

/// Header scheme for macaroon bundles. `Bearer` is accepted as well.
pub const HEADER_SCHEME: &str = "FlyV1";

/// Legacy transport prefixes; same wire format underneath.
pub const PERMISSION_PREFIX_LEGACY: &str = "fm1r_";
pub const DISCHARGE_PREFIX_LEGACY: &str = "fm1a_";

/// One entry from the `Authorization` header.
#[derive(Clone, Debug)]
pub struct Token {
	raw: String,
	macaroon: Option<Macaroon>,
	state: TokenState,
}

/// Where a token is in its verification lifecycle.
#[derive(Clone, Debug)]
pub enum TokenState {
	/// None of the recognized prefixes; preserved verbatim.
	NonMacaroon,
	/// Looked like a macaroon but failed to decode.
	Malformed(Error),
	/// Well-formed, not yet verified.
	Unverified,
	/// Signature verified; carries the validated caveats.
	Verified(CaveatSet),
	/// Signature or rule check failed.
	Failed(Error),
}

impl Token {
	fn parse(s: &str) -> Token {
		let raw = s.to_string();
		for prefix in [TOKEN_PREFIX, PERMISSION_PREFIX_LEGACY, DISCHARGE_PREFIX_LEGACY] {
			let Some(b64) = s.strip_prefix(prefix) else { continue };
			return match util::from_base64(b64).and_then(|buf| Macaroon::decode(&buf)) {
				Ok(macaroon) => {
					Token { raw, macaroon: Some(macaroon), state: TokenState::Unverified }
				}
				Err(err) => {
					warn!(%err, "failed to decode macaroon token");
					Token { raw, macaroon: None, state: TokenState::Malformed(err) }
				}
			};
		}
		Token { raw, macaroon: None, state: TokenState::NonMacaroon }
	}

	/// The transport string, exactly as it appeared in the header.
	pub fn raw(&self) -> &str {
		&self.raw
	}

	pub fn state(&self) -> &TokenState {
		&self.state
	}

	pub fn macaroon(&self) -> Option<&Macaroon> {
		self.macaroon.as_ref()
	}

	pub fn is_macaroon(&self) -> bool {
		self.macaroon.is_some()
	}

	pub fn location(&self) -> Option<&str> {
		self.macaroon.as_ref().map(Macaroon::location)
	}

	pub fn is_verified(&self) -> bool {
		matches!(self.state, TokenState::Verified(_))
	}

	pub fn verified_caveats(&self) -> Option<&CaveatSet> {
		match &self.state {
			TokenState::Verified(caveats) => Some(caveats),
			_ => None,
		}
	}
}

/// Parsed `Authorization` header contents.
///
/// Readers and writers share one readers-writer lock over the token vector;
/// insertion order is preserved across every operation. [`Bundle::select`]
/// returns a filtered view over the same storage; views are not extensible.
pub struct Bundle {
	location: String,
	tokens: Arc<RwLock<Vec<Token>>>,
	filter: Option<Arc<dyn Filter>>,
	extensible: bool,
}

impl Bundle {
	/// Parse a header, keeping non-macaroons, permission macaroons for
	/// `permission_location`, and discharges associated with one of them
	/// (the [`DefaultFilter`]). Parsing never fails; tokens that looked like
	/// macaroons but did not decode are retained as
	/// [`TokenState::Malformed`] and reported by [`Bundle::parse_errors`].
	pub fn parse(permission_location: impl Into<String>, header: &str) -> Bundle {
		let location = permission_location.into();
		let filter = DefaultFilter::new(location.clone());
		Bundle::parse_with_filter(location, header, &filter)
	}

	/// Parse a header, retaining the tokens `filter` keeps.
	pub fn parse_with_filter(
		permission_location: impl Into<String>,
		header: &str,
		filter: &dyn Filter,
	) -> Bundle {
		let mut tokens = parse_header(header);
		let mask = filter.keep(&tokens);
		let mut kept = mask.iter();
		tokens.retain(|_| *kept.next().expect("mask covers every token"));
		debug!(tokens = tokens.len(), "parsed authorization header");
		Bundle {
			location: permission_location.into(),
			tokens: Arc::new(RwLock::new(tokens)),
			filter: None,
			extensible: true,
		}
	}

	/// The permission location this bundle authorizes against.
	pub fn location(&self) -> &str {
		&self.location
	}

	/// Aggregate of the per-token parse failures, if any.
	pub fn parse_errors(&self) -> Option<Error> {
		let tokens = self.tokens.read();
		let errs: Vec<Error> = self
			.kept(&tokens)
			.filter_map(|t| match &t.state {
				TokenState::Malformed(e) => Some(e.clone()),
				_ => None,
			})
			.collect();
		Error::join(errs).err()
	}

	fn mask(&self, tokens: &[Token]) -> Vec<bool> {
		match &self.filter {
			None => vec![true; tokens.len()],
			Some(filter) => filter.keep(tokens),
		}
	}

	fn kept<'a>(&self, tokens: &'a [Token]) -> impl Iterator<Item = &'a Token> {
		let mask = self.mask(tokens);
		tokens.iter().zip(mask).filter_map(|(t, keep)| keep.then_some(t))
	}

	/// A view over the same storage restricted to the tokens `filter`
	/// keeps. The view shares the lock and sees (and makes) state changes,
	/// but rejects operations that would add tokens.
	pub fn select(&self, filter: impl Filter + 'static) -> Bundle {
		let composed: Arc<dyn Filter> = match &self.filter {
			None => Arc::new(filter),
			Some(existing) => Arc::new(And::new(Arc::clone(existing), Arc::new(filter))),
		};
		Bundle {
			location: self.location.clone(),
			tokens: Arc::clone(&self.tokens),
			filter: Some(composed),
			extensible: false,
		}
	}

	/// Number of tokens visible through this bundle.
	pub fn len(&self) -> usize {
		let tokens = self.tokens.read();
		self.kept(&tokens).count()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Comma-joined transport strings of the visible tokens.
	pub fn string(&self) -> String {
		let tokens = self.tokens.read();
		self.kept(&tokens).map(Token::raw).collect::<Vec<_>>().join(",")
	}

	/// The full `Authorization` header value.
	pub fn header(&self) -> String {
		format!("{HEADER_SCHEME} {}", self.string())
	}

	/// Append more tokens (a header or bare comma-joined list). Fails on a
	/// non-extensible view.
	pub fn add_tokens(&self, header: &str) -> Result<()> {
		self.check_extensible()?;
		let mut new_tokens = parse_header(header);
		self.tokens.write().append(&mut new_tokens);
		Ok(())
	}

	fn check_extensible(&self) -> Result<()> {
		if self.extensible {
			Ok(())
		} else {
			Err(Error::Unauthorized("bundle view is not extensible".into()))
		}
	}

	/// Tickets of third-party caveats on visible permission tokens that no
	/// visible discharge answers, keyed by third-party location.
	pub fn undischarged_third_party_tickets(&self) -> std::collections::HashMap<String, Vec<Vec<u8>>> {
		let tokens = self.tokens.read();
		self.undischarged_locked(&tokens)
	}

	fn undischarged_locked(
		&self,
		tokens: &[Token],
	) -> std::collections::HashMap<String, Vec<Vec<u8>>> {
		let kids: HashSet<Vec<u8>> = self
			.kept(tokens)
			.filter_map(Token::macaroon)
			.map(|m| m.nonce().kid().to_vec())
			.collect();
		let mut out: std::collections::HashMap<String, Vec<Vec<u8>>> =
			std::collections::HashMap::new();
		for token in self.kept(tokens) {
			let Some(macaroon) = token.macaroon() else { continue };
			if macaroon.location() != self.location {
				continue;
			}
			for tp in macaroon.caveats().third_party() {
				if !kids.contains(&tp.ticket) {
					out.entry(tp.location.clone()).or_default().push(tp.ticket.clone());
				}
			}
		}
		out
	}

	/// Discharge every unanswered ticket for `tp_location` using that
	/// party's encryption key.
	///
	/// For each ticket, the sealed caveats are handed to `approve`; the
	/// callback checks them and returns any restrictions to place on the
	/// discharge (a `ValidityWindow`, typically). All-or-nothing: if any
	/// ticket fails to unseal or any callback refuses, no discharges are
	/// appended. Returns the number of discharges added.
	pub fn discharge<F>(
		&self,
		tp_location: &str,
		key: &EncryptionKey,
		mut approve: F,
	) -> Result<usize>
	where
		F: FnMut(&CaveatSet) -> Result<Vec<Caveat>>,
	{
		self.check_extensible()?;
		let mut tokens = self.tokens.write();
		let tickets = self
			.undischarged_locked(&tokens)
			.remove(tp_location)
			.unwrap_or_default();

		let mut minted = Vec::with_capacity(tickets.len());
		for ticket in tickets {
			let wire = WireTicket::unseal(key, &ticket)?;
			let extra = approve(&wire.caveats)?;
			let mut discharge =
				Macaroon::new_proof(ticket, tp_location, &wire.discharge_key);
			discharge.add(extra)?;
			let raw = discharge.to_token_string();
			minted.push(Token {
				raw,
				macaroon: Some(discharge),
				state: TokenState::Unverified,
			});
		}
		debug!(count = minted.len(), location = tp_location, "discharged third-party tickets");
		let count = minted.len();
		tokens.append(&mut minted);
		Ok(count)
	}

	/// Append `caveats` to every visible permission macaroon.
	///
	/// Two-phase: every target is cloned, attenuated, and re-encoded first;
	/// the results are committed only if all of them succeeded. Tokens whose
	/// verified caveat sets are already attached get the net-new caveats
	/// appended there too, so the attached sets stay accurate.
	pub fn attenuate(&self, caveats: Vec<Caveat>) -> Result<()> {
		self.check_extensible()?;
		let mut tokens = self.tokens.write();
		let mask = self.mask(&tokens);

		struct Staged {
			index: usize,
			macaroon: Macaroon,
			raw: String,
			appended_from: usize,
		}

		let mut staged = Vec::new();
		for (index, token) in tokens.iter().enumerate() {
			if !mask[index] {
				continue;
			}
			let Some(macaroon) = token.macaroon() else { continue };
			if macaroon.location() != self.location {
				continue;
			}
			let mut updated = macaroon.clone();
			let before = updated.caveats().len();
			updated.add(caveats.clone())?;
			let raw = updated.to_token_string();
			staged.push(Staged { index, macaroon: updated, raw, appended_from: before });
		}

		for Staged { index, macaroon, raw, appended_from } in staged {
			let token = &mut tokens[index];
			if let TokenState::Verified(verified) = &mut token.state {
				for (caveat, packed) in macaroon.caveats().entries().skip(appended_from) {
					if matches!(caveat, Caveat::ThirdParty(_) | Caveat::BindToParent(_)) {
						continue;
					}
					verified.push_packed(caveat.clone(), packed.clone());
				}
			}
			token.macaroon = Some(macaroon);
			token.raw = raw;
		}
		Ok(())
	}

	/// Verify every visible permission token with its candidate discharges,
	/// replacing each token's state with the outcome. Succeeds iff at least
	/// one permission token verified.
	pub fn verify(&self, verifier: &dyn Verifier) -> Result<()> {
		let mut tokens = self.tokens.write();
		let mask = self.mask(&tokens);

		let mut indices = Vec::new();
		let mut requests = Vec::new();
		for (index, token) in tokens.iter().enumerate() {
			if !mask[index] {
				continue;
			}
			let Some(permission) = token.macaroon() else { continue };
			if permission.location() != self.location {
				continue;
			}
			let tickets: HashSet<Vec<u8>> = permission
				.caveats()
				.third_party()
				.iter()
				.map(|tp| tp.ticket.clone())
				.collect();
			let discharges: Vec<Macaroon> = tokens
				.iter()
				.zip(&mask)
				.filter(|(_, keep)| **keep)
				.filter_map(|(t, _)| t.macaroon())
				.filter(|m| tickets.contains(m.nonce().kid()))
				.cloned()
				.collect();
			indices.push(index);
			requests.push(VerifyRequest { permission: permission.clone(), discharges });
		}

		if requests.is_empty() {
			return Err(Error::Unauthorized("no permission tokens to verify".into()));
		}

		let results = verifier.verify(requests);
		debug_assert_eq!(results.len(), indices.len());

		let mut verified = 0usize;
		let mut errs = Vec::new();
		for (index, result) in indices.into_iter().zip(results) {
			match result {
				Ok(caveats) => {
					verified += 1;
					tokens[index].state = TokenState::Verified(caveats);
				}
				Err(err) => {
					warn!(%err, "token failed verification");
					errs.push(err.clone());
					tokens[index].state = TokenState::Failed(err);
				}
			}
		}
		if verified > 0 {
			Ok(())
		} else {
			Error::join(errs)
		}
	}

	/// Evaluate the visible verified tokens against `accesses`. Succeeds iff
	/// any one verified token's caveats approve every access.
	pub fn validate(&self, accesses: &[&dyn Access]) -> Result<()> {
		let tokens = self.tokens.read();
		let mut errs = Vec::new();
		let mut saw_verified = false;
		for token in self.kept(&tokens) {
			let Some(caveats) = token.verified_caveats() else { continue };
			saw_verified = true;
			match caveats.validate(accesses) {
				Ok(()) => return Ok(()),
				Err(e) => errs.push(e),
			}
		}
		if !saw_verified {
			return Err(Error::Unauthorized("no verified tokens".into()));
		}
		Error::join(errs)
	}

	pub fn any_verified(&self) -> bool {
		let tokens = self.tokens.read();
		let result = self.kept(&tokens).any(Token::is_verified);
		result
	}

	/// Verified caveat sets of the visible tokens.
	pub fn verified_caveats(&self) -> Vec<CaveatSet> {
		let tokens = self.tokens.read();
		self.kept(&tokens)
			.filter_map(Token::verified_caveats)
			.cloned()
			.collect()
	}
}

impl Clone for Bundle {
	/// Deep copy by re-parsing the header; verification state is not
	/// carried over.
	fn clone(&self) -> Self {
		Bundle::parse_with_filter(self.location.clone(), &self.header(), &KeepAll)
	}
}

struct KeepAll;

impl Filter for KeepAll {
	fn keep(&self, tokens: &[Token]) -> Vec<bool> {
		vec![true; tokens.len()]
	}
}

impl std::fmt::Debug for Bundle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Bundle")
			.field("location", &self.location)
			.field("tokens", &self.tokens.read().len())
			.field("extensible", &self.extensible)
			.finish()
	}
}

fn parse_header(header: &str) -> Vec<Token> {
	let body = strip_scheme(header);
	body.split(',')
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.map(Token::parse)
		.collect()
}

fn strip_scheme(header: &str) -> &str {
	let trimmed = header.trim();
	if let Some((scheme, rest)) = trimmed.split_once(' ') {
		if scheme.eq_ignore_ascii_case(HEADER_SCHEME) || scheme.eq_ignore_ascii_case("Bearer") {
			return rest;
		}
	}
	trimmed
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::caveat::ValidityWindow;
	use crate::crypto::SigningKey;
	use crate::error::Kind;

	fn window(a: i64, b: i64) -> Caveat {
		Caveat::ValidityWindow(ValidityWindow::new(a, b))
	}

	fn permission(kid: &[u8], key: &SigningKey) -> Macaroon {
		Macaroon::new(kid.to_vec(), "http://api", key)
	}

	#[test]
	fn parse_classifies_tokens() {
		let key = SigningKey::generate();
		let mut m = permission(b"kid", &key);
		let header = format!("FlyV1 {},opaque-api-key,fm2_AAA!", m.to_token_string());
		let bundle = Bundle::parse("http://api", &header);

		assert_eq!(bundle.len(), 3);
		let tokens = bundle.tokens.read();
		assert!(matches!(tokens[0].state, TokenState::Unverified));
		assert!(matches!(tokens[1].state, TokenState::NonMacaroon));
		assert!(matches!(tokens[2].state, TokenState::Malformed(_)));
		drop(tokens);
		assert!(bundle.parse_errors().is_some());
	}

	#[test]
	fn bearer_scheme_and_whitespace_are_accepted() {
		let key = SigningKey::generate();
		let mut m = permission(b"kid", &key);
		let header = format!("bearer  {} , opaque ", m.to_token_string());
		let bundle = Bundle::parse("http://api", &header);
		assert_eq!(bundle.len(), 2);
	}

	#[test]
	fn default_filter_drops_unassociated_macaroons() {
		let key = SigningKey::generate();
		let mut mine = permission(b"kid", &key);
		let mut other = Macaroon::new(b"kid2".to_vec(), "http://elsewhere", &key);
		let header = format!("FlyV1 {},{}", mine.to_token_string(), other.to_token_string());
		let bundle = Bundle::parse("http://api", &header);
		assert_eq!(bundle.len(), 1);
	}

	#[test]
	fn default_filter_keeps_associated_discharges() {
		let key = SigningKey::generate();
		let ka = EncryptionKey::generate();
		let mut m = permission(b"kid", &key);
		m.add_third_party(&ka, "http://auth", []).unwrap();
		let ticket = m.third_party_tickets().remove("http://auth").unwrap().remove(0);
		let (_, mut discharge) =
			crate::macaroon::discharge_ticket(&ka, "http://auth", &ticket).unwrap();
		let header = format!("FlyV1 {},{}", m.to_token_string(), discharge.to_token_string());
		let bundle = Bundle::parse("http://api", &header);
		assert_eq!(bundle.len(), 2);
	}

	#[test]
	fn header_round_trips_through_clone() {
		let key = SigningKey::generate();
		let mut m = permission(b"kid", &key);
		let header = format!("FlyV1 {},opaque-key", m.to_token_string());
		let bundle = Bundle::parse("http://api", &header);
		let cloned = bundle.clone();
		assert_eq!(cloned.header(), bundle.header());
		assert_eq!(cloned.len(), bundle.len());
	}

	#[test]
	fn select_views_are_not_extensible() {
		let bundle = Bundle::parse("http://api", "FlyV1 opaque");
		let view = bundle.select(HasLocation("http://api".into()));
		assert!(view
			.discharge("http://auth", &EncryptionKey::generate(), |_| Ok(vec![]))
			.unwrap_err()
			.is(Kind::Unauthorized));
		assert!(view.add_tokens("more").unwrap_err().is(Kind::Unauthorized));
		assert!(view.attenuate(vec![]).unwrap_err().is(Kind::Unauthorized));
	}

	#[test]
	fn attenuate_appends_to_permission_tokens() {
		let key = SigningKey::generate();
		let mut m = permission(b"kid", &key);
		let bundle = Bundle::parse("http://api", &format!("FlyV1 {}", m.to_token_string()));
		bundle.attenuate(vec![window(0, 100)]).unwrap();

		let tokens = bundle.tokens.read();
		let updated = tokens[0].macaroon().unwrap();
		assert_eq!(updated.caveats().len(), 1);
		assert_eq!(tokens[0].raw(), &updated.clone().to_token_string());
	}

	#[test]
	fn attenuate_is_all_or_nothing() {
		let key = SigningKey::generate();
		let mut m = permission(b"kid", &key);
		let bundle = Bundle::parse("http://api", &format!("FlyV1 {}", m.to_token_string()));

		// A JSON-only unregistered caveat cannot be packed to msgpack, so
		// attenuation must fail without committing anything.
		let unpackable = Caveat::Unregistered(crate::caveat::UnregisteredCaveat {
			caveat_type: crate::caveat::CaveatType(999_999),
			raw_msgpack: None,
			raw_json: Some(serde_json::json!({})),
		});
		assert!(bundle.attenuate(vec![window(0, 10), unpackable]).is_err());
		let tokens = bundle.tokens.read();
		assert_eq!(tokens[0].macaroon().unwrap().caveats().len(), 0);
	}

	#[test]
	fn attenuate_updates_attached_verified_sets() {
		let key = SigningKey::generate();
		let mut m = permission(b"kid", &key);
		let bundle = Bundle::parse("http://api", &format!("FlyV1 {}", m.to_token_string()));
		bundle.verify(&with_key(b"kid".to_vec(), key, Default::default())).unwrap();
		bundle.attenuate(vec![window(0, 100)]).unwrap();

		let sets = bundle.verified_caveats();
		assert_eq!(sets.len(), 1);
		assert_eq!(sets[0].len(), 1);
	}

	#[test]
	fn validate_requires_a_verified_token() {
		let key = SigningKey::generate();
		let mut m = permission(b"kid", &key);
		let bundle = Bundle::parse("http://api", &format!("FlyV1 {}", m.to_token_string()));
		let err = bundle
			.validate(&[&crate::access::testing::TestAccess::at(0)])
			.unwrap_err();
		assert!(err.is(Kind::Unauthorized));
	}

	#[test]
	fn verify_with_no_permission_tokens_fails() {
		let bundle = Bundle::parse("http://api", "FlyV1 opaque");
		let err = bundle
			.verify(&with_key(b"kid".to_vec(), SigningKey::generate(), Default::default()))
			.unwrap_err();
		assert!(err.is(Kind::Unauthorized));
	}
}
