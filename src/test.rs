//! End-to-end scenarios: issue, attenuate, discharge, bundle, validate.

use serde::{Deserialize, Serialize};

use crate::access::testing::TestAccess;
use crate::bundle::{with_key, Bundle};
use crate::caveat::{register, CustomCaveat, Registration};
use crate::codec::{Reader, Writer};
use crate::error::Kind;
use crate::macaroon::discharge_ticket;
use crate::{
	Caveat, CaveatType, EncryptionKey, Error, Macaroon, Result, SigningKey, TrustedThirdParties,
	ValidityWindow,
};

const KID: &[u8] = &[0x6b, 0x69, 0x64];
const LOC: &str = "http://api";
const AUTH_LOC: &str = "http://auth";

fn vw(a: i64, b: i64) -> Caveat {
	Caveat::ValidityWindow(ValidityWindow::new(a, b))
}

fn no_trust() -> TrustedThirdParties {
	TrustedThirdParties::new()
}

fn issue(key: &SigningKey) -> Macaroon {
	Macaroon::new(KID.to_vec(), LOC, key)
}

#[test]
fn simple_issue_and_verify() {
	let key = SigningKey::generate();
	let mut m = issue(&key);
	m.add([vw(0, 9_999_999_999)]).unwrap();

	let decoded = Macaroon::decode(&m.encode()).unwrap();
	let caveats = decoded.verify(&key, &[], &no_trust()).unwrap();
	assert_eq!(caveats.len(), 1);

	assert!(caveats.validate(&[&TestAccess::at(100)]).is_ok());
	let err = caveats.validate(&[&TestAccess::at(10_000_000_000)]).unwrap_err();
	assert!(err.is(Kind::Unauthorized));
}

#[test]
fn stripping_a_caveat_invalidates_the_signature() {
	let key = SigningKey::generate();
	let mut m = issue(&key);
	m.add([vw(0, 9_999_999_999)]).unwrap();
	let wire = m.encode();

	// Rebuild the wire image with an emptied caveat array but the original
	// tail, as an attacker without the key would have to.
	let mut r = Reader::new(&wire);
	assert_eq!(r.array_len().unwrap(), 4);
	let (nonce_raw, _) = r.raw_value().unwrap();
	let location = r.str().unwrap();
	let caveat_entries = r.array_len().unwrap();
	for _ in 0..caveat_entries {
		r.raw_value().unwrap();
	}
	let tail = r.bin().unwrap();
	r.finish().unwrap();

	let mut w = Writer::new();
	w.array_len(4);
	w.raw(nonce_raw);
	w.str(&location);
	w.array_len(0);
	w.bin(&tail);

	let stripped = Macaroon::decode(&w.into_inner()).unwrap();
	let err = stripped.verify(&key, &[], &no_trust()).unwrap_err();
	assert_eq!(err, Error::InvalidSignature);
}

#[test]
fn third_party_round_trip() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();

	let tickets = m.third_party_tickets();
	assert_eq!(tickets.len(), 1);
	assert_eq!(tickets[AUTH_LOC].len(), 1);

	let (ticket_caveats, mut discharge) =
		discharge_ticket(&ka, AUTH_LOC, &tickets[AUTH_LOC][0]).unwrap();
	assert!(ticket_caveats.is_empty());
	discharge.add([vw(0, 9_999_999_999)]).unwrap();

	let wire = m.encode();
	let decoded = Macaroon::decode(&wire).unwrap();

	let err = decoded.verify(&key, &[], &no_trust()).unwrap_err();
	assert!(err.is(Kind::NoMatchingDischarge));

	let caveats = decoded.verify(&key, &[discharge.encode()], &no_trust()).unwrap();
	// The discharge's validity window is merged into the returned set.
	assert_eq!(caveats.len(), 1);
	assert!(caveats.validate(&[&TestAccess::at(100)]).is_ok());
}

#[test]
fn ticket_caveats_reach_the_third_party() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, [vw(100, 200)]).unwrap();

	let tickets = m.third_party_tickets();
	let (ticket_caveats, _) = discharge_ticket(&ka, AUTH_LOC, &tickets[AUTH_LOC][0]).unwrap();
	assert_eq!(ticket_caveats.len(), 1);
	assert_eq!(ticket_caveats.expiration(), Some(ValidityWindow::new(100, 200)));
}

#[test]
fn discharge_key_recovery_matches_the_sealed_ticket() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	let tail_before: [u8; 32] = m.tail().try_into().unwrap();
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();

	let tp = m.caveats().third_party()[0];
	// The key recovered from the verifier side equals the key the third
	// party finds inside the sealed ticket, even though the sealed blobs
	// themselves differ.
	let from_verifier =
		crate::unseal(&EncryptionKey::from_bytes(tail_before), &tp.verifier_key).unwrap();
	let (_, mut via_ticket) = discharge_ticket(&ka, AUTH_LOC, &tp.ticket).unwrap();
	let discharge = Macaroon::decode(&via_ticket.encode()).unwrap();
	// Verifying the discharge under the recovered key proves they match.
	let recovered = SigningKey::try_from(from_verifier.as_slice()).unwrap();
	assert!(discharge.verify(&recovered, &[], &no_trust()).is_ok());
}

#[test]
fn binding_rejects_replay_against_another_token() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();

	let tickets = m.third_party_tickets();
	let (_, mut discharge) = discharge_ticket(&ka, AUTH_LOC, &tickets[AUTH_LOC][0]).unwrap();

	// Bind the discharge to an unrelated token.
	let mut unrelated = Macaroon::new(b"kid2".to_vec(), LOC, &SigningKey::generate());
	discharge.bind(&unrelated.encode()).unwrap();

	let decoded = Macaroon::decode(&m.encode()).unwrap();
	let err = decoded.verify(&key, &[discharge.encode()], &no_trust()).unwrap_err();
	assert!(err.is(Kind::BindingMismatch));
}

#[test]
fn binding_to_the_actual_parent_verifies() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();
	let wire = m.encode();

	let tickets = m.third_party_tickets();
	let (_, mut discharge) = discharge_ticket(&ka, AUTH_LOC, &tickets[AUTH_LOC][0]).unwrap();
	discharge.bind(&wire).unwrap();

	let decoded = Macaroon::decode(&wire).unwrap();
	assert!(decoded.verify(&key, &[discharge.encode()], &no_trust()).is_ok());
}

#[test]
fn binding_survives_later_attenuation_of_the_parent() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();
	let wire = m.encode();

	let tickets = m.third_party_tickets();
	let (_, mut discharge) = discharge_ticket(&ka, AUTH_LOC, &tickets[AUTH_LOC][0]).unwrap();
	discharge.bind(&wire).unwrap();

	// The holder narrows the permission token after the discharge was bound.
	let mut attenuated = Macaroon::decode(&wire).unwrap();
	attenuated.add([vw(0, 9_999_999_999)]).unwrap();

	let decoded = Macaroon::decode(&attenuated.encode()).unwrap();
	assert!(decoded.verify(&key, &[discharge.encode()], &no_trust()).is_ok());
}

// An attestation caveat: asserts who the third party authenticated rather
// than restricting anything.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct AuthenticatedUser(String);

const AUTHENTICATED_USER_TYPE: CaveatType = CaveatType((1 << 48) + 0xa77);

impl CustomCaveat for AuthenticatedUser {
	fn caveat_type(&self) -> CaveatType {
		AUTHENTICATED_USER_TYPE
	}

	fn name(&self) -> &str {
		"authenticated_user"
	}

	fn prohibits(&self, _access: &dyn crate::Access) -> Result<()> {
		Ok(())
	}

	fn is_attestation(&self) -> bool {
		true
	}

	fn encode_body(&self) -> Result<Vec<u8>> {
		rmp_serde::to_vec(self).map_err(|e| Error::Encoding(e.to_string()))
	}

	fn body_json(&self) -> Result<serde_json::Value> {
		serde_json::to_value(self).map_err(|e| Error::Encoding(e.to_string()))
	}

	fn clone_caveat(&self) -> Box<dyn CustomCaveat> {
		Box::new(self.clone())
	}
}

fn register_authenticated_user() {
	// Several tests race to register; the loser's duplicate error is fine.
	let _ = register(Registration {
		caveat_type: AUTHENTICATED_USER_TYPE,
		name: "authenticated_user",
		aliases: &[],
		decode: |b| {
			rmp_serde::from_slice::<AuthenticatedUser>(b)
				.map(|c| Caveat::Custom(Box::new(c)))
				.map_err(|e| Error::Encoding(e.to_string()))
		},
		decode_json: |v| {
			serde_json::from_value::<AuthenticatedUser>(v.clone())
				.map(|c| Caveat::Custom(Box::new(c)))
				.map_err(|e| Error::Encoding(e.to_string()))
		},
	});
}

fn attestation() -> Caveat {
	Caveat::Custom(Box::new(AuthenticatedUser("alice".into())))
}

fn contains_attestation(caveats: &crate::CaveatSet) -> bool {
	caveats.iter().any(|c| c.is_attestation())
}

#[test]
fn attestations_require_a_proof_token() {
	register_authenticated_user();
	let key = SigningKey::generate();
	let mut m = issue(&key);
	assert!(m.add([attestation()]).unwrap_err().is(Kind::AttestationNotAllowed));
}

#[test]
fn attestations_are_trusted_only_with_the_right_key() {
	register_authenticated_user();
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();

	let tickets = m.third_party_tickets();
	let (_, mut discharge) = discharge_ticket(&ka, AUTH_LOC, &tickets[AUTH_LOC][0]).unwrap();
	discharge.add([attestation()]).unwrap();

	let wire = m.encode();
	let discharge_wire = discharge.encode();
	let decoded = Macaroon::decode(&wire).unwrap();

	// Trusted third party: the attestation is returned.
	let trusted =
		TrustedThirdParties::from([(AUTH_LOC.to_string(), vec![ka.clone()])]);
	let caveats = decoded.verify(&key, &[discharge_wire.clone()], &trusted).unwrap();
	assert!(contains_attestation(&caveats));

	// No trust table: verification succeeds but the attestation is dropped.
	let caveats = decoded.verify(&key, &[discharge_wire.clone()], &no_trust()).unwrap();
	assert!(!contains_attestation(&caveats));

	// Wrong key for the location: same.
	let wrong = TrustedThirdParties::from([(
		AUTH_LOC.to_string(),
		vec![EncryptionKey::generate()],
	)]);
	let caveats = decoded.verify(&key, &[discharge_wire], &wrong).unwrap();
	assert!(!contains_attestation(&caveats));
}

#[test]
fn discharges_cannot_nest_third_party_caveats() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();

	let tickets = m.third_party_tickets();
	let (_, mut discharge) = discharge_ticket(&ka, AUTH_LOC, &tickets[AUTH_LOC][0]).unwrap();
	discharge.add_third_party(&EncryptionKey::generate(), "http://deeper", []).unwrap();

	let decoded = Macaroon::decode(&m.encode()).unwrap();
	// Discharge verification runs with no further discharges available, so
	// the nested demand cannot be satisfied.
	let err = decoded.verify(&key, &[discharge.encode()], &no_trust()).unwrap_err();
	assert!(err.is(Kind::NoMatchingDischarge));
}

#[test]
fn attenuation_only_narrows() {
	let key = SigningKey::generate();
	let mut m = issue(&key);
	m.add([vw(0, 9_999_999_999)]).unwrap();

	let before = Macaroon::decode(&m.encode()).unwrap();
	let caveats = before.verify(&key, &[], &no_trust()).unwrap();
	assert!(caveats.validate(&[&TestAccess::at(100)]).is_ok());

	let mut narrowed = before.clone();
	narrowed.add([vw(50, 60)]).unwrap();
	let caveats = Macaroon::decode(&narrowed.encode())
		.unwrap()
		.verify(&key, &[], &no_trust())
		.unwrap();
	// Still bounded by the original window, and now by the new one too.
	assert!(caveats.validate(&[&TestAccess::at(55)]).is_ok());
	assert!(caveats.validate(&[&TestAccess::at(100)]).unwrap_err().is(Kind::Unauthorized));
}

#[test]
fn wire_round_trip_is_byte_stable() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add([vw(0, 100)]).unwrap();
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();

	let wire = m.encode();
	let mut decoded = Macaroon::decode(&wire).unwrap();
	assert_eq!(decoded, m);
	assert_eq!(decoded.encode(), wire);
}

#[test]
fn bundle_selects_discharges_and_verifies() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();
	let mut unrelated = Macaroon::new(b"kid9".to_vec(), "http://other", &SigningKey::generate());

	let header = format!("FlyV1 {},{}", m.to_token_string(), unrelated.to_token_string());
	let bundle = Bundle::parse(LOC, &header);

	// The unrelated token is dropped by the default filter.
	assert_eq!(bundle.len(), 1);

	let undischarged = bundle.undischarged_third_party_tickets();
	assert_eq!(undischarged[AUTH_LOC].len(), 1);

	let added = bundle.discharge(AUTH_LOC, &ka, |_| Ok(vec![])).unwrap();
	assert_eq!(added, 1);
	assert!(bundle.undischarged_third_party_tickets().is_empty());

	bundle.verify(&with_key(KID.to_vec(), key, no_trust())).unwrap();
	assert!(bundle.any_verified());
	assert!(bundle.validate(&[&TestAccess::at(100)]).is_ok());
}

#[test]
fn bundle_discharge_is_all_or_nothing() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();
	let bundle = Bundle::parse(LOC, &format!("FlyV1 {}", m.to_token_string()));

	let err = bundle
		.discharge(AUTH_LOC, &ka, |_| {
			Err(Error::Unauthorized("third party refuses".into()))
		})
		.unwrap_err();
	assert!(err.is(Kind::Unauthorized));
	assert_eq!(bundle.undischarged_third_party_tickets()[AUTH_LOC].len(), 1);
	assert_eq!(bundle.len(), 1);
}

#[test]
fn bundle_discharge_callback_can_restrict() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();
	let bundle = Bundle::parse(LOC, &format!("FlyV1 {}", m.to_token_string()));

	bundle.discharge(AUTH_LOC, &ka, |_| Ok(vec![vw(0, 9_999_999_999)])).unwrap();
	bundle.verify(&with_key(KID.to_vec(), key, no_trust())).unwrap();

	assert!(bundle.validate(&[&TestAccess::at(100)]).is_ok());
	assert!(bundle
		.validate(&[&TestAccess::at(10_000_000_000)])
		.unwrap_err()
		.is(Kind::Unauthorized));
}

#[test]
fn bundle_reparse_is_idempotent() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();
	let header = format!("FlyV1 {},not-a-macaroon", m.to_token_string());

	let bundle = Bundle::parse(LOC, &header);
	bundle.discharge(AUTH_LOC, &ka, |_| Ok(vec![])).unwrap();

	let reparsed = Bundle::parse(LOC, &bundle.header());
	assert_eq!(reparsed.header(), bundle.header());
	assert_eq!(reparsed.len(), bundle.len());
	assert_eq!(bundle.clone().header(), bundle.header());
}

#[test]
fn bundle_attenuates_every_permission_token() {
	let key = SigningKey::generate();
	let mut a = issue(&key);
	let mut b = issue(&key);
	let header = format!("FlyV1 {},{}", a.to_token_string(), b.to_token_string());
	let bundle = Bundle::parse(LOC, &header);

	bundle.attenuate(vec![vw(0, 9_999_999_999)]).unwrap();
	bundle.verify(&with_key(KID.to_vec(), key.clone(), no_trust())).unwrap();
	assert!(bundle.validate(&[&TestAccess::at(100)]).is_ok());
	assert!(bundle
		.validate(&[&TestAccess::at(10_000_000_000)])
		.unwrap_err()
		.is(Kind::Unauthorized));

	// Both tokens carry the caveat now.
	for caveats in bundle.verified_caveats() {
		assert_eq!(caveats.len(), 1);
	}
}

#[test]
fn bundle_validate_passes_if_any_token_authorizes() {
	let key = SigningKey::generate();
	let mut narrow = issue(&key);
	narrow.add([vw(0, 10)]).unwrap();
	let mut wide = issue(&key);
	wide.add([vw(0, 9_999_999_999)]).unwrap();

	let header = format!("FlyV1 {},{}", narrow.to_token_string(), wide.to_token_string());
	let bundle = Bundle::parse(LOC, &header);
	bundle.verify(&with_key(KID.to_vec(), key, no_trust())).unwrap();

	// now=100 violates the narrow token but the wide one authorizes.
	assert!(bundle.validate(&[&TestAccess::at(100)]).is_ok());
}

#[test]
fn legacy_prefixes_parse_as_macaroons() {
	let key = SigningKey::generate();
	let mut m = issue(&key);
	let b64 = m.to_token_string();
	let b64 = b64.strip_prefix(crate::TOKEN_PREFIX).unwrap();

	let header = format!("FlyV1 fm1r_{b64},fm1a_{b64}");
	let bundle = Bundle::parse(LOC, &header);
	assert_eq!(bundle.len(), 2);
	bundle.verify(&with_key(KID.to_vec(), key, no_trust())).unwrap();
}

#[test]
fn two_third_parties_need_two_discharges() {
	let key = SigningKey::generate();
	let ka1 = EncryptionKey::generate();
	let ka2 = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka1, "http://auth-1", []).unwrap();
	m.add_third_party(&ka2, "http://auth-2", []).unwrap();

	let tickets = m.third_party_tickets();
	let (_, mut d1) = discharge_ticket(&ka1, "http://auth-1", &tickets["http://auth-1"][0]).unwrap();
	let (_, mut d2) = discharge_ticket(&ka2, "http://auth-2", &tickets["http://auth-2"][0]).unwrap();

	let decoded = Macaroon::decode(&m.encode()).unwrap();
	let err = decoded.verify(&key, &[d1.encode()], &no_trust()).unwrap_err();
	assert!(err.is(Kind::NoMatchingDischarge));
	assert!(decoded.verify(&key, &[d1.encode(), d2.encode()], &no_trust()).is_ok());
}

#[test]
fn discharge_group_succeeds_if_any_candidate_verifies() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();
	let wire = m.encode();

	let tickets = m.third_party_tickets();
	let ticket = &tickets[AUTH_LOC][0];

	// A forged candidate carrying the right kid but the wrong signing key,
	// plus the genuine discharge.
	let mut forged = Macaroon::new_proof(ticket.clone(), AUTH_LOC, &SigningKey::generate());
	let (_, mut genuine) = discharge_ticket(&ka, AUTH_LOC, ticket).unwrap();

	let decoded = Macaroon::decode(&wire).unwrap();
	let caveats = decoded
		.verify(&key, &[forged.encode(), genuine.encode()], &no_trust())
		.unwrap();
	assert!(caveats.is_empty());

	// Only the forged candidate: the group fails with its error.
	let mut forged = Macaroon::new_proof(ticket.clone(), AUTH_LOC, &SigningKey::generate());
	let err = decoded.verify(&key, &[forged.encode()], &no_trust()).unwrap_err();
	assert!(err.is(Kind::InvalidSignature));
}

// A restriction on a named app, to exercise the downstream-caveat path end
// to end: registry decode, wire round-trip, and access downcasting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct AppScope(Vec<String>);

const APP_SCOPE_TYPE: CaveatType = CaveatType((1 << 48) + 0x5c0);

impl CustomCaveat for AppScope {
	fn caveat_type(&self) -> CaveatType {
		APP_SCOPE_TYPE
	}

	fn name(&self) -> &str {
		"app_scope"
	}

	fn prohibits(&self, access: &dyn crate::Access) -> Result<()> {
		let Some(req) = access.as_any().downcast_ref::<AppAccess>() else {
			return Err(Error::ResourceUnspecified("access names no app".into()));
		};
		if self.0.iter().any(|app| *app == req.app) {
			Ok(())
		} else {
			Err(Error::Unauthorized(format!("app {} is out of scope", req.app)))
		}
	}

	fn encode_body(&self) -> Result<Vec<u8>> {
		rmp_serde::to_vec(self).map_err(|e| Error::Encoding(e.to_string()))
	}

	fn body_json(&self) -> Result<serde_json::Value> {
		serde_json::to_value(self).map_err(|e| Error::Encoding(e.to_string()))
	}

	fn clone_caveat(&self) -> Box<dyn CustomCaveat> {
		Box::new(self.clone())
	}
}

struct AppAccess {
	app: String,
	now: i64,
	action: crate::Action,
}

impl crate::Access for AppAccess {
	fn validate(&self) -> Result<()> {
		Ok(())
	}

	fn now(&self) -> std::time::SystemTime {
		std::time::UNIX_EPOCH + std::time::Duration::from_secs(self.now as u64)
	}

	fn action(&self) -> Option<crate::Action> {
		Some(self.action)
	}

	fn as_any(&self) -> &dyn std::any::Any {
		self
	}
}

fn register_app_scope() {
	let _ = register(Registration {
		caveat_type: APP_SCOPE_TYPE,
		name: "app_scope",
		aliases: &["apps"],
		decode: |b| {
			rmp_serde::from_slice::<AppScope>(b)
				.map(|c| Caveat::Custom(Box::new(c)))
				.map_err(|e| Error::Encoding(e.to_string()))
		},
		decode_json: |v| {
			serde_json::from_value::<AppScope>(v.clone())
				.map(|c| Caveat::Custom(Box::new(c)))
				.map_err(|e| Error::Encoding(e.to_string()))
		},
	});
}

#[test]
fn custom_caveat_survives_the_wire_and_evaluates() {
	register_app_scope();
	let key = SigningKey::generate();
	let mut m = issue(&key);
	m.add([Caveat::Custom(Box::new(AppScope(vec!["billing".into()])))]).unwrap();

	let decoded = Macaroon::decode(&m.encode()).unwrap();
	let caveats = decoded.verify(&key, &[], &no_trust()).unwrap();

	let allowed = AppAccess { app: "billing".into(), now: 0, action: crate::Action::READ };
	assert!(caveats.validate(&[&allowed]).is_ok());

	let denied = AppAccess { app: "frontend".into(), now: 0, action: crate::Action::READ };
	assert!(caveats.validate(&[&denied]).unwrap_err().is(Kind::Unauthorized));
}

#[test]
fn if_present_applies_only_when_the_resource_is_named() {
	register_app_scope();
	let key = SigningKey::generate();
	let mut m = issue(&key);
	let ifs = crate::CaveatSet::from_caveats([Caveat::Custom(Box::new(AppScope(vec![
		"billing".into(),
	])))])
	.unwrap();
	m.add([Caveat::IfPresent(crate::IfPresent { ifs, otherwise: crate::Action::READ })])
		.unwrap();

	let decoded = Macaroon::decode(&m.encode()).unwrap();
	let caveats = decoded.verify(&key, &[], &no_trust()).unwrap();

	// Access names an in-scope app: the nested caveat governs, any action.
	let named = AppAccess { app: "billing".into(), now: 0, action: crate::Action::ALL };
	assert!(caveats.validate(&[&named]).is_ok());

	// Access names an out-of-scope app: the nested verdict is propagated.
	let other = AppAccess { app: "frontend".into(), now: 0, action: crate::Action::READ };
	assert!(caveats.validate(&[&other]).unwrap_err().is(Kind::Unauthorized));

	// Access names no app at all: the else mask takes over.
	assert!(caveats
		.validate(&[&TestAccess::with_action(0, crate::Action::READ)])
		.is_ok());
	assert!(caveats
		.validate(&[&TestAccess::with_action(0, crate::Action::READ | crate::Action::WRITE)])
		.unwrap_err()
		.is(Kind::Unauthorized));
}

#[test]
fn unregistered_caveats_verify_but_refuse_every_access() {
	register_app_scope();
	let key = SigningKey::generate();
	let mut m = issue(&key);
	m.add([Caveat::Custom(Box::new(AppScope(vec!["billing".into()])))]).unwrap();
	let wire = m.encode();

	// A verifier that has never heard of app_scope still checks the
	// signature correctly, then conservatively refuses the request. Model
	// it by rewriting the caveat's type id to one nobody registered.
	let mut r = Reader::new(&wire);
	assert_eq!(r.array_len().unwrap(), 4);
	let (nonce_raw, _) = r.raw_value().unwrap();
	let location = r.str().unwrap();
	assert_eq!(r.array_len().unwrap(), 2);
	let (_, _) = r.raw_value().unwrap();
	let (body_raw, _) = r.raw_value().unwrap();
	let tail = r.bin().unwrap();
	r.finish().unwrap();

	let mut w = Writer::new();
	w.array_len(4);
	w.raw(nonce_raw);
	w.str(&location);
	w.array_len(2);
	w.uint((1 << 48) + 0xdead);
	w.raw(body_raw);
	w.bin(&tail);

	// The tail no longer matches: the caveat's packed bytes changed.
	let retyped = Macaroon::decode(&w.into_inner()).unwrap();
	assert_eq!(
		retyped.verify(&key, &[], &no_trust()).unwrap_err(),
		Error::InvalidSignature
	);

	// Whereas a genuinely unregistered caveat whose bytes are intact passes
	// signature verification and then refuses validation.
	let mut m2 = issue(&key);
	m2.add([Caveat::Unregistered(crate::UnregisteredCaveat {
		caveat_type: CaveatType((1 << 48) + 0xdead),
		raw_msgpack: Some(vec![0xc0]),
		raw_json: None,
	})])
	.unwrap();
	let decoded = Macaroon::decode(&m2.encode()).unwrap();
	let caveats = decoded.verify(&key, &[], &no_trust()).unwrap();
	assert!(caveats.validate(&[&TestAccess::at(0)]).unwrap_err().is(Kind::BadCaveat));
}

#[test]
fn json_ipc_feeds_bundle_attenuation() {
	register_app_scope();
	let key = SigningKey::generate();
	let mut m = issue(&key);
	let bundle = Bundle::parse(LOC, &format!("FlyV1 {}", m.to_token_string()));

	// A sidecar asks for attenuation over JSON, using an alias name.
	let request = serde_json::json!({
		"location": LOC,
		"caveats": [
			{"type": "apps", "body": ["billing"]},
			{"type": "validity_window", "body": {"not_before": 0, "not_after": 9_999_999_999i64}},
		],
	});
	let request = crate::json::TokenRequest::from_json(&request).unwrap();
	assert_eq!(request.location, LOC);
	bundle.attenuate(request.caveats).unwrap();

	bundle.verify(&with_key(KID.to_vec(), key, no_trust())).unwrap();
	let allowed = AppAccess { app: "billing".into(), now: 100, action: crate::Action::READ };
	assert!(bundle.validate(&[&allowed]).is_ok());
	let denied = AppAccess { app: "frontend".into(), now: 100, action: crate::Action::READ };
	assert!(bundle.validate(&[&denied]).unwrap_err().is(Kind::Unauthorized));
}

#[test]
fn cached_verifier_plugs_into_the_bundle() {
	use std::num::NonZeroUsize;
	use std::time::Duration;

	let key = SigningKey::generate();
	let mut m = issue(&key);
	let bundle = Bundle::parse(LOC, &format!("FlyV1 {}", m.to_token_string()));

	let cached = crate::VerificationCache::new(
		with_key(KID.to_vec(), key, no_trust()),
		NonZeroUsize::new(16).unwrap(),
		Duration::from_secs(60),
	);
	bundle.verify(&cached).unwrap();
	bundle.verify(&cached).unwrap();
	assert!(bundle.any_verified());
}

#[test]
fn binding_twice_to_the_same_parent_is_idempotent() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();
	let wire = m.encode();

	let tickets = m.third_party_tickets();
	let (_, mut discharge) = discharge_ticket(&ka, AUTH_LOC, &tickets[AUTH_LOC][0]).unwrap();
	discharge.bind(&wire).unwrap();
	discharge.bind(&wire).unwrap();
	assert_eq!(discharge.caveats().len(), 1);

	let decoded = Macaroon::decode(&wire).unwrap();
	assert!(decoded.verify(&key, &[discharge.encode()], &no_trust()).is_ok());
}

#[test]
fn binding_to_two_chain_states_narrows_to_the_later_one() {
	let key = SigningKey::generate();
	let ka = EncryptionKey::generate();
	let mut m = issue(&key);
	m.add_third_party(&ka, AUTH_LOC, []).unwrap();
	let wire_before = m.encode();

	let mut attenuated = Macaroon::decode(&wire_before).unwrap();
	attenuated.add([vw(0, 9_999_999_999)]).unwrap();
	let wire_after = attenuated.encode();

	// Pin the discharge to both states of the same token. The later state's
	// chain contains both tails, the earlier state's chain only one.
	let tickets = m.third_party_tickets();
	let (_, mut discharge) = discharge_ticket(&ka, AUTH_LOC, &tickets[AUTH_LOC][0]).unwrap();
	discharge.bind(&wire_before).unwrap();
	discharge.bind(&wire_after).unwrap();
	let discharge_wire = discharge.encode();

	let later = Macaroon::decode(&wire_after).unwrap();
	assert!(later.verify(&key, &[discharge_wire.clone()], &no_trust()).is_ok());

	let earlier = Macaroon::decode(&wire_before).unwrap();
	let err = earlier.verify(&key, &[discharge_wire], &no_trust()).unwrap_err();
	assert!(err.is(Kind::BindingMismatch));
}

#[test]
fn token_expiration_is_the_narrowest_window() {
	let key = SigningKey::generate();
	let mut m = issue(&key);
	assert_eq!(m.expiration(), None);
	m.add([vw(0, 1000), vw(100, 5000)]).unwrap();
	assert_eq!(m.expiration(), Some(ValidityWindow::new(100, 1000)));
}

#[test]
fn select_scopes_verification_to_the_view() {
	let key = SigningKey::generate();
	let other_key = SigningKey::generate();
	let mut good = issue(&key);
	let mut bad = Macaroon::new(b"kid-b".to_vec(), LOC, &other_key);

	let header = format!("FlyV1 {},{}", good.to_token_string(), bad.to_token_string());
	let bundle = Bundle::parse(LOC, &header);

	// Through a view of tokens the verifier has a key for, only those get
	// verified; the other token's state is untouched.
	let view = bundle.select(crate::bundle::Predicate(|t: &crate::Token| {
		t.macaroon().map_or(false, |m| m.nonce().kid() == KID)
	}));
	view.verify(&with_key(KID.to_vec(), key, no_trust())).unwrap();
	assert!(view.any_verified());

	// The root bundle sees one verified and one still-unverified token.
	assert!(bundle.any_verified());
	assert_eq!(bundle.verified_caveats().len(), 1);
}

#[test]
fn add_tokens_extends_a_root_bundle() {
	let key = SigningKey::generate();
	let mut m = issue(&key);
	let bundle = Bundle::parse(LOC, "FlyV1 opaque-key");
	assert_eq!(bundle.len(), 1);

	bundle.add_tokens(&m.to_token_string()).unwrap();
	assert_eq!(bundle.len(), 2);
	bundle.verify(&with_key(KID.to_vec(), key, no_trust())).unwrap();
	assert!(bundle.validate(&[&TestAccess::at(0)]).is_ok());
}

#[test]
fn validate_aggregates_errors_across_accesses() {
	let key = SigningKey::generate();
	let mut m = issue(&key);
	m.add([vw(100, 200)]).unwrap();
	let decoded = Macaroon::decode(&m.encode()).unwrap();
	let caveats = decoded.verify(&key, &[], &no_trust()).unwrap();

	// Both accesses are out of the window; both failures are reported.
	let err = caveats
		.validate(&[&TestAccess::at(0), &TestAccess::at(300)])
		.unwrap_err();
	match err {
		Error::Multiple(errs) => assert_eq!(errs.len(), 2),
		other => panic!("expected an aggregate, got {other:?}"),
	}
}
