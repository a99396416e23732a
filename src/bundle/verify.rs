use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::caveat::CaveatSet;
use crate::crypto::SigningKey;
use crate::error::{Error, Result};
use crate::macaroon::{Macaroon, TrustedThirdParties};

/// One permission token and its candidate discharges, grouped by ticket
/// matching.
#[derive(Clone, Debug)]
pub struct VerifyRequest {
	pub permission: Macaroon,
	pub discharges: Vec<Macaroon>,
}

/// Pluggable batch-verification strategy.
///
/// Implementations must return exactly one result per request, in order.
/// They may block (a networked verifier talking to a key service, say) and
/// must tolerate concurrent invocation; any cancellation or timeout is their
/// own concern.
pub trait Verifier: Send + Sync {
	fn verify(&self, requests: Vec<VerifyRequest>) -> Vec<Result<CaveatSet>>;
}

/// Maps a token's key-id to the signing key it was issued under and the
/// third parties trusted for it.
pub trait KeyResolver: Send + Sync {
	fn resolve(&self, kid: &[u8]) -> Result<(SigningKey, TrustedThirdParties)>;
}

/// [`Verifier`] that checks signatures locally with keys from a
/// [`KeyResolver`].
pub struct KeyResolverVerifier<R> {
	resolver: R,
}

impl<R> KeyResolverVerifier<R> {
	pub fn new(resolver: R) -> Self {
		KeyResolverVerifier { resolver }
	}
}

impl<R: KeyResolver> Verifier for KeyResolverVerifier<R> {
	fn verify(&self, requests: Vec<VerifyRequest>) -> Vec<Result<CaveatSet>> {
		requests
			.into_iter()
			.map(|req| {
				let (key, trusted) = self.resolver.resolve(req.permission.nonce().kid())?;
				req.permission.verify_decoded(&key, &req.discharges, &trusted)
			})
			.collect()
	}
}

/// Resolver that knows exactly one signing key.
pub struct WithKey {
	kid: Vec<u8>,
	key: SigningKey,
	trusted: TrustedThirdParties,
}

impl KeyResolver for WithKey {
	fn resolve(&self, kid: &[u8]) -> Result<(SigningKey, TrustedThirdParties)> {
		if kid != self.kid.as_slice() {
			return Err(Error::UnrecognizedToken("unknown key id".into()));
		}
		Ok((self.key.clone(), self.trusted.clone()))
	}
}

/// Verifier for tokens issued under a single known key.
pub fn with_key(
	kid: Vec<u8>,
	key: SigningKey,
	trusted: TrustedThirdParties,
) -> KeyResolverVerifier<WithKey> {
	KeyResolverVerifier::new(WithKey { kid, key, trusted })
}

struct CacheEntry {
	caveats: CaveatSet,
	expires_at: Instant,
}

/// Wraps any [`Verifier`] with an LRU of successful results.
///
/// The cache key is the canonical transport string of the permission token
/// concatenated with its (sorted) discharges, so any byte-level change to
/// any involved token misses. Failures are never cached.
pub struct VerificationCache<V> {
	inner: V,
	ttl: Duration,
	cache: Mutex<LruCache<String, CacheEntry>>,
}

impl<V> VerificationCache<V> {
	pub fn new(inner: V, capacity: NonZeroUsize, ttl: Duration) -> Self {
		VerificationCache { inner, ttl, cache: Mutex::new(LruCache::new(capacity)) }
	}

	fn cache_key(request: &VerifyRequest) -> String {
		let mut parts: Vec<String> = request
			.discharges
			.iter()
			.map(|d| d.clone().to_token_string())
			.collect();
		parts.sort();
		parts.push(request.permission.clone().to_token_string());
		parts.join(",")
	}
}

impl<V: Verifier> Verifier for VerificationCache<V> {
	fn verify(&self, requests: Vec<VerifyRequest>) -> Vec<Result<CaveatSet>> {
		let mut results: Vec<Option<Result<CaveatSet>>> = Vec::new();
		results.resize_with(requests.len(), || None);

		let mut misses = Vec::new();
		{
			let mut cache = self.cache.lock();
			for (index, request) in requests.into_iter().enumerate() {
				let key = Self::cache_key(&request);
				let fresh = match cache.get(&key) {
					Some(entry) if entry.expires_at > Instant::now() => {
						Some(entry.caveats.clone())
					}
					_ => None,
				};
				match fresh {
					Some(caveats) => {
						debug!("verification cache hit");
						results[index] = Some(Ok(caveats));
					}
					None => {
						// Clears an expired entry, if that is what we hit.
						cache.pop(&key);
						misses.push((index, key, request));
					}
				}
			}
		}

		if !misses.is_empty() {
			let batch: Vec<VerifyRequest> =
				misses.iter().map(|(_, _, req)| req.clone()).collect();
			let fresh = self.inner.verify(batch);
			let mut cache = self.cache.lock();
			for ((index, key, _), result) in misses.into_iter().zip(fresh) {
				if let Ok(caveats) = &result {
					cache.put(
						key,
						CacheEntry {
							caveats: caveats.clone(),
							expires_at: Instant::now() + self.ttl,
						},
					);
				}
				results[index] = Some(result);
			}
		}

		results
			.into_iter()
			.map(|r| r.expect("every request has a result"))
			.collect()
	}
}
