use std::collections::HashSet;
use std::sync::Arc;

use super::Token;

/// Decides which tokens a bundle operation sees.
///
/// A filter receives the whole token slice because some predicates relate
/// tokens to each other (a discharge is kept because of the permission token
/// it answers), and returns one keep/drop decision per token, in order.
pub trait Filter: Send + Sync {
	fn keep(&self, tokens: &[Token]) -> Vec<bool>;
}

/// The filter [`Bundle::parse`](super::Bundle::parse) applies: retains
/// non-macaroon tokens, macaroons located at the permission location, and
/// discharge macaroons associated with a retained permission token. A
/// discharge is associated when its key-id equals one of the permission's
/// third-party tickets.
pub struct DefaultFilter {
	location: String,
}

impl DefaultFilter {
	pub fn new(location: impl Into<String>) -> Self {
		DefaultFilter { location: location.into() }
	}
}

impl Filter for DefaultFilter {
	fn keep(&self, tokens: &[Token]) -> Vec<bool> {
		let mut tickets: HashSet<&[u8]> = HashSet::new();
		for token in tokens {
			let Some(macaroon) = token.macaroon() else { continue };
			if macaroon.location() == self.location {
				for tp in macaroon.caveats().third_party() {
					tickets.insert(tp.ticket.as_slice());
				}
			}
		}
		tokens
			.iter()
			.map(|token| match token.macaroon() {
				None => true,
				Some(m) if m.location() == self.location => true,
				Some(m) => tickets.contains(m.nonce().kid()),
			})
			.collect()
	}
}

/// Keeps only macaroons located at the given location.
pub struct HasLocation(pub String);

impl Filter for HasLocation {
	fn keep(&self, tokens: &[Token]) -> Vec<bool> {
		tokens
			.iter()
			.map(|t| t.location() == Some(self.0.as_str()))
			.collect()
	}
}

/// Per-token predicate adapter.
pub struct Predicate<F>(pub F);

impl<F> Filter for Predicate<F>
where
	F: Fn(&Token) -> bool + Send + Sync,
{
	fn keep(&self, tokens: &[Token]) -> Vec<bool> {
		tokens.iter().map(&self.0).collect()
	}
}

/// Keeps a token iff both constituent filters keep it.
pub struct And {
	a: Arc<dyn Filter>,
	b: Arc<dyn Filter>,
}

impl And {
	pub fn new(a: Arc<dyn Filter>, b: Arc<dyn Filter>) -> Self {
		And { a, b }
	}
}

impl Filter for And {
	fn keep(&self, tokens: &[Token]) -> Vec<bool> {
		self.a
			.keep(tokens)
			.into_iter()
			.zip(self.b.keep(tokens))
			.map(|(a, b)| a && b)
			.collect()
	}
}

/// Inverts another filter.
pub struct Not<F>(pub F);

impl<F: Filter> Filter for Not<F> {
	fn keep(&self, tokens: &[Token]) -> Vec<bool> {
		self.0.keep(tokens).into_iter().map(|keep| !keep).collect()
	}
}
