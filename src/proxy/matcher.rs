//! First-match rule evaluation.
//!
//! Rules are checked in declaration order. A rule without a predicate
//! matches everything; otherwise its URI condition and every header
//! condition must hold.

use http::HeaderMap;

use crate::rules::{Request, UriMatch};
use crate::store::{CompiledMatch, CompiledRule};

/// Returns the first rule at or after `start` that matches `request`,
/// with its index.
pub(crate) fn first_match<'a>(
    rules: &'a [CompiledRule],
    start: usize,
    request: &Request,
) -> Option<(usize, &'a CompiledRule)> {
    let path = request.path();
    rules
        .iter()
        .enumerate()
        .skip(start)
        .find(|(_, rule)| match &rule.predicate {
            None => true,
            Some(predicate) => predicate_matches(predicate, path, &request.headers),
        })
}

fn predicate_matches(predicate: &CompiledMatch, path: &str, headers: &HeaderMap) -> bool {
    if let Some(uri) = &predicate.uri {
        if !uri_matches(uri, path) {
            return false;
        }
    }
    predicate.headers.iter().all(|(name, exact)| {
        headers
            .get_all(name)
            .iter()
            .any(|value| value.as_bytes() == exact.as_bytes())
    })
}

/// Checks a path against a URI condition. Prefixes are plain string
/// prefixes, not segment-aware.
pub fn uri_matches(uri: &UriMatch, path: &str) -> bool {
    match uri {
        UriMatch::Exact(expected) => path == expected,
        UriMatch::Prefix(prefix) => path.starts_with(prefix.as_str()),
    }
}
