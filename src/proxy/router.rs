//! Routing decisions for inbound requests.
//!
//! The router ties the rule table, matcher, weighted selector and
//! circuit breaker together:
//!
//! ```text
//! request -> first matching rule
//!   header_add     -> add absent headers, keep matching after it
//!   redirect       -> Redirect
//!   weighted_route -> pick subset
//! no rule          -> default subset
//! subset -> declared? -> circuit breaker admits? -> Forward
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use http::HeaderMap;

use super::breaker::CircuitBreaker;
use super::matcher::first_match;
use super::selector::WeightedSelector;
use crate::error::ValidationError;
use crate::metrics;
use crate::rules::{
    CircuitBreakerPolicy, Decision, Destination, Forward, Permit, RejectReason, Request, Rule,
    Subset, DEFAULT_SUBSET,
};
use crate::store::{normalize_host, CompiledAction, HostEntry, HostRules, RuleTable};

/// Routes requests according to per-host rules.
///
/// Thread-safe: `route` and `release` may be called concurrently from
/// any number of request workers while configuration is updated.
pub struct Router {
    table: Arc<RuleTable>,
    breaker: CircuitBreaker,
    selector: WeightedSelector,
}

impl Router {
    /// Creates a new Router with the given rule table.
    pub fn new(table: Arc<RuleTable>) -> Self {
        Self::with_selector(table, WeightedSelector::new())
    }

    /// Creates a Router with a specific selector, e.g. a seeded one.
    pub fn with_selector(table: Arc<RuleTable>, selector: WeightedSelector) -> Self {
        Self {
            table,
            breaker: CircuitBreaker::new(),
            selector,
        }
    }

    pub fn table(&self) -> &Arc<RuleTable> {
        &self.table
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Whether any configuration has been applied yet.
    pub fn is_ready(&self) -> bool {
        self.table.version() > 0
    }

    // ========== Configuration intake ==========

    /// Replaces the rule list of a host. On error the previous rules stay.
    pub fn set_rules(&self, host: &str, rules: Vec<Rule>) -> Result<u64, ValidationError> {
        let count = rules.len();
        match self.table.set_rules(host, rules) {
            Ok(version) => {
                tracing::info!(host = host, rules = count, version = version, "rules updated");
                self.reap(host);
                Ok(version)
            }
            Err(e) => {
                tracing::warn!(host = host, error = %e, "rules rejected");
                Err(e)
            }
        }
    }

    /// Clears the rule list of a host.
    pub fn remove_rules(&self, host: &str) -> u64 {
        let version = self.table.remove_rules(host);
        tracing::info!(host = host, version = version, "rules removed");
        self.reap(host);
        version
    }

    /// Replaces the subset declarations of a host and resets their
    /// circuit breaker state.
    pub fn set_subsets(&self, host: &str, subsets: Vec<Subset>) -> Result<u64, ValidationError> {
        let count = subsets.len();
        match self.table.set_subsets(host, subsets) {
            Ok(version) => {
                tracing::info!(host = host, subsets = count, version = version, "subsets updated");
                self.reset(host);
                Ok(version)
            }
            Err(e) => {
                tracing::warn!(host = host, error = %e, "subsets rejected");
                Err(e)
            }
        }
    }

    /// Clears the subset declarations of a host.
    pub fn remove_subsets(&self, host: &str) -> u64 {
        let version = self.table.remove_subsets(host);
        tracing::info!(host = host, version = version, "subsets removed");
        self.reset(host);
        version
    }

    /// Replaces the whole configuration. All hosts are validated first;
    /// on error nothing changes.
    pub fn apply(&self, entries: Vec<HostEntry>) -> Result<u64, (String, ValidationError)> {
        let hosts = entries.len();
        match self.table.replace_all(entries) {
            Ok(version) => {
                tracing::info!(hosts = hosts, version = version, "configuration applied");
                // A full sync replaces every subset declaration.
                self.breaker.clear();
                Ok(version)
            }
            Err((host, e)) => {
                tracing::warn!(host = %host, error = %e, "configuration rejected");
                Err((host, e))
            }
        }
    }

    // ========== Request path ==========

    /// Returns the first rule of `host` matching `request`, if any.
    pub fn match_rule(&self, host: &str, request: &Request) -> Option<Rule> {
        let snapshot = self.table.snapshot(host)?;
        let (idx, _) = first_match(snapshot.compiled(), 0, request)?;
        snapshot.rules().get(idx).cloned()
    }

    /// Decides what to do with one request.
    ///
    /// Never fails: configuration problems that can only be detected per
    /// request become [`Decision::Reject`].
    pub fn route(&self, host: &str, request: Request) -> Decision {
        // Unconfigured hosts are forwarded without breaker state.
        let Ok(host) = normalize_host(host) else {
            return Self::pass_through(String::new(), request);
        };
        let Some(snapshot) = self.table.snapshot(&host) else {
            return Self::pass_through(host, request);
        };

        let rules = snapshot.compiled();
        let mut added = HeaderMap::new();
        let mut start = 0;

        let subset = loop {
            let Some((idx, rule)) = first_match(rules, start, &request) else {
                break DEFAULT_SUBSET;
            };
            metrics::record_matched(&host, &rule.label);
            tracing::trace!(host = %host, rule = %rule.label, "rule matched");

            match &rule.action {
                CompiledAction::HeaderAdd(headers) => {
                    for (name, value) in headers {
                        if !request.headers.contains_key(name) && !added.contains_key(name) {
                            added.insert(name.clone(), value.clone());
                        }
                    }
                    start = idx + 1;
                }
                CompiledAction::Redirect { uri, status } => {
                    metrics::record_redirected(&host);
                    tracing::debug!(host = %host, from = %request.uri, to = %uri, "redirect");
                    return Decision::Redirect {
                        uri: uri.clone(),
                        status: *status,
                    };
                }
                CompiledAction::WeightedRoute(route) => break self.selector.select(route),
            }
        };

        let mut headers = request.headers;
        headers.extend(added);
        self.admit(host, &snapshot, subset, request.uri, headers)
    }

    /// Reports the outcome of a forwarded request to the circuit breaker.
    pub fn release(&self, forward: &Forward, success: bool) {
        let destination = &forward.destination;
        let snapshot = self.table.snapshot(&destination.host);
        let policy = snapshot
            .as_deref()
            .and_then(|s| s.policy(&destination.subset));
        self.breaker.release(destination, forward.permit, success, policy);
    }

    fn pass_through(host: String, request: Request) -> Decision {
        metrics::record_forwarded(DEFAULT_SUBSET);
        tracing::trace!(host = %host, "forward to unconfigured host");
        Decision::Forward(Forward {
            destination: Destination::new(host, DEFAULT_SUBSET),
            uri: request.uri,
            headers: request.headers,
            permit: Permit::UNTRACKED,
        })
    }

    fn admit(
        &self,
        host: String,
        snapshot: &HostRules,
        subset: &str,
        uri: String,
        headers: HeaderMap,
    ) -> Decision {
        if !snapshot.is_declared(subset) {
            tracing::warn!(host = %host, subset = subset, "route references undeclared subset");
            metrics::record_rejected(subset, RejectReason::NoMatchingSubset.as_str());
            return Decision::Reject(RejectReason::NoMatchingSubset);
        }
        let policy = snapshot.policy(subset);
        self.admit_destination(Destination::new(host, subset), policy, uri, headers)
    }

    fn admit_destination(
        &self,
        destination: Destination,
        policy: Option<&CircuitBreakerPolicy>,
        uri: String,
        headers: HeaderMap,
    ) -> Decision {
        match self.breaker.try_admit(&destination, policy) {
            Ok(permit) => {
                metrics::record_forwarded(&destination.subset);
                tracing::trace!(destination = %destination, "forward");
                Decision::Forward(Forward {
                    destination,
                    uri,
                    headers,
                    permit,
                })
            }
            Err(reason) => {
                metrics::record_rejected(&destination.subset, reason.as_str());
                tracing::debug!(destination = %destination, reason = %reason, "request rejected");
                Decision::Reject(reason)
            }
        }
    }

    /// Drops breaker state of subsets the host no longer references.
    fn reap(&self, host: &str) {
        let Ok(host) = normalize_host(host) else {
            return;
        };
        match self.table.snapshot(&host) {
            Some(snapshot) => {
                let referenced: HashSet<&str> =
                    snapshot.referenced_subsets().collect();
                self.breaker
                    .retain_host(&host, |subset| referenced.contains(subset));
            }
            None => self.breaker.reset_host(&host),
        }
    }

    fn reset(&self, host: &str) {
        if let Ok(host) = normalize_host(host) {
            self.breaker.reset_host(&host);
        }
    }
}
