//! Routing rule model and per-request decision types.
//!
//! Rules are plain data: they are supplied by the configuration
//! collaborator, validated and compiled by the rule table, and
//! evaluated by the router for every inbound request.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

/// Name of the subset that receives traffic when no route rule applies.
pub const DEFAULT_SUBSET: &str = "default";

/// A single routing rule for a host.
///
/// Rules are evaluated in declaration order; the first rule whose
/// predicate holds is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Optional rule name, used in logs and metrics.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Match predicate. `None` matches every request.
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub predicate: Option<RuleMatch>,
    /// What to do with a matching request.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub action: RuleAction,
}

impl Rule {
    /// Creates an unnamed rule that matches every request.
    pub fn new(action: RuleAction) -> Self {
        Self {
            name: String::new(),
            predicate: None,
            action,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn when(mut self, predicate: RuleMatch) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Shorthand for a header-add rule with a single header.
    pub fn header_add(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut add = BTreeMap::new();
        add.insert(name.into(), value.into());
        Self::new(RuleAction::HeaderAdd { add })
    }

    /// Shorthand for a redirect rule using the default status.
    pub fn redirect(uri: impl Into<String>) -> Self {
        Self::new(RuleAction::Redirect {
            uri: uri.into(),
            code: None,
        })
    }

    /// Shorthand for a weighted route over `(subset, weight)` pairs.
    pub fn weighted<S: Into<String>>(destinations: impl IntoIterator<Item = (S, u32)>) -> Self {
        Self::new(RuleAction::WeightedRoute {
            destinations: destinations
                .into_iter()
                .map(|(subset, weight)| WeightedDestination {
                    subset: subset.into(),
                    weight,
                })
                .collect(),
        })
    }
}

/// Type-specific payload of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Adds request headers that the caller did not already send.
    HeaderAdd { add: BTreeMap<String, String> },
    /// Answers with a redirect instead of forwarding.
    Redirect {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
    },
    /// Splits traffic across subsets by percentage.
    WeightedRoute {
        destinations: Vec<WeightedDestination>,
    },
}

impl RuleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            RuleAction::HeaderAdd { .. } => "header_add",
            RuleAction::Redirect { .. } => "redirect",
            RuleAction::WeightedRoute { .. } => "weighted_route",
        }
    }
}

/// One leg of a weighted split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedDestination {
    pub subset: String,
    pub weight: u32,
}

/// Request predicate. All present conditions must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(
        default,
        with = "serde_yaml::with::singleton_map",
        skip_serializing_if = "Option::is_none"
    )]
    pub uri: Option<UriMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatch>,
}

impl RuleMatch {
    pub fn uri_exact(path: impl Into<String>) -> Self {
        Self {
            uri: Some(UriMatch::Exact(path.into())),
            headers: Vec::new(),
        }
    }

    pub fn uri_prefix(prefix: impl Into<String>) -> Self {
        Self {
            uri: Some(UriMatch::Prefix(prefix.into())),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, exact: impl Into<String>) -> Self {
        self.headers.push(HeaderMatch {
            name: name.into(),
            exact: exact.into(),
        });
        self
    }
}

/// Path comparison, applied to the request path without its query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UriMatch {
    Exact(String),
    Prefix(String),
}

/// Header equality condition. Names are case-insensitive, values are not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMatch {
    pub name: String,
    pub exact: String,
}

/// A named destination group of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subset {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
}

impl Subset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            circuit_breaker: None,
        }
    }

    pub fn with_circuit_breaker(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(policy);
        self
    }
}

/// Per-subset admission limits. `None` means unlimited or disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    /// Consecutive failures that open the circuit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_errors: Option<u32>,
    /// How long an open circuit stays open. Without it, only a subset
    /// replacement closes the circuit again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ejection_time_ms: Option<u64>,
}

impl CircuitBreakerPolicy {
    /// A policy that rejects every request.
    pub fn reject_all() -> Self {
        Self {
            max_pending_requests: Some(0),
            max_connections: Some(0),
            consecutive_errors: None,
            base_ejection_time_ms: None,
        }
    }

    pub fn base_ejection_time(&self) -> Option<Duration> {
        self.base_ejection_time_ms.map(Duration::from_millis)
    }
}

/// An inbound request as seen by the router.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub uri: String,
    pub headers: HeaderMap,
}

impl Request {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Adds a header, ignoring names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// The request path, without query string or fragment.
    pub fn path(&self) -> &str {
        let end = self.uri.find(|c| c == '?' || c == '#').unwrap_or(self.uri.len());
        &self.uri[..end]
    }
}

/// Where an admitted request goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub subset: String,
}

impl Destination {
    pub fn new(host: impl Into<String>, subset: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            subset: subset.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.subset)
    }
}

/// Ties an admitted request to the breaker state that counted it, so a
/// release after a subset replacement cannot touch the fresh counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit(pub(crate) u64);

impl Permit {
    /// Permit of a request no breaker is tracking; its release is a no-op.
    pub const UNTRACKED: Permit = Permit(0);
}

/// A request admitted for forwarding.
#[derive(Debug, Clone)]
pub struct Forward {
    pub destination: Destination,
    pub uri: String,
    pub headers: HeaderMap,
    /// Handed back through `Router::release`.
    pub permit: Permit,
}

/// Why a request was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The subset's circuit is open.
    CircuitOpen,
    /// Pending request or connection limit reached.
    Overflow,
    /// A route referenced a subset the host never declared.
    NoMatchingSubset,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::CircuitOpen => "circuit_open",
            RejectReason::Overflow => "overflow",
            RejectReason::NoMatchingSubset => "no_matching_subset",
        }
    }

    /// Status the proxy answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            RejectReason::CircuitOpen | RejectReason::Overflow => StatusCode::SERVICE_UNAVAILABLE,
            RejectReason::NoMatchingSubset => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of routing one request.
#[derive(Debug, Clone)]
pub enum Decision {
    Forward(Forward),
    Redirect { uri: String, status: StatusCode },
    Reject(RejectReason),
}

impl Decision {
    pub fn is_forward(&self) -> bool {
        matches!(self, Decision::Forward(_))
    }

    /// Status a client observes for non-forwarded decisions.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Decision::Forward(_) => None,
            Decision::Redirect { status, .. } => Some(*status),
            Decision::Reject(reason) => Some(reason.status()),
        }
    }

    pub fn subset(&self) -> Option<&str> {
        match self {
            Decision::Forward(forward) => Some(&forward.destination.subset),
            _ => None,
        }
    }
}
