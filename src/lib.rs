//! Traffic routing decisions for service mesh sidecars.
//!
//! Given a host and a request, the [`Router`] decides whether to forward
//! it (and to which subset), answer with a redirect, or reject it. Rules
//! are swapped atomically at runtime while requests are being routed.

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod rules;
pub mod store;

pub use config::{load_config, HostConfig, RoutingConfig};
pub use error::{ConfigError, ValidationError};
pub use proxy::{CircuitBreaker, CircuitState, Router, WeightedSelector};
pub use rules::{
    CircuitBreakerPolicy, Decision, Destination, Forward, RejectReason, Request, Rule, RuleAction,
    RuleMatch, Subset, UriMatch, DEFAULT_SUBSET,
};
pub use store::{HostEntry, RuleTable};
