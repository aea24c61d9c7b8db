//! Request routing and admission control.
//!
//! Matches requests against per-host rules, splits traffic between
//! subsets by weight and guards each subset with a circuit breaker.

mod breaker;
mod matcher;
mod router;
mod selector;

pub use breaker::{BreakerStats, CircuitBreaker, CircuitState};
pub use matcher::uri_matches;
pub use router::Router;
pub use selector::WeightedSelector;
