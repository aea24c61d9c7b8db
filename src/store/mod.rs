//! Rule storage for the router.
//!
//! Holds validated, compiled per-host rule snapshots received from
//! the configuration collaborator.

mod compiled;
mod rule_table;

pub(crate) use compiled::{CompiledAction, CompiledMatch, CompiledRule};
pub use compiled::{WeightedRoute, TOTAL_WEIGHT};
pub use rule_table::{normalize_host, HostEntry, HostRules, RuleTable};
