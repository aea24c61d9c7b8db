//! Error types for configuration intake.
//!
//! Per-request failures never surface here: they become
//! [`Decision::Reject`](crate::rules::Decision::Reject) values.

use thiserror::Error;

/// A rule list or subset declaration that cannot be applied.
///
/// Returned synchronously to the configuration caller. The previously
/// applied configuration stays in effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("host name is empty")]
    EmptyHost,

    #[error("rule {rule}: weighted route has no destinations")]
    NoDestinations { rule: String },

    #[error("rule {rule}: weights sum to {sum}, expected 100")]
    WeightSum { rule: String, sum: u64 },

    #[error("rule {rule}: destination subset name is empty")]
    EmptyDestination { rule: String },

    #[error("rule {rule}: subset '{subset}' listed more than once")]
    DuplicateDestination { rule: String, subset: String },

    #[error("rule {rule}: redirect uri is empty")]
    EmptyRedirect { rule: String },

    #[error("rule {rule}: redirect code {code} is not a 3xx status")]
    InvalidRedirectCode { rule: String, code: u16 },

    #[error("rule {rule}: header_add has no headers")]
    EmptyHeaderAdd { rule: String },

    #[error("rule {rule}: invalid header name '{name}'")]
    InvalidHeaderName { rule: String, name: String },

    #[error("rule {rule}: invalid value for header '{name}'")]
    InvalidHeaderValue { rule: String, name: String },

    #[error("subset name is empty")]
    EmptySubset,

    #[error("subset '{0}' declared more than once")]
    DuplicateSubset(String),
}

/// Failure loading a routing configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config format")]
    UnsupportedFormat,
    #[error("host '{host}': {source}")]
    Validation {
        host: String,
        #[source]
        source: ValidationError,
    },
}
