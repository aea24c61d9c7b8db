//! Routing configuration files.
//!
//! A file lists hosts with their rules and subset declarations:
//!
//! ```yaml
//! hosts:
//!   - host: reviews
//!     subsets:
//!       - name: v1
//!       - name: v2
//!         circuit_breaker:
//!           max_pending_requests: 10
//!     rules:
//!       - action:
//!           weighted_route:
//!             destinations:
//!               - { subset: v1, weight: 20 }
//!               - { subset: v2, weight: 80 }
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::proxy::Router;
use crate::rules::{Rule, Subset};
use crate::store::HostEntry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub subsets: Vec<Subset>,
}

impl From<HostConfig> for HostEntry {
    fn from(config: HostConfig) -> Self {
        HostEntry {
            host: config.host,
            rules: config.rules,
            subsets: config.subsets,
        }
    }
}

impl RoutingConfig {
    pub fn into_entries(self) -> Vec<HostEntry> {
        self.hosts.into_iter().map(HostEntry::from).collect()
    }
}

/// Reads a routing configuration, choosing the format by file extension.
pub fn load_config(path: impl AsRef<Path>) -> Result<RoutingConfig, ConfigError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)?;
    match path.extension().and_then(|s| s.to_str()).unwrap_or("") {
        "json" => Ok(serde_json::from_str(&data)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(&data)?),
        _ => Err(ConfigError::UnsupportedFormat),
    }
}

impl Router {
    /// Replaces the whole routing configuration. Nothing changes if any
    /// host fails validation.
    pub fn apply_config(&self, config: &RoutingConfig) -> Result<u64, ConfigError> {
        self.apply(config.clone().into_entries())
            .map_err(|(host, source)| ConfigError::Validation { host, source })
    }
}
