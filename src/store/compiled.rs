//! Validation and compilation of rule lists.
//!
//! Rules arrive as plain strings. Compiling parses header names and
//! values once and turns weighted splits into prefix-sum tables, so
//! nothing on the request path can fail on malformed configuration.

use std::collections::{HashMap, HashSet};

use http::{HeaderName, HeaderValue, StatusCode};

use crate::error::ValidationError;
use crate::rules::{
    CircuitBreakerPolicy, Rule, RuleAction, RuleMatch, Subset, UriMatch, WeightedDestination,
};

/// Total weight every split must add up to.
pub const TOTAL_WEIGHT: u32 = 100;

/// A validated rule ready for evaluation.
#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub label: String,
    pub predicate: Option<CompiledMatch>,
    pub action: CompiledAction,
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledMatch {
    pub uri: Option<UriMatch>,
    pub headers: Vec<(HeaderName, String)>,
}

#[derive(Debug, Clone)]
pub(crate) enum CompiledAction {
    HeaderAdd(Vec<(HeaderName, HeaderValue)>),
    Redirect { uri: String, status: StatusCode },
    WeightedRoute(WeightedRoute),
}

/// A weighted split compiled to cumulative upper bounds.
///
/// `bounds[i]` is the exclusive end of destination `i`'s interval in
/// `[0, 100)`. Zero-weight destinations get an empty interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedRoute {
    subsets: Vec<String>,
    bounds: Vec<u32>,
}

impl WeightedRoute {
    /// Builds the prefix-sum table, rejecting splits that do not total 100.
    pub fn new(destinations: &[WeightedDestination], rule: &str) -> Result<Self, ValidationError> {
        if destinations.is_empty() {
            return Err(ValidationError::NoDestinations { rule: rule.into() });
        }

        let mut seen = HashSet::new();
        for d in destinations {
            if d.subset.trim().is_empty() {
                return Err(ValidationError::EmptyDestination { rule: rule.into() });
            }
            if !seen.insert(d.subset.as_str()) {
                return Err(ValidationError::DuplicateDestination {
                    rule: rule.into(),
                    subset: d.subset.clone(),
                });
            }
        }

        // u64 so that absurd weights cannot wrap around to 100
        let sum: u64 = destinations.iter().map(|d| u64::from(d.weight)).sum();
        if sum != u64::from(TOTAL_WEIGHT) {
            return Err(ValidationError::WeightSum {
                rule: rule.into(),
                sum,
            });
        }

        let mut acc = 0;
        let bounds = destinations
            .iter()
            .map(|d| {
                acc += d.weight;
                acc
            })
            .collect();

        Ok(Self {
            subsets: destinations.iter().map(|d| d.subset.clone()).collect(),
            bounds,
        })
    }

    /// Returns the subset whose interval contains `draw`.
    ///
    /// `draw` must be below [`TOTAL_WEIGHT`]; larger values clamp to the
    /// last non-empty interval.
    pub fn pick(&self, draw: u32) -> &str {
        let idx = self.bounds.partition_point(|&bound| bound <= draw);
        match self.subsets.get(idx) {
            Some(subset) => subset,
            None => self.last_non_empty(),
        }
    }

    pub fn subsets(&self) -> impl Iterator<Item = &str> {
        self.subsets.iter().map(String::as_str)
    }

    fn last_non_empty(&self) -> &str {
        let mut prev = 0;
        let mut last = 0;
        for (i, &bound) in self.bounds.iter().enumerate() {
            if bound > prev {
                last = i;
            }
            prev = bound;
        }
        &self.subsets[last]
    }
}

/// Validates and compiles an ordered rule list.
pub(crate) fn compile_rules(rules: &[Rule]) -> Result<Vec<CompiledRule>, ValidationError> {
    rules
        .iter()
        .enumerate()
        .map(|(index, rule)| compile_rule(index, rule))
        .collect()
}

fn compile_rule(index: usize, rule: &Rule) -> Result<CompiledRule, ValidationError> {
    let label = if rule.name.is_empty() {
        format!("rule-{}", index)
    } else {
        rule.name.clone()
    };

    let predicate = rule
        .predicate
        .as_ref()
        .map(|m| compile_match(m, &label))
        .transpose()?;

    let action = match &rule.action {
        RuleAction::HeaderAdd { add } => {
            if add.is_empty() {
                return Err(ValidationError::EmptyHeaderAdd { rule: label });
            }
            let headers = add
                .iter()
                .map(|(name, value)| {
                    let header_name = parse_header_name(name, &label)?;
                    let header_value = HeaderValue::from_str(value).map_err(|_| {
                        ValidationError::InvalidHeaderValue {
                            rule: label.clone(),
                            name: name.clone(),
                        }
                    })?;
                    Ok((header_name, header_value))
                })
                .collect::<Result<Vec<_>, ValidationError>>()?;
            CompiledAction::HeaderAdd(headers)
        }
        RuleAction::Redirect { uri, code } => {
            if uri.trim().is_empty() {
                return Err(ValidationError::EmptyRedirect { rule: label });
            }
            let status = match code {
                None => StatusCode::MOVED_PERMANENTLY,
                Some(code) => StatusCode::from_u16(*code)
                    .ok()
                    .filter(StatusCode::is_redirection)
                    .ok_or(ValidationError::InvalidRedirectCode {
                        rule: label.clone(),
                        code: *code,
                    })?,
            };
            CompiledAction::Redirect {
                uri: uri.clone(),
                status,
            }
        }
        RuleAction::WeightedRoute { destinations } => {
            CompiledAction::WeightedRoute(WeightedRoute::new(destinations, &label)?)
        }
    };

    Ok(CompiledRule {
        label,
        predicate,
        action,
    })
}

fn compile_match(m: &RuleMatch, label: &str) -> Result<CompiledMatch, ValidationError> {
    let headers = m
        .headers
        .iter()
        .map(|h| Ok((parse_header_name(&h.name, label)?, h.exact.clone())))
        .collect::<Result<Vec<_>, ValidationError>>()?;

    Ok(CompiledMatch {
        uri: m.uri.clone(),
        headers,
    })
}

fn parse_header_name(name: &str, label: &str) -> Result<HeaderName, ValidationError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| ValidationError::InvalidHeaderName {
        rule: label.to_string(),
        name: name.to_string(),
    })
}

/// Validates subset declarations and indexes their policies by name.
pub(crate) fn compile_subsets(
    subsets: &[Subset],
) -> Result<HashMap<String, Option<CircuitBreakerPolicy>>, ValidationError> {
    let mut declared = HashMap::with_capacity(subsets.len());
    for subset in subsets {
        if subset.name.trim().is_empty() {
            return Err(ValidationError::EmptySubset);
        }
        if declared
            .insert(subset.name.clone(), subset.circuit_breaker)
            .is_some()
        {
            return Err(ValidationError::DuplicateSubset(subset.name.clone()));
        }
    }
    Ok(declared)
}
