//! Per-host rule storage using atomically swapped snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::compiled::{compile_rules, compile_subsets, CompiledAction, CompiledRule};
use crate::error::ValidationError;
use crate::rules::{CircuitBreakerPolicy, Rule, Subset, DEFAULT_SUBSET};

/// Immutable configuration of one host.
///
/// Readers hold an `Arc` to a snapshot for the duration of a request,
/// so they never see a half-applied update.
#[derive(Debug, Default)]
pub struct HostRules {
    rules: Vec<Rule>,
    compiled: Vec<CompiledRule>,
    subsets: Vec<Subset>,
    declared: HashMap<String, Option<CircuitBreakerPolicy>>,
}

impl HostRules {
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn subsets(&self) -> &[Subset] {
        &self.subsets
    }

    /// Whether traffic may be sent to `subset`. The default subset
    /// is always routable.
    pub fn is_declared(&self, subset: &str) -> bool {
        subset == DEFAULT_SUBSET || self.declared.contains_key(subset)
    }

    pub fn policy(&self, subset: &str) -> Option<&CircuitBreakerPolicy> {
        self.declared.get(subset).and_then(Option::as_ref)
    }

    /// Every subset this host's configuration can direct traffic to.
    pub fn referenced_subsets(&self) -> impl Iterator<Item = &str> {
        let routed = self
            .compiled
            .iter()
            .filter_map(|rule| match &rule.action {
                CompiledAction::WeightedRoute(route) => Some(route.subsets()),
                _ => None,
            })
            .flatten();
        std::iter::once(DEFAULT_SUBSET)
            .chain(self.declared.keys().map(String::as_str))
            .chain(routed)
    }

    pub(crate) fn compiled(&self) -> &[CompiledRule] {
        &self.compiled
    }

    fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.subsets.is_empty()
    }
}

/// Full configuration for one host, as applied by a full sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEntry {
    pub host: String,
    pub rules: Vec<Rule>,
    pub subsets: Vec<Subset>,
}

type Table = HashMap<String, Arc<HostRules>>;

/// Thread-safe storage of routing rules keyed by normalized host.
///
/// Reads load the current table through `ArcSwap` without locking.
/// Writes are serialized by a mutex and publish a new table; the
/// version counter increases with every applied change.
pub struct RuleTable {
    hosts: ArcSwap<Table>,
    write_lock: Mutex<()>,
    version: AtomicU64,
}

impl RuleTable {
    /// Creates a new empty rule table.
    pub fn new() -> Self {
        Self {
            hosts: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            version: AtomicU64::new(0),
        }
    }

    /// Replaces the ordered rule list of a host.
    ///
    /// On a validation error nothing changes. Returns the new version.
    pub fn set_rules(&self, host: &str, rules: Vec<Rule>) -> Result<u64, ValidationError> {
        let host = normalize_host(host)?;
        let compiled = compile_rules(&rules)?;
        Ok(self.update_host(host, |current| HostRules {
            rules,
            compiled,
            subsets: current.subsets.clone(),
            declared: current.declared.clone(),
        }))
    }

    /// Returns the ordered rule list of a host, empty if unknown.
    pub fn get_rules(&self, host: &str) -> Vec<Rule> {
        self.snapshot(host)
            .map(|entry| entry.rules.clone())
            .unwrap_or_default()
    }

    /// Clears the rule list of a host. Subset declarations are kept.
    pub fn remove_rules(&self, host: &str) -> u64 {
        let Ok(host) = normalize_host(host) else {
            return self.version();
        };
        self.update_host(host, |current| HostRules {
            rules: Vec::new(),
            compiled: Vec::new(),
            subsets: current.subsets.clone(),
            declared: current.declared.clone(),
        })
    }

    /// Replaces the subset declarations (and their circuit breaker
    /// policies) of a host.
    pub fn set_subsets(&self, host: &str, subsets: Vec<Subset>) -> Result<u64, ValidationError> {
        let host = normalize_host(host)?;
        let declared = compile_subsets(&subsets)?;
        Ok(self.update_host(host, |current| HostRules {
            rules: current.rules.clone(),
            compiled: current.compiled.clone(),
            subsets,
            declared,
        }))
    }

    /// Returns the subset declarations of a host, empty if unknown.
    pub fn get_subsets(&self, host: &str) -> Vec<Subset> {
        self.snapshot(host)
            .map(|entry| entry.subsets.clone())
            .unwrap_or_default()
    }

    /// Clears the subset declarations of a host.
    pub fn remove_subsets(&self, host: &str) -> u64 {
        let Ok(host) = normalize_host(host) else {
            return self.version();
        };
        self.update_host(host, |current| HostRules {
            rules: current.rules.clone(),
            compiled: current.compiled.clone(),
            subsets: Vec::new(),
            declared: HashMap::new(),
        })
    }

    /// Replaces the whole table with a full sync.
    ///
    /// Every entry is validated before anything is published; one bad
    /// entry leaves the table untouched. Later entries for the same host
    /// win.
    pub fn replace_all(&self, entries: Vec<HostEntry>) -> Result<u64, (String, ValidationError)> {
        let mut table = Table::with_capacity(entries.len());
        for entry in entries {
            let host = normalize_host(&entry.host).map_err(|e| (entry.host.clone(), e))?;
            let compiled = compile_rules(&entry.rules).map_err(|e| (host.clone(), e))?;
            let declared = compile_subsets(&entry.subsets).map_err(|e| (host.clone(), e))?;
            table.insert(
                host,
                Arc::new(HostRules {
                    rules: entry.rules,
                    compiled,
                    subsets: entry.subsets,
                    declared,
                }),
            );
        }

        let _guard = self.write_lock.lock();
        self.hosts.store(Arc::new(table));
        Ok(self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Returns the current snapshot of a host.
    pub fn snapshot(&self, host: &str) -> Option<Arc<HostRules>> {
        let host = normalize_host(host).ok()?;
        self.hosts.load().get(&host).cloned()
    }

    /// Returns the current configuration version.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Returns the number of hosts with any configuration.
    pub fn host_count(&self) -> usize {
        self.hosts.load().len()
    }

    /// Publishes a new snapshot for `host` derived from its current one.
    fn update_host(&self, host: String, build: impl FnOnce(&HostRules) -> HostRules) -> u64 {
        let _guard = self.write_lock.lock();

        let current = self.hosts.load_full();
        let empty = HostRules::default();
        let next = build(current.get(&host).map(Arc::as_ref).unwrap_or(&empty));
        if next.is_empty() && !current.contains_key(&host) {
            return self.version.load(Ordering::SeqCst);
        }

        let mut table = Table::clone(&current);
        if next.is_empty() {
            table.remove(&host);
        } else {
            table.insert(host, Arc::new(next));
        }
        self.hosts.store(Arc::new(table));

        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalizes a host name: lowercase and strip port.
pub fn normalize_host(host: &str) -> Result<String, ValidationError> {
    let name = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyHost);
    }
    Ok(name.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{CircuitBreakerPolicy, RuleMatch};

    fn split(a: u32, b: u32) -> Rule {
        Rule::weighted([("v1", a), ("v2", b)])
    }

    #[test]
    fn test_new_table_empty() {
        let table = RuleTable::new();
        assert_eq!(table.version(), 0);
        assert_eq!(table.host_count(), 0);
        assert!(table.get_rules("reviews").is_empty());
        assert!(table.snapshot("reviews").is_none());
    }

    #[test]
    fn test_set_rules_success() {
        let table = RuleTable::new();
        let rules = vec![Rule::redirect("/new/path").when(RuleMatch::uri_exact("/"))];

        let version = table.set_rules("reviews", rules.clone()).unwrap();

        assert_eq!(version, 1);
        assert_eq!(table.version(), 1);
        assert_eq!(table.get_rules("reviews"), rules);
    }

    #[test]
    fn test_set_rules_replaces_whole_list() {
        let table = RuleTable::new();
        table
            .set_rules("reviews", vec![Rule::redirect("/a"), Rule::redirect("/b")])
            .unwrap();
        table.set_rules("reviews", vec![Rule::redirect("/c")]).unwrap();

        assert_eq!(table.get_rules("reviews"), vec![Rule::redirect("/c")]);
        assert_eq!(table.version(), 2);
    }

    #[test]
    fn test_invalid_rules_keep_previous_list() {
        let table = RuleTable::new();
        table.set_rules("reviews", vec![split(20, 80)]).unwrap();
        let before = table.get_rules("reviews");

        let err = table.set_rules("reviews", vec![split(20, 70)]).unwrap_err();

        assert!(matches!(err, ValidationError::WeightSum { sum: 90, .. }));
        assert_eq!(table.get_rules("reviews"), before);
        assert_eq!(table.version(), 1);
    }

    #[test]
    fn test_remove_rules_keeps_subsets() {
        let table = RuleTable::new();
        table.set_rules("reviews", vec![split(50, 50)]).unwrap();
        table
            .set_subsets("reviews", vec![Subset::new("v1"), Subset::new("v2")])
            .unwrap();

        table.remove_rules("reviews");

        assert!(table.get_rules("reviews").is_empty());
        assert_eq!(table.get_subsets("reviews").len(), 2);
    }

    #[test]
    fn test_removing_everything_drops_host() {
        let table = RuleTable::new();
        table.set_rules("reviews", vec![split(50, 50)]).unwrap();
        assert_eq!(table.host_count(), 1);

        table.remove_rules("reviews");

        assert_eq!(table.host_count(), 0);
    }

    #[test]
    fn test_host_names_are_normalized() {
        let table = RuleTable::new();
        table.set_rules("Reviews.Default:9080", vec![split(50, 50)]).unwrap();

        assert_eq!(table.get_rules("reviews.default").len(), 1);
        assert_eq!(table.get_rules("REVIEWS.DEFAULT:80").len(), 1);
    }

    #[test]
    fn test_empty_host_rejected() {
        let table = RuleTable::new();
        assert_eq!(
            table.set_rules("", vec![]).unwrap_err(),
            ValidationError::EmptyHost
        );
        assert_eq!(table.version(), 0);
    }

    #[test]
    fn test_subset_policies() {
        let table = RuleTable::new();
        table
            .set_subsets(
                "ratings",
                vec![
                    Subset::new("v1").with_circuit_breaker(CircuitBreakerPolicy::reject_all()),
                    Subset::new("v2"),
                ],
            )
            .unwrap();

        let snapshot = table.snapshot("ratings").unwrap();
        assert!(snapshot.is_declared("v1"));
        assert!(snapshot.is_declared("v2"));
        assert!(snapshot.is_declared(DEFAULT_SUBSET));
        assert!(!snapshot.is_declared("v3"));
        assert_eq!(snapshot.policy("v1"), Some(&CircuitBreakerPolicy::reject_all()));
        assert_eq!(snapshot.policy("v2"), None);
    }

    #[test]
    fn test_replace_all_is_all_or_nothing() {
        let table = RuleTable::new();
        table.set_rules("keep", vec![split(50, 50)]).unwrap();

        let result = table.replace_all(vec![
            HostEntry {
                host: "a".into(),
                rules: vec![split(20, 80)],
                subsets: vec![],
            },
            HostEntry {
                host: "b".into(),
                rules: vec![split(20, 20)],
                subsets: vec![],
            },
        ]);

        let (host, err) = result.unwrap_err();
        assert_eq!(host, "b");
        assert!(matches!(err, ValidationError::WeightSum { sum: 40, .. }));
        assert_eq!(table.get_rules("keep").len(), 1);
        assert!(table.get_rules("a").is_empty());
    }

    #[test]
    fn test_replace_all_drops_unlisted_hosts() {
        let table = RuleTable::new();
        table.set_rules("old", vec![split(50, 50)]).unwrap();

        table
            .replace_all(vec![HostEntry {
                host: "new".into(),
                rules: vec![split(20, 80)],
                subsets: vec![],
            }])
            .unwrap();

        assert!(table.get_rules("old").is_empty());
        assert_eq!(table.get_rules("new").len(), 1);
        assert_eq!(table.version(), 2);
    }

    #[test]
    fn test_referenced_subsets() {
        let table = RuleTable::new();
        table.set_rules("reviews", vec![split(50, 50)]).unwrap();
        table.set_subsets("reviews", vec![Subset::new("v3")]).unwrap();

        let snapshot = table.snapshot("reviews").unwrap();
        let mut referenced: Vec<&str> = snapshot.referenced_subsets().collect();
        referenced.sort_unstable();
        referenced.dedup();
        assert_eq!(referenced, vec!["default", "v1", "v2", "v3"]);
    }

    #[test]
    fn test_readers_see_whole_lists_during_updates() {
        use std::thread;

        let table = Arc::new(RuleTable::new());
        table
            .set_rules("reviews", vec![Rule::redirect("/a"), Rule::redirect("/a")])
            .unwrap();

        let mut handles = vec![];
        for i in 0..4 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for n in 0..200 {
                    let len = if (i + n) % 2 == 0 { 2 } else { 3 };
                    let rules = vec![Rule::redirect(format!("/{}", n)); len];
                    table.set_rules("reviews", rules).unwrap();
                }
            }));
        }
        for _ in 0..4 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let rules = table.get_rules("reviews");
                    assert!(rules.len() == 2 || rules.len() == 3);
                    // every list is written with one uri throughout
                    assert!(rules.windows(2).all(|w| w[0] == w[1]));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.version(), 1 + 4 * 200);
    }

    #[test]
    fn test_removing_from_unknown_host_keeps_version() {
        let table = RuleTable::new();
        assert_eq!(table.remove_rules("ghost"), 0);
        assert_eq!(table.remove_subsets("ghost"), 0);
        assert_eq!(table.version(), 0);

        table.set_rules("reviews", vec![split(50, 50)]).unwrap();
        assert_eq!(table.remove_rules("ghost"), 1);
        assert_eq!(table.version(), 1);
    }

    #[test]
    fn test_default_impl() {
        let table = RuleTable::default();
        assert_eq!(table.version(), 0);
        assert_eq!(table.host_count(), 0);
    }
}
