//! Per-subset circuit breaking.
//!
//! Each destination subset has a small state machine:
//!
//! ```text
//! Closed -> Open:   consecutive failures reach the policy threshold
//! Open   -> Closed: base ejection time elapsed (checked on admit),
//!                   or the host's subsets are replaced
//! ```
//!
//! Admission is fail-fast: requests over the pending or connection
//! limit are rejected, never queued.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::metrics;
use crate::rules::{CircuitBreakerPolicy, Destination, Permit, RejectReason};

/// Circuit state of a subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

/// Point-in-time view of a subset's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub pending: u32,
    pub concurrent: u32,
    pub consecutive_errors: u32,
}

#[derive(Default)]
struct BreakerState {
    /// Unique per created state; never 0.
    generation: u64,
    pending: AtomicU32,
    concurrent: AtomicU32,
    consecutive_errors: AtomicU32,
    open: AtomicBool,
    /// Milliseconds since the breaker's epoch when the circuit opened.
    opened_at_ms: AtomicU64,
}

/// Tracks admission counters and circuit state per destination.
///
/// Thread-safe via DashMap and atomics. State is created lazily on the
/// first request to a destination.
pub struct CircuitBreaker {
    states: DashMap<Destination, Arc<BreakerState>>,
    generations: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    /// Creates a new CircuitBreaker with no tracked destinations.
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            generations: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Returns whether a request to `destination` is admitted.
    pub fn admit(&self, destination: &Destination, policy: Option<&CircuitBreakerPolicy>) -> bool {
        self.try_admit(destination, policy).is_ok()
    }

    /// Admits a request or explains why it was rejected.
    ///
    /// On success the pending and concurrent counters are incremented and
    /// the caller must report the outcome through [`release`](Self::release)
    /// with the returned permit.
    pub fn try_admit(
        &self,
        destination: &Destination,
        policy: Option<&CircuitBreakerPolicy>,
    ) -> Result<Permit, RejectReason> {
        let state = self.state_for(destination);

        if state.open.load(Ordering::Acquire) {
            let cooldown = policy.and_then(CircuitBreakerPolicy::base_ejection_time);
            match cooldown {
                Some(cooldown)
                    if self.now_ms().saturating_sub(state.opened_at_ms.load(Ordering::Acquire))
                        >= cooldown.as_millis() as u64 =>
                {
                    if state
                        .open
                        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        state.consecutive_errors.store(0, Ordering::Release);
                        tracing::info!(destination = %destination, "circuit closed after ejection time");
                    }
                }
                _ => return Err(RejectReason::CircuitOpen),
            }
        }

        let limits = policy.copied().unwrap_or_default();
        if !try_increment(&state.pending, limits.max_pending_requests) {
            return Err(RejectReason::Overflow);
        }
        if !try_increment(&state.concurrent, limits.max_connections) {
            saturating_decrement(&state.pending);
            return Err(RejectReason::Overflow);
        }
        Ok(Permit(state.generation))
    }

    /// Reports the outcome of an admitted request.
    ///
    /// Failures count towards the consecutive error threshold; a success
    /// resets it. Permits issued before the destination was reset or reaped
    /// are ignored.
    pub fn release(
        &self,
        destination: &Destination,
        permit: Permit,
        success: bool,
        policy: Option<&CircuitBreakerPolicy>,
    ) {
        let Some(state) = self.states.get(destination).map(|s| Arc::clone(s.value())) else {
            return;
        };
        if state.generation != permit.0 {
            tracing::trace!(destination = %destination, "stale release ignored");
            return;
        }

        saturating_decrement(&state.pending);
        saturating_decrement(&state.concurrent);

        if success {
            state.consecutive_errors.store(0, Ordering::Release);
            return;
        }

        let errors = state.consecutive_errors.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let threshold = policy.and_then(|p| p.consecutive_errors).filter(|&t| t > 0);
        if let Some(threshold) = threshold {
            if errors >= threshold {
                state.opened_at_ms.store(self.now_ms(), Ordering::Release);
                if !state.open.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        destination = %destination,
                        consecutive_errors = errors,
                        "circuit opened"
                    );
                    metrics::record_circuit_opened(&destination.subset);
                }
            }
        }
    }

    /// Returns the circuit state of a destination. Unknown destinations
    /// are closed.
    pub fn state(&self, destination: &Destination) -> CircuitState {
        self.stats(destination)
            .map(|s| s.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Returns the counters of a destination, if it has been seen.
    pub fn stats(&self, destination: &Destination) -> Option<BreakerStats> {
        self.states.get(destination).map(|entry| {
            let state = entry.value();
            BreakerStats {
                state: if state.open.load(Ordering::Acquire) {
                    CircuitState::Open
                } else {
                    CircuitState::Closed
                },
                pending: state.pending.load(Ordering::Acquire),
                concurrent: state.concurrent.load(Ordering::Acquire),
                consecutive_errors: state.consecutive_errors.load(Ordering::Acquire),
            }
        })
    }

    /// Returns the number of admitted requests not yet released.
    pub fn inflight(&self, destination: &Destination) -> u32 {
        self.stats(destination).map(|s| s.concurrent).unwrap_or(0)
    }

    /// Drops all state of a host; it is recreated closed and zeroed.
    pub fn reset_host(&self, host: &str) {
        self.states.retain(|destination, _| destination.host != host);
    }

    /// Drops the state of a host's subsets for which `keep` is false.
    pub fn retain_host(&self, host: &str, keep: impl Fn(&str) -> bool) {
        self.states
            .retain(|destination, _| destination.host != host || keep(&destination.subset));
    }

    /// Drops all state.
    pub fn clear(&self) {
        self.states.clear();
    }

    /// Returns the number of tracked destinations.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    fn state_for(&self, destination: &Destination) -> Arc<BreakerState> {
        if let Some(state) = self.states.get(destination) {
            return Arc::clone(state.value());
        }
        Arc::clone(
            self.states
                .entry(destination.clone())
                .or_insert_with(|| {
                    Arc::new(BreakerState {
                        generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
                        ..Default::default()
                    })
                })
                .value(),
        )
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Increments `counter` unless it already reached `limit`.
fn try_increment(counter: &AtomicU32, limit: Option<u32>) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match limit {
            Some(limit) if current >= limit => None,
            _ => current.checked_add(1),
        })
        .is_ok()
}

fn saturating_decrement(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        current.checked_sub(1)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn dest(subset: &str) -> Destination {
        Destination::new("ratings", subset)
    }

    fn limits(pending: Option<u32>, connections: Option<u32>) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            max_pending_requests: pending,
            max_connections: connections,
            ..Default::default()
        }
    }

    fn ejecting(errors: u32, ejection_ms: Option<u64>) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            consecutive_errors: Some(errors),
            base_ejection_time_ms: ejection_ms,
            ..Default::default()
        }
    }

    // ========== Admission Limits ==========

    #[test]
    fn test_no_policy_admits_everything() {
        let breaker = CircuitBreaker::new();
        for _ in 0..1_000 {
            assert!(breaker.admit(&dest("v1"), None));
        }
        assert_eq!(breaker.stats(&dest("v1")).unwrap().concurrent, 1_000);
    }

    #[test]
    fn test_zero_pending_limit_rejects_everything() {
        let breaker = CircuitBreaker::new();
        let policy = limits(Some(0), None);
        for _ in 0..100 {
            assert_eq!(
                breaker.try_admit(&dest("v1"), Some(&policy)),
                Err(RejectReason::Overflow)
            );
        }
        let stats = breaker.stats(&dest("v1")).unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.concurrent, 0);
    }

    #[test]
    fn test_reject_all_policy() {
        let breaker = CircuitBreaker::new();
        let policy = CircuitBreakerPolicy::reject_all();
        assert!(!breaker.admit(&dest("v1"), Some(&policy)));
    }

    #[test]
    fn test_connection_limit_rolls_back_pending() {
        let breaker = CircuitBreaker::new();
        let policy = limits(Some(10), Some(1));

        assert!(breaker.admit(&dest("v1"), Some(&policy)));
        assert!(!breaker.admit(&dest("v1"), Some(&policy)));

        let stats = breaker.stats(&dest("v1")).unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.concurrent, 1);
    }

    #[test]
    fn test_release_frees_capacity() {
        let breaker = CircuitBreaker::new();
        let policy = limits(Some(1), Some(1));

        let permit = breaker.try_admit(&dest("v1"), Some(&policy)).unwrap();
        assert!(!breaker.admit(&dest("v1"), Some(&policy)));
        assert_eq!(breaker.inflight(&dest("v1")), 1);
        breaker.release(&dest("v1"), permit, true, Some(&policy));
        assert_eq!(breaker.inflight(&dest("v1")), 0);
        assert!(breaker.admit(&dest("v1"), Some(&policy)));
        assert_eq!(breaker.inflight(&dest("v2")), 0);
    }

    #[test]
    fn test_release_never_underflows() {
        let breaker = CircuitBreaker::new();
        let permit = breaker.try_admit(&dest("v1"), None).unwrap();
        breaker.release(&dest("v1"), permit, true, None);
        breaker.release(&dest("v1"), permit, true, None);
        let stats = breaker.stats(&dest("v1")).unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.concurrent, 0);
    }

    #[test]
    fn test_destinations_are_independent() {
        let breaker = CircuitBreaker::new();
        let policy = limits(Some(1), None);
        assert!(breaker.admit(&dest("v1"), Some(&policy)));
        assert!(breaker.admit(&dest("v2"), Some(&policy)));
        assert!(breaker.admit(&Destination::new("reviews", "v1"), Some(&policy)));
    }

    // ========== Consecutive Errors ==========

    #[test]
    fn test_threshold_failures_open_circuit() {
        let breaker = CircuitBreaker::new();
        let policy = ejecting(3, None);

        for _ in 0..3 {
            let permit = breaker.try_admit(&dest("v1"), Some(&policy)).unwrap();
            breaker.release(&dest("v1"), permit, false, Some(&policy));
        }

        assert_eq!(breaker.state(&dest("v1")), CircuitState::Open);
        assert_eq!(
            breaker.try_admit(&dest("v1"), Some(&policy)),
            Err(RejectReason::CircuitOpen)
        );
    }

    #[test]
    fn test_success_resets_error_count() {
        let breaker = CircuitBreaker::new();
        let policy = ejecting(3, None);

        for success in [false, false, true, false, false] {
            let permit = breaker.try_admit(&dest("v1"), Some(&policy)).unwrap();
            breaker.release(&dest("v1"), permit, success, Some(&policy));
        }

        assert_eq!(breaker.state(&dest("v1")), CircuitState::Closed);
        assert_eq!(breaker.stats(&dest("v1")).unwrap().consecutive_errors, 2);
    }

    #[test]
    fn test_zero_threshold_never_opens() {
        let breaker = CircuitBreaker::new();
        let policy = ejecting(0, None);
        for _ in 0..10 {
            let permit = breaker.try_admit(&dest("v1"), Some(&policy)).unwrap();
            breaker.release(&dest("v1"), permit, false, Some(&policy));
        }
        assert_eq!(breaker.state(&dest("v1")), CircuitState::Closed);
    }

    #[test]
    fn test_open_circuit_closes_after_ejection_time() {
        let breaker = CircuitBreaker::new();
        let policy = ejecting(1, Some(20));

        let permit = breaker.try_admit(&dest("v1"), Some(&policy)).unwrap();
        breaker.release(&dest("v1"), permit, false, Some(&policy));
        assert!(!breaker.admit(&dest("v1"), Some(&policy)));

        thread::sleep(Duration::from_millis(40));

        assert!(breaker.admit(&dest("v1"), Some(&policy)));
        let stats = breaker.stats(&dest("v1")).unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_errors, 0);
    }

    #[test]
    fn test_open_circuit_without_ejection_time_stays_open() {
        let breaker = CircuitBreaker::new();
        let policy = ejecting(1, None);

        let permit = breaker.try_admit(&dest("v1"), Some(&policy)).unwrap();
        breaker.release(&dest("v1"), permit, false, Some(&policy));
        thread::sleep(Duration::from_millis(10));

        assert!(!breaker.admit(&dest("v1"), Some(&policy)));
    }

    // ========== Lifecycle ==========

    #[test]
    fn test_reset_host_closes_circuit() {
        let breaker = CircuitBreaker::new();
        let policy = ejecting(1, None);
        let permit = breaker.try_admit(&dest("v1"), Some(&policy)).unwrap();
        breaker.release(&dest("v1"), permit, false, Some(&policy));
        assert_eq!(breaker.state(&dest("v1")), CircuitState::Open);

        breaker.reset_host("ratings");

        assert!(breaker.stats(&dest("v1")).is_none());
        assert!(breaker.admit(&dest("v1"), Some(&policy)));
    }

    #[test]
    fn test_retain_host_reaps_only_that_host() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.admit(&dest("v1"), None));
        assert!(breaker.admit(&dest("v2"), None));
        assert!(breaker.admit(&Destination::new("reviews", "v2"), None));

        breaker.retain_host("ratings", |subset| subset == "v1");

        assert!(breaker.stats(&dest("v1")).is_some());
        assert!(breaker.stats(&dest("v2")).is_none());
        assert!(breaker.stats(&Destination::new("reviews", "v2")).is_some());
        assert_eq!(breaker.tracked(), 2);
    }

    #[test]
    fn test_release_for_reaped_destination_is_ignored() {
        let breaker = CircuitBreaker::new();
        let permit = breaker.try_admit(&dest("v1"), None).unwrap();
        breaker.reset_host("ratings");
        breaker.release(&dest("v1"), permit, false, None);
        assert!(breaker.stats(&dest("v1")).is_none());
    }

    #[test]
    fn test_release_after_reset_leaves_new_counters_alone() {
        let breaker = CircuitBreaker::new();
        let policy = limits(Some(1), Some(1));

        let old = breaker.try_admit(&dest("v1"), Some(&policy)).unwrap();
        breaker.reset_host("ratings");
        let current = breaker.try_admit(&dest("v1"), Some(&policy)).unwrap();
        assert_ne!(old, current);

        breaker.release(&dest("v1"), old, false, Some(&policy));

        assert_eq!(breaker.inflight(&dest("v1")), 1);
        assert_eq!(breaker.stats(&dest("v1")).unwrap().consecutive_errors, 0);
        assert!(!breaker.admit(&dest("v1"), Some(&policy)));

        breaker.release(&dest("v1"), current, true, Some(&policy));
        assert!(breaker.admit(&dest("v1"), Some(&policy)));
    }

    #[test]
    fn test_untracked_permit_release_is_ignored() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.admit(&dest("v1"), None));
        breaker.release(&dest("v1"), Permit::UNTRACKED, true, None);
        assert_eq!(breaker.inflight(&dest("v1")), 1);
    }

    // ========== Thread Safety ==========

    #[test]
    fn test_concurrent_admit_never_exceeds_limit() {
        let breaker = Arc::new(CircuitBreaker::new());
        let policy = limits(Some(50), Some(50));
        let mut handles = vec![];

        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            handles.push(thread::spawn(move || {
                (0..100)
                    .filter(|_| breaker.admit(&dest("v1"), Some(&policy)))
                    .count()
            }));
        }

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
        assert_eq!(breaker.stats(&dest("v1")).unwrap().concurrent, 50);
    }

    #[test]
    fn test_concurrent_admit_release_no_lost_updates() {
        let breaker = Arc::new(CircuitBreaker::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let permit = breaker.try_admit(&dest("v1"), None).unwrap();
                    breaker.release(&dest("v1"), permit, true, None);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = breaker.stats(&dest("v1")).unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.concurrent, 0);
    }

    #[test]
    fn test_breaker_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CircuitBreaker>();
    }
}
