//! Routing metrics.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, e.g. with [`init_prometheus`].

use std::net::SocketAddr;

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize Prometheus metrics exporter.
///
/// Starts an HTTP listener on the given address to expose metrics.
pub fn init_prometheus(listen: &str) -> Result<(), String> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| format!("invalid metrics listen address: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {}", e))?;

    Ok(())
}

// ============================================================================
// Metric Names
// ============================================================================

/// Requests that matched a rule, by host and rule label.
pub const REQUESTS_MATCHED: &str = "requests_matched";
/// Requests admitted for forwarding, by subset.
pub const REQUESTS_FORWARDED: &str = "requests_forwarded";
/// Requests rejected, by subset and reason.
pub const REQUESTS_REJECTED: &str = "requests_rejected";
/// Requests answered with a redirect, by host.
pub const REQUESTS_REDIRECTED: &str = "requests_redirected";
/// Circuit transitions from closed to open, by subset.
pub const CIRCUIT_BREAKER_OPENED: &str = "circuit_breaker_opened";

// ============================================================================
// Metric Recording Functions
// ============================================================================

#[inline]
pub fn record_matched(host: &str, rule: &str) {
    counter!(REQUESTS_MATCHED, "host" => host.to_owned(), "rule" => rule.to_owned()).increment(1);
}

#[inline]
pub fn record_forwarded(subset: &str) {
    counter!(REQUESTS_FORWARDED, "subset" => subset.to_owned()).increment(1);
}

#[inline]
pub fn record_rejected(subset: &str, reason: &'static str) {
    counter!(REQUESTS_REJECTED, "subset" => subset.to_owned(), "reason" => reason).increment(1);
}

#[inline]
pub fn record_redirected(host: &str) {
    counter!(REQUESTS_REDIRECTED, "host" => host.to_owned()).increment(1);
}

#[inline]
pub fn record_circuit_opened(subset: &str) {
    counter!(CIRCUIT_BREAKER_OPENED, "subset" => subset.to_owned()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_matched("reviews", "rule-0");
        record_forwarded("v1");
        record_rejected("v1", "overflow");
        record_redirected("reviews");
        record_circuit_opened("v1");
    }

    #[test]
    fn test_init_prometheus_rejects_bad_address() {
        let err = init_prometheus("not-an-address").unwrap_err();
        assert!(err.contains("invalid metrics listen address"));
    }
}
