use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use arbiter_core::engine::Decision;

#[derive(Debug, Default)]
pub struct Metrics {
    request_total: AtomicU64,
    request_success: AtomicU64,
    request_error: AtomicU64,
    decisions_allowed: AtomicU64,
    decisions_denied: AtomicU64,
    request_timeouts: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.request_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.request_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.request_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision(&self, decision: Decision) {
        let counter = match decision {
            Decision::Allowed => &self.decisions_allowed,
            Decision::Denied => &self.decisions_denied,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_total(&self) -> u64 {
        self.request_total.load(Ordering::Relaxed)
    }

    pub fn request_success(&self) -> u64 {
        self.request_success.load(Ordering::Relaxed)
    }

    pub fn request_error(&self) -> u64 {
        self.request_error.load(Ordering::Relaxed)
    }

    pub fn decisions_allowed(&self) -> u64 {
        self.decisions_allowed.load(Ordering::Relaxed)
    }

    pub fn decisions_denied(&self) -> u64 {
        self.decisions_denied.load(Ordering::Relaxed)
    }

    pub fn request_timeouts(&self) -> u64 {
        self.request_timeouts.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition. `snapshot_refreshes` comes from the
    /// snapshot manager, which keeps its own counter.
    pub fn render_prometheus(&self, snapshot_refreshes: u64) -> String {
        let counters = [
            (
                "arbiter_requests_total",
                "Total number of requests.",
                self.request_total(),
            ),
            (
                "arbiter_requests_success_total",
                "Total successful requests.",
                self.request_success(),
            ),
            (
                "arbiter_requests_error_total",
                "Total failed requests.",
                self.request_error(),
            ),
            (
                "arbiter_decisions_allowed_total",
                "Check decisions that allowed access.",
                self.decisions_allowed(),
            ),
            (
                "arbiter_decisions_denied_total",
                "Check decisions that denied access.",
                self.decisions_denied(),
            ),
            (
                "arbiter_request_timeouts_total",
                "Requests that exceeded their deadline.",
                self.request_timeouts(),
            ),
            (
                "arbiter_snapshot_refreshes_total",
                "Snapshot tokens fetched from the store.",
                snapshot_refreshes,
            ),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {value}");
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_metrics_are_zero() {
        let m = Metrics::new();
        assert_eq!(m.request_total(), 0);
        assert_eq!(m.request_success(), 0);
        assert_eq!(m.request_error(), 0);
        assert_eq!(m.decisions_allowed(), 0);
    }

    #[test]
    fn record_increments_counters() {
        let m = Metrics::new();
        m.record_request();
        m.record_request();
        m.record_success();
        m.record_error();
        m.record_decision(Decision::Allowed);
        m.record_decision(Decision::Denied);
        m.record_decision(Decision::Denied);
        m.record_timeout();

        assert_eq!(m.request_total(), 2);
        assert_eq!(m.request_success(), 1);
        assert_eq!(m.request_error(), 1);
        assert_eq!(m.decisions_allowed(), 1);
        assert_eq!(m.decisions_denied(), 2);
        assert_eq!(m.request_timeouts(), 1);
    }

    #[test]
    fn prometheus_output_lists_every_counter() {
        let m = Metrics::new();
        m.record_request();
        m.record_decision(Decision::Allowed);

        let output = m.render_prometheus(7);

        assert!(output.contains("# TYPE arbiter_requests_total counter"));
        assert!(output.contains("arbiter_requests_total 1\n"));
        assert!(output.contains("arbiter_decisions_allowed_total 1\n"));
        assert!(output.contains("arbiter_decisions_denied_total 0\n"));
        assert!(output.contains("arbiter_snapshot_refreshes_total 7\n"));
    }
}
