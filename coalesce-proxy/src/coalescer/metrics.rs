//! Metrics for the request coalescer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics for monitoring coalescer behaviour
#[derive(Debug, Default)]
pub struct CoalescerMetrics {
    /// Requests that reached the coalescing middleware
    pub requests_received: AtomicU64,

    /// Requests forwarded without coalescing (method not coalescible)
    pub requests_bypassed: AtomicU64,

    /// Requests rejected because no key could be derived
    pub requests_rejected: AtomicU64,

    /// Callers that joined an existing group
    pub requests_coalesced: AtomicU64,

    /// Callers whose wait deadline expired
    pub requests_timed_out: AtomicU64,

    /// Groups created
    pub groups_created: AtomicU64,

    /// Groups handed to the dispatcher
    pub groups_dispatched: AtomicU64,

    /// Groups drained with no live waiter
    pub empty_dispatches: AtomicU64,

    /// Flush ticks executed
    pub flush_ticks: AtomicU64,

    /// Upstream invocations
    pub upstream_calls: AtomicU64,

    /// Upstream invocations that failed or panicked
    pub upstream_failures: AtomicU64,

    /// Total upstream time in milliseconds (for averaging)
    pub total_upstream_ms: AtomicU64,

    /// Results delivered to waiters
    pub deliveries: AtomicU64,

    /// Waiters that went away before delivery
    pub waiters_abandoned: AtomicU64,

    /// Largest fan-out seen for a single group
    pub max_fanout: AtomicU64,
}

impl CoalescerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypassed(&self) {
        self.requests_bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a caller registering; `created` is true when it opened a new group
    pub fn record_registered(&self, created: bool) {
        if created {
            self.groups_created.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tick(&self) {
        self.flush_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a group leaving the registry for dispatch
    pub fn record_dispatched(&self, waiters: usize) {
        self.groups_dispatched.fetch_add(1, Ordering::Relaxed);
        if waiters == 0 {
            self.empty_dispatches.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let waiters = waiters as u64;
        let mut current_max = self.max_fanout.load(Ordering::Relaxed);
        while waiters > current_max {
            match self.max_fanout.compare_exchange_weak(
                current_max,
                waiters,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    /// Record one upstream invocation
    pub fn record_upstream(&self, elapsed: Duration, failed: bool) {
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        self.total_upstream_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        if failed {
            self.upstream_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_delivered(&self, delivered: usize, abandoned: usize) {
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.waiters_abandoned.fetch_add(abandoned as u64, Ordering::Relaxed);
    }

    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::Relaxed)
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    /// Average number of callers served per upstream call
    pub fn avg_fanout(&self) -> f64 {
        let calls = self.upstream_calls.load(Ordering::Relaxed);
        if calls == 0 {
            return 0.0;
        }
        self.deliveries.load(Ordering::Relaxed) as f64 / calls as f64
    }

    /// Average upstream latency in milliseconds
    pub fn avg_upstream_ms(&self) -> f64 {
        let calls = self.upstream_calls.load(Ordering::Relaxed);
        if calls == 0 {
            return 0.0;
        }
        self.total_upstream_ms.load(Ordering::Relaxed) as f64 / calls as f64
    }

    /// Fraction of coalesced requests that did not cause their own upstream call
    pub fn savings_ratio(&self) -> f64 {
        let deliveries = self.deliveries.load(Ordering::Relaxed);
        if deliveries == 0 {
            return 0.0;
        }
        let calls = self.upstream_calls.load(Ordering::Relaxed);
        deliveries.saturating_sub(calls) as f64 / deliveries as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_bypassed: self.requests_bypassed.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            requests_coalesced: self.requests_coalesced.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            groups_created: self.groups_created.load(Ordering::Relaxed),
            groups_dispatched: self.groups_dispatched.load(Ordering::Relaxed),
            empty_dispatches: self.empty_dispatches.load(Ordering::Relaxed),
            flush_ticks: self.flush_ticks.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            waiters_abandoned: self.waiters_abandoned.load(Ordering::Relaxed),
            max_fanout: self.max_fanout.load(Ordering::Relaxed),
            avg_fanout: self.avg_fanout(),
            avg_upstream_ms: self.avg_upstream_ms(),
            savings_ratio: self.savings_ratio(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_received: u64,
    pub requests_bypassed: u64,
    pub requests_rejected: u64,
    pub requests_coalesced: u64,
    pub requests_timed_out: u64,
    pub groups_created: u64,
    pub groups_dispatched: u64,
    pub empty_dispatches: u64,
    pub flush_ticks: u64,
    pub upstream_calls: u64,
    pub upstream_failures: u64,
    pub deliveries: u64,
    pub waiters_abandoned: u64,
    pub max_fanout: u64,
    pub avg_fanout: f64,
    pub avg_upstream_ms: f64,
    pub savings_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_counters() {
        let metrics = CoalescerMetrics::new();

        metrics.record_registered(true);
        metrics.record_registered(false);
        metrics.record_registered(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.groups_created, 1);
        assert_eq!(snapshot.requests_coalesced, 2);
    }

    #[test]
    fn test_fanout_and_savings() {
        let metrics = CoalescerMetrics::new();

        metrics.record_dispatched(4);
        metrics.record_upstream(Duration::from_millis(100), false);
        metrics.record_delivered(4, 0);

        metrics.record_dispatched(2);
        metrics.record_upstream(Duration::from_millis(300), true);
        metrics.record_delivered(2, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.max_fanout, 4);
        assert_eq!(snapshot.upstream_failures, 1);
        assert_eq!(snapshot.avg_fanout, 3.0);
        assert_eq!(snapshot.avg_upstream_ms, 200.0);
        assert!((snapshot.savings_ratio - 4.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_dispatch_does_not_touch_fanout() {
        let metrics = CoalescerMetrics::new();

        metrics.record_dispatched(0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.groups_dispatched, 1);
        assert_eq!(snapshot.empty_dispatches, 1);
        assert_eq!(snapshot.max_fanout, 0);
    }

    #[test]
    fn test_edge_cases() {
        let metrics = CoalescerMetrics::new();
        assert_eq!(metrics.avg_fanout(), 0.0);
        assert_eq!(metrics.avg_upstream_ms(), 0.0);
        assert_eq!(metrics.savings_ratio(), 0.0);

        metrics.record_tick();
        metrics.record_delivered(3, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.flush_ticks, 1);
        assert_eq!(snapshot.deliveries, 3);
        assert_eq!(snapshot.waiters_abandoned, 1);
    }
}
