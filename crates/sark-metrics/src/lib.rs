//! Gateway metrics.
//!
//! Lock-free counters and a fixed-bucket latency histogram, exported as a
//! serializable snapshot for the external observability collaborator. The
//! hot path only ever touches atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Upper bounds (microseconds) of the latency histogram buckets. The last
/// bucket is open-ended.
const LATENCY_BUCKETS_US: [u64; 14] = [
    100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000,
    1_000_000, 5_000_000,
];

struct Histogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_US.len() + 1],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    fn record(&self, latency: Duration) {
        let us = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        let idx = LATENCY_BUCKETS_US
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(LATENCY_BUCKETS_US.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
    }

    fn mean_us(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            self.sum_us.load(Ordering::Relaxed) / count
        }
    }

    /// Bucket upper bound at or below which `quantile` of samples fall.
    fn percentile_us(&self, quantile: f64) -> u64 {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let target = ((total as f64) * quantile).ceil() as u64;
        let mut seen = 0;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return LATENCY_BUCKETS_US
                    .get(idx)
                    .copied()
                    .unwrap_or(u64::MAX);
            }
        }
        u64::MAX
    }
}

/// Shared metrics registry for the authorization engine.
#[derive(Default)]
pub struct GatewayMetrics {
    requests_total: AtomicU64,
    allowed_total: AtomicU64,
    denied_total: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limit_denials: AtomicU64,
    evaluation_errors: AtomicU64,
    dispatch_failures: AtomicU64,
    decision_latency: Histogram,
    breaker_states: Mutex<HashMap<String, String>>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, allowed: bool) {
        if allowed {
            self.allowed_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_denial(&self) {
        self.rate_limit_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evaluation_error(&self) {
        self.evaluation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision_latency(&self, latency: Duration) {
        self.decision_latency.record(latency);
    }

    pub fn set_breaker_state(&self, backend: &str, state: &str) {
        if let Ok(mut states) = self.breaker_states.lock() {
            states.insert(backend.to_string(), state.to_string());
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests_total.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let denials = self.rate_limit_denials.load(Ordering::Relaxed);

        MetricsSnapshot {
            requests_total: requests,
            allowed_total: self.allowed_total.load(Ordering::Relaxed),
            denied_total: self.denied_total.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: ratio(hits, lookups),
            rate_limit_denials: denials,
            rate_limit_denial_rate: ratio(denials, requests),
            evaluation_errors: self.evaluation_errors.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            decision_latency_mean_us: self.decision_latency.mean_us(),
            decision_latency_p50_us: self.decision_latency.percentile_us(0.50),
            decision_latency_p95_us: self.decision_latency.percentile_us(0.95),
            decision_latency_p99_us: self.decision_latency.percentile_us(0.99),
            breaker_states: self
                .breaker_states
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default(),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64) / (whole as f64)
    }
}

/// Point-in-time view of the registry, serializable for export.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub allowed_total: u64,
    pub denied_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub rate_limit_denials: u64,
    pub rate_limit_denial_rate: f64,
    pub evaluation_errors: u64,
    pub dispatch_failures: u64,
    pub decision_latency_mean_us: u64,
    pub decision_latency_p50_us: u64,
    pub decision_latency_p95_us: u64,
    pub decision_latency_p99_us: u64,
    pub breaker_states: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_reflects_lookups() {
        let metrics = GatewayMetrics::new();
        for _ in 0..3 {
            metrics.record_cache_hit();
        }
        metrics.record_cache_miss();

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits, 3);
        assert_eq!(snap.cache_misses, 1);
        assert!((snap.cache_hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn denial_rate_uses_total_requests() {
        let metrics = GatewayMetrics::new();
        for _ in 0..10 {
            metrics.record_request();
        }
        metrics.record_rate_limit_denial();

        let snap = metrics.snapshot();
        assert!((snap.rate_limit_denial_rate - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn percentiles_are_monotone() {
        let metrics = GatewayMetrics::new();
        for ms in [1u64, 2, 3, 5, 8, 13, 21, 34, 55, 89] {
            metrics.record_decision_latency(Duration::from_millis(ms));
        }
        let snap = metrics.snapshot();
        assert!(snap.decision_latency_p50_us <= snap.decision_latency_p95_us);
        assert!(snap.decision_latency_p95_us <= snap.decision_latency_p99_us);
        assert!(snap.decision_latency_p50_us > 0);
    }

    #[test]
    fn empty_histogram_reports_zero() {
        let metrics = GatewayMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.decision_latency_p99_us, 0);
        assert_eq!(snap.cache_hit_rate, 0.0);
    }

    #[test]
    fn breaker_states_appear_in_snapshot() {
        let metrics = GatewayMetrics::new();
        metrics.set_breaker_state("srv-a", "open");
        metrics.set_breaker_state("srv-b", "closed");

        let snap = metrics.snapshot();
        assert_eq!(snap.breaker_states.get("srv-a").unwrap(), "open");
        assert_eq!(snap.breaker_states.get("srv-b").unwrap(), "closed");
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = GatewayMetrics::new();
        metrics.record_request();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["requests_total"], 1);
    }
}
