//! Request metrics registry
//!
//! Monotonic atomic counters updated on every proxied completion and
//! reported by the `/stats` endpoint. A request counts as errored when
//! its final status is 500 or above, locally generated 502s included.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    latency_ms_sum: AtomicU64,
    // Indexed by status class: 2xx, 3xx, 4xx, 5xx.
    status_classes: [AtomicU64; 4],
}

/// Point-in-time view rendered by `/stats`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_latency_ms: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, status: u16, duration: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.latency_ms_sum
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);

        if status >= 500 {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }

        let class = status / 100;
        if (2..=5).contains(&class) {
            self.status_classes[class as usize - 2].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let latency_sum = self.latency_ms_sum.load(Ordering::Relaxed);

        StatsSnapshot {
            total_requests,
            total_errors: self.total_errors.load(Ordering::Relaxed),
            avg_latency_ms: if total_requests > 0 {
                latency_sum / total_requests
            } else {
                0
            },
            status_2xx: self.status_classes[0].load(Ordering::Relaxed),
            status_3xx: self.status_classes[1].load(Ordering::Relaxed),
            status_4xx: self.status_classes[2].load(Ordering::Relaxed),
            status_5xx: self.status_classes[3].load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_by_class() {
        let metrics = MetricsRegistry::new();
        metrics.record(200, Duration::from_millis(100));
        metrics.record(204, Duration::from_millis(50));
        metrics.record(301, Duration::from_millis(10));
        metrics.record(404, Duration::from_millis(20));
        metrics.record(502, Duration::from_millis(220));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 5);
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.avg_latency_ms, 80);
        assert_eq!(snapshot.status_2xx, 2);
        assert_eq!(snapshot.status_3xx, 1);
        assert_eq!(snapshot.status_4xx, 1);
        assert_eq!(snapshot.status_5xx, 1);
    }

    #[test]
    fn empty_registry_reports_zero_average() {
        let snapshot = MetricsRegistry::new().snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.avg_latency_ms, 0);
    }

    #[test]
    fn stats_serialize_with_expected_fields() {
        let metrics = MetricsRegistry::new();
        metrics.record(200, Duration::from_millis(42));

        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        for field in [
            "total_requests",
            "total_errors",
            "avg_latency_ms",
            "status_2xx",
            "status_5xx",
        ] {
            assert!(json.contains(field), "missing {}", field);
        }
    }
}
