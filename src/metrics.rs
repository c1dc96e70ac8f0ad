//! Ambient Prometheus-style metrics registry: lock-free atomic counters and
//! a small fixed-bucket histogram, exported both as Prometheus text
//! (`GET /metrics/prom`) and as JSON with alert flags (`GET /metrics`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// A monotonically increasing counter.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram for latency-like measurements, in milliseconds.
pub struct Histogram {
    bounds_ms: &'static [u64],
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    const DEFAULT_BOUNDS: &'static [u64] = &[10, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

    pub fn new() -> Self {
        let bounds_ms = Self::DEFAULT_BOUNDS;
        Self {
            bounds_ms,
            buckets: (0..=bounds_ms.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe_ms(&self, value_ms: u64) {
        let idx = self.bounds_ms.iter().position(|b| value_ms <= *b).unwrap_or(self.bounds_ms.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_ms(&self) -> u64 {
        self.sum_ms.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// One advisory alert entry, surfaced in the `/metrics` JSON view (spec
/// Ambient Stack: "advisory alert when calibration artifacts insufficient").
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: String,
    pub detail: String,
}

#[derive(Default)]
pub struct AlertLog {
    alerts: parking_lot::RwLock<Vec<Alert>>,
}

impl AlertLog {
    pub fn push(&self, kind: &str, detail: impl Into<String>) {
        self.alerts.write().push(Alert { kind: kind.to_string(), detail: detail.into() });
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        self.alerts.read().clone()
    }
}

/// The full ambient metrics surface for the engine.
pub struct Metrics {
    pub requests_total: Counter,
    pub requests_accepted: Counter,
    pub requests_iterated: Counter,
    pub requests_abstained: Counter,
    pub tool_calls_total: Counter,
    pub tool_calls_blocked: Counter,
    pub tool_calls_failed: Counter,
    pub approvals_requested: Counter,
    pub approvals_expired: Counter,
    pub request_latency_ms: Histogram,
    pub alerts: AlertLog,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            requests_total: Counter::default(),
            requests_accepted: Counter::default(),
            requests_iterated: Counter::default(),
            requests_abstained: Counter::default(),
            tool_calls_total: Counter::default(),
            tool_calls_blocked: Counter::default(),
            tool_calls_failed: Counter::default(),
            approvals_requested: Counter::default(),
            approvals_expired: Counter::default(),
            request_latency_ms: Histogram::new(),
            alerts: AlertLog::default(),
        }
    }
}

impl Metrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Render in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# TYPE veritas_requests_total counter\nveritas_requests_total {}\n", self.requests_total.get()));
        out.push_str(&format!("# TYPE veritas_requests_accepted counter\nveritas_requests_accepted {}\n", self.requests_accepted.get()));
        out.push_str(&format!("# TYPE veritas_requests_iterated counter\nveritas_requests_iterated {}\n", self.requests_iterated.get()));
        out.push_str(&format!("# TYPE veritas_requests_abstained counter\nveritas_requests_abstained {}\n", self.requests_abstained.get()));
        out.push_str(&format!("# TYPE veritas_tool_calls_total counter\nveritas_tool_calls_total {}\n", self.tool_calls_total.get()));
        out.push_str(&format!("# TYPE veritas_tool_calls_blocked counter\nveritas_tool_calls_blocked {}\n", self.tool_calls_blocked.get()));
        out.push_str(&format!("# TYPE veritas_tool_calls_failed counter\nveritas_tool_calls_failed {}\n", self.tool_calls_failed.get()));
        out.push_str(&format!("# TYPE veritas_approvals_requested counter\nveritas_approvals_requested {}\n", self.approvals_requested.get()));
        out.push_str(&format!("# TYPE veritas_approvals_expired counter\nveritas_approvals_expired {}\n", self.approvals_expired.get()));
        out.push_str(&format!("# TYPE veritas_request_latency_ms_sum counter\nveritas_request_latency_ms_sum {}\n", self.request_latency_ms.sum_ms()));
        out.push_str(&format!("# TYPE veritas_request_latency_ms_count counter\nveritas_request_latency_ms_count {}\n", self.request_latency_ms.count()));
        out
    }

    /// Render as JSON, including any accumulated advisory alerts.
    pub fn render_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_total": self.requests_total.get(),
            "requests_accepted": self.requests_accepted.get(),
            "requests_iterated": self.requests_iterated.get(),
            "requests_abstained": self.requests_abstained.get(),
            "tool_calls_total": self.tool_calls_total.get(),
            "tool_calls_blocked": self.tool_calls_blocked.get(),
            "tool_calls_failed": self.tool_calls_failed.get(),
            "approvals_requested": self.approvals_requested.get(),
            "approvals_expired": self.approvals_expired.get(),
            "request_latency_ms_avg": if self.request_latency_ms.count() > 0 {
                self.request_latency_ms.sum_ms() as f64 / self.request_latency_ms.count() as f64
            } else {
                0.0
            },
            "alerts": self.alerts.snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let c = Counter::default();
        c.inc();
        c.inc();
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn histogram_tracks_count_and_sum() {
        let h = Histogram::new();
        h.observe_ms(5);
        h.observe_ms(200);
        assert_eq!(h.count(), 2);
        assert_eq!(h.sum_ms(), 205);
    }

    #[test]
    fn prometheus_render_includes_all_counters() {
        let m = Metrics::default();
        m.requests_total.inc();
        let text = m.render_prometheus();
        assert!(text.contains("veritas_requests_total 1"));
    }

    #[test]
    fn json_render_includes_alerts() {
        let m = Metrics::default();
        m.alerts.push("calibration_insufficient", "domain=default");
        let json = m.render_json();
        assert_eq!(json["alerts"][0]["kind"], "calibration_insufficient");
    }
}
