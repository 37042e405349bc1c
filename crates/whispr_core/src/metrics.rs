use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

const LATENCY_BUCKET_UPPER_US: [u64; 8] = [100, 250, 500, 1_000, 2_500, 5_000, 10_000, u64::MAX];

/// A point-in-time view of server metrics, convertible to the Prometheus
/// exposition subset exposed at `GET /metrics`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_millis: u64,
    pub requests_total: u64,
    pub requests_failed_total: u64,
    pub request_rate_per_sec: f64,
    pub request_latency_avg_micros: f64,
    pub request_latency_p95_micros: u64,
    pub request_latency_max_micros: u64,
}

impl MetricsSnapshot {
    /// Renders this snapshot as gauges, one per field, with metric names
    /// normalized to `app_<lowercased-with-non-alnum-as-underscore>`.
    pub fn to_prometheus_text(&self) -> String {
        let fields: [(&str, f64); 7] = [
            ("uptime_millis", self.uptime_millis as f64),
            ("requests_total", self.requests_total as f64),
            ("requests_failed_total", self.requests_failed_total as f64),
            ("request_rate_per_sec", self.request_rate_per_sec),
            ("request_latency_avg_micros", self.request_latency_avg_micros),
            (
                "request_latency_p95_micros",
                self.request_latency_p95_micros as f64,
            ),
            (
                "request_latency_max_micros",
                self.request_latency_max_micros as f64,
            ),
        ];
        render_prometheus_text(fields.into_iter().map(|(k, v)| (k.to_owned(), v)))
    }
}

/// Normalizes an arbitrary metric name to the `app_*` convention: lowercase,
/// every non-alphanumeric run collapsed to a single underscore, and no
/// leading/trailing underscore.
pub fn normalize_metric_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    out.push_str("app_");
    let mut last_was_underscore = true; // suppresses a leading underscore
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_underscore = false;
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

pub fn render_prometheus_text(metrics: impl IntoIterator<Item = (String, f64)>) -> String {
    let mut out = String::new();
    for (name, value) in metrics {
        let normalized = normalize_metric_name(&name);
        out.push_str(&format!("# TYPE {normalized} gauge\n"));
        out.push_str(&format!("{normalized} {value}\n"));
    }
    out
}

/// Lock-free counters behind [`MetricsSnapshot`]. All hot-path updates are
/// O(1) atomics; the snapshot itself walks the fixed bucket array.
pub struct ServerMetrics {
    start_unix_millis: i64,
    requests_total: AtomicU64,
    requests_failed_total: AtomicU64,
    latency_total_micros: AtomicU64,
    latency_max_micros: AtomicU64,
    latency_buckets: [AtomicU64; 8],
}

impl ServerMetrics {
    pub fn new(start_unix_millis: i64) -> Self {
        Self {
            start_unix_millis,
            requests_total: AtomicU64::new(0),
            requests_failed_total: AtomicU64::new(0),
            latency_total_micros: AtomicU64::new(0),
            latency_max_micros: AtomicU64::new(0),
            latency_buckets: Default::default(),
        }
    }

    pub fn record_request(&self, latency_micros: u64, failed: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.requests_failed_total.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_total_micros
            .fetch_add(latency_micros, Ordering::Relaxed);
        max_update(&self.latency_max_micros, latency_micros);
        self.latency_buckets[bucket_index(latency_micros)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now_unix_millis: i64) -> MetricsSnapshot {
        let uptime_millis = now_unix_millis
            .checked_sub(self.start_unix_millis)
            .filter(|d| *d > 0)
            .map(|d| d as u64)
            .unwrap_or(0);
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let request_rate_per_sec = if uptime_millis == 0 {
            0.0
        } else {
            requests_total as f64 / (uptime_millis as f64 / 1_000.0)
        };
        let latency_total = self.latency_total_micros.load(Ordering::Relaxed);
        let request_latency_avg_micros = if requests_total == 0 {
            0.0
        } else {
            latency_total as f64 / requests_total as f64
        };

        MetricsSnapshot {
            uptime_millis,
            requests_total,
            requests_failed_total: self.requests_failed_total.load(Ordering::Relaxed),
            request_rate_per_sec,
            request_latency_avg_micros,
            request_latency_p95_micros: self.p95_micros(),
            request_latency_max_micros: self.latency_max_micros.load(Ordering::Relaxed),
        }
    }

    fn p95_micros(&self) -> u64 {
        let total = self.requests_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let threshold = total.saturating_mul(95).div_ceil(100);
        let mut cumulative = 0u64;
        for (i, upper) in LATENCY_BUCKET_UPPER_US.iter().enumerate() {
            cumulative = cumulative.saturating_add(self.latency_buckets[i].load(Ordering::Relaxed));
            if cumulative >= threshold {
                return *upper;
            }
        }
        u64::MAX
    }
}

fn bucket_index(latency_micros: u64) -> usize {
    LATENCY_BUCKET_UPPER_US
        .iter()
        .position(|upper| latency_micros <= *upper)
        .unwrap_or(LATENCY_BUCKET_UPPER_US.len() - 1)
}

fn max_update(v: &AtomicU64, candidate: u64) {
    let mut current = v.load(Ordering::Relaxed);
    while candidate > current {
        match v.compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(next) => current = next,
        }
    }
}

/// Convenience used by callers that already have a named gauge map (e.g.
/// appstorage exposing item counts per prefix) and just want text output.
pub fn snapshot_map_to_text(map: &BTreeMap<String, f64>) -> String {
    render_prometheus_text(map.iter().map(|(k, v)| (k.clone(), *v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mixed_case_and_punctuation() {
        assert_eq!(normalize_metric_name("Sink.Latency P95"), "app_sink_latency_p95");
        assert_eq!(normalize_metric_name("__weird__"), "app");
        assert_eq!(normalize_metric_name("ok"), "app_ok");
    }

    #[test]
    fn snapshot_computes_p95_from_histogram() {
        let metrics = ServerMetrics::new(0);
        for _ in 0..95 {
            metrics.record_request(80, false);
        }
        for _ in 0..5 {
            metrics.record_request(8_000, true);
        }
        let snapshot = metrics.snapshot(2_000);
        assert_eq!(snapshot.requests_total, 100);
        assert_eq!(snapshot.requests_failed_total, 5);
        assert_eq!(snapshot.request_latency_p95_micros, 100);
        assert_eq!(snapshot.request_latency_max_micros, 8_000);
    }

    #[test]
    fn prometheus_text_has_type_and_value_lines() {
        let text = render_prometheus_text([("requests.total".to_owned(), 3.0)]);
        assert_eq!(text, "# TYPE app_requests_total gauge\napp_requests_total 3\n");
    }
}
