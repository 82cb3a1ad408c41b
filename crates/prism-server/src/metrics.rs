//! Prometheus-compatible metrics endpoint.
//!
//! Counters are atomics; labeled families live in small concurrent maps;
//! histograms keep a bounded sample window and report p50/p95 at render
//! time. Gauges (lane status, circuit states, uptime) are computed from
//! live state passed into [`Metrics::render_prometheus`].

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Samples kept per histogram; older samples age out of the window.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Debug, Default)]
pub struct Histogram {
    samples: Mutex<Vec<f64>>,
    count: AtomicU64,
    sum: Mutex<f64>,
}

impl Histogram {
    pub fn observe(&self, value_ms: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        *self.sum.lock() += value_ms;
        let mut samples = self.samples.lock();
        if samples.len() == HISTOGRAM_WINDOW {
            samples.remove(0);
        }
        samples.push(value_ms);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// (p50, p95) over the current window; zeros when empty.
    pub fn percentiles(&self) -> (f64, f64) {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return (0.0, 0.0);
        }
        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let pick = |q: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[idx]
        };
        (pick(0.50), pick(0.95))
    }

    fn sum(&self) -> f64 {
        *self.sum.lock()
    }
}

#[derive(Debug)]
struct MetricsInner {
    http_requests_total: AtomicU64,
    http_errors_total: AtomicU64,
    sse_connections_total: AtomicU64,
    sse_heartbeats_total: AtomicU64,
    rate_limit_blocks_total: AtomicU64,
    injection_attempts_total: AtomicU64,
    provider_requests: DashMap<String, u64>,
    provider_errors: DashMap<String, u64>,
    http_request_duration_ms: Histogram,
    sse_duration_ms: Histogram,
    lane_latency_ms: DashMap<String, Arc<Histogram>>,
    provider_latency_ms: DashMap<String, Arc<Histogram>>,
    started_at: Instant,
}

/// Shared metrics registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                http_errors_total: AtomicU64::new(0),
                sse_connections_total: AtomicU64::new(0),
                sse_heartbeats_total: AtomicU64::new(0),
                rate_limit_blocks_total: AtomicU64::new(0),
                injection_attempts_total: AtomicU64::new(0),
                provider_requests: DashMap::new(),
                provider_errors: DashMap::new(),
                http_request_duration_ms: Histogram::default(),
                sse_duration_ms: Histogram::default(),
                lane_latency_ms: DashMap::new(),
                provider_latency_ms: DashMap::new(),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.inner.http_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sse_connections(&self) {
        self.inner.sse_connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sse_heartbeats(&self) {
        self.inner.sse_heartbeats_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limit_blocks(&self) {
        self.inner.rate_limit_blocks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_injection_attempts(&self) {
        self.inner.injection_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provider_request(&self, provider: &str, success: bool, latency_ms: f64) {
        *self
            .inner
            .provider_requests
            .entry(provider.to_string())
            .or_insert(0) += 1;
        if !success {
            *self
                .inner
                .provider_errors
                .entry(provider.to_string())
                .or_insert(0) += 1;
        }
        self.inner
            .provider_latency_ms
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()))
            .observe(latency_ms);
    }

    pub fn observe_http_duration(&self, latency_ms: f64) {
        self.inner.http_request_duration_ms.observe(latency_ms);
    }

    pub fn observe_sse_duration(&self, latency_ms: f64) {
        self.inner.sse_duration_ms.observe(latency_ms);
    }

    pub fn observe_lane_latency(&self, lane: &str, latency_ms: f64) {
        self.inner
            .lane_latency_ms
            .entry(lane.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()))
            .observe(latency_ms);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    /// Render in Prometheus text exposition format. Gauges come from the
    /// live state the caller passes in.
    pub fn render_prometheus(&self, gauges: &GaugeContext) -> String {
        let m = &self.inner;
        let mut out = String::with_capacity(4096);

        let counter = |out: &mut String, name: &str, help: &str, value: u64| {
            let _ = writeln!(out, "# HELP prism_{name} {help}");
            let _ = writeln!(out, "# TYPE prism_{name} counter");
            let _ = writeln!(out, "prism_{name} {value}");
            out.push('\n');
        };

        counter(
            &mut out,
            "http_requests_total",
            "Total HTTP requests served.",
            m.http_requests_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "http_errors_total",
            "Total HTTP errors (4xx/5xx).",
            m.http_errors_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "sse_connections_total",
            "Total SSE sessions opened.",
            m.sse_connections_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "sse_heartbeats_total",
            "Total SSE heartbeat events emitted.",
            m.sse_heartbeats_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "cache_hits_total",
            "Embedding cache hits.",
            gauges.cache_hits,
        );
        counter(
            &mut out,
            "cache_misses_total",
            "Embedding cache misses.",
            gauges.cache_misses,
        );
        counter(
            &mut out,
            "rate_limit_blocks_total",
            "Requests rejected by the rate limiter.",
            m.rate_limit_blocks_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "injection_attempts_total",
            "Queries matching an injection pattern.",
            m.injection_attempts_total.load(Ordering::Relaxed),
        );

        // Labeled counter families, sorted for stable output.
        let _ = writeln!(out, "# HELP prism_provider_requests_total Total LLM calls per provider.");
        let _ = writeln!(out, "# TYPE prism_provider_requests_total counter");
        for (provider, value) in sorted_map(&m.provider_requests) {
            let _ = writeln!(out, "prism_provider_requests_total{{provider=\"{provider}\"}} {value}");
        }
        out.push('\n');
        let _ = writeln!(out, "# HELP prism_provider_errors_total Failed LLM calls per provider.");
        let _ = writeln!(out, "# TYPE prism_provider_errors_total counter");
        for (provider, value) in sorted_map(&m.provider_errors) {
            let _ = writeln!(out, "prism_provider_errors_total{{provider=\"{provider}\"}} {value}");
        }
        out.push('\n');

        render_histogram(&mut out, "http_request_duration_ms", None, &m.http_request_duration_ms);
        render_histogram(&mut out, "sse_duration_ms", None, &m.sse_duration_ms);
        for entry in m.lane_latency_ms.iter() {
            render_histogram(
                &mut out,
                "lane_latency_ms",
                Some(("lane", entry.key())),
                entry.value(),
            );
        }
        for entry in m.provider_latency_ms.iter() {
            render_histogram(
                &mut out,
                "provider_latency_ms",
                Some(("provider", entry.key())),
                entry.value(),
            );
        }

        // Gauges.
        let _ = writeln!(out, "# HELP prism_lane_status Lane health: 0 down, 1 degraded, 2 up.");
        let _ = writeln!(out, "# TYPE prism_lane_status gauge");
        for (lane, value) in &gauges.lane_status {
            let _ = writeln!(out, "prism_lane_status{{lane=\"{lane}\"}} {value}");
        }
        out.push('\n');
        let _ = writeln!(
            out,
            "# HELP prism_provider_circuit_state Circuit state: 0 closed, 1 half_open, 2 open."
        );
        let _ = writeln!(out, "# TYPE prism_provider_circuit_state gauge");
        for (provider, value) in &gauges.provider_circuit_state {
            let _ = writeln!(out, "prism_provider_circuit_state{{provider=\"{provider}\"}} {value}");
        }
        out.push('\n');
        let _ = writeln!(out, "# HELP prism_system_uptime_seconds Time since process start.");
        let _ = writeln!(out, "# TYPE prism_system_uptime_seconds gauge");
        let _ = writeln!(out, "prism_system_uptime_seconds {}", self.uptime_seconds());

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl prism_llm::scoring::RouteObserver for Metrics {
    fn on_attempt(&self, provider_id: &str, success: bool, latency_ms: u64) {
        self.record_provider_request(provider_id, success, latency_ms as f64);
    }
}

fn sorted_map(map: &DashMap<String, u64>) -> BTreeMap<String, u64> {
    map.iter().map(|e| (e.key().clone(), *e.value())).collect()
}

fn render_histogram(out: &mut String, name: &str, label: Option<(&str, &str)>, histogram: &Histogram) {
    let (p50, p95) = histogram.percentiles();
    let labels = |quantile: &str| match label {
        Some((k, v)) => format!("{{{k}=\"{v}\",quantile=\"{quantile}\"}}"),
        None => format!("{{quantile=\"{quantile}\"}}"),
    };
    let plain = match label {
        Some((k, v)) => format!("{{{k}=\"{v}\"}}"),
        None => String::new(),
    };
    let _ = writeln!(out, "# HELP prism_{name} Latency summary in milliseconds.");
    let _ = writeln!(out, "# TYPE prism_{name} summary");
    let _ = writeln!(out, "prism_{name}{} {p50}", labels("0.5"));
    let _ = writeln!(out, "prism_{name}{} {p95}", labels("0.95"));
    let _ = writeln!(out, "prism_{name}_sum{plain} {}", histogram.sum());
    let _ = writeln!(out, "prism_{name}_count{plain} {}", histogram.count());
    out.push('\n');
}

/// Live state sampled at render time.
#[derive(Debug, Default)]
pub struct GaugeContext {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// lane name → 0 down / 1 degraded / 2 up
    pub lane_status: BTreeMap<String, u8>,
    /// provider id → 0 closed / 1 half_open / 2 open
    pub provider_circuit_state: BTreeMap<String, u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let m = Metrics::new();
        m.inc_http_requests();
        m.inc_http_requests();
        m.inc_sse_connections();
        let out = m.render_prometheus(&GaugeContext::default());
        assert!(out.contains("prism_http_requests_total 2"));
        assert!(out.contains("prism_sse_connections_total 1"));
        assert!(out.contains("# TYPE prism_http_requests_total counter"));
    }

    #[test]
    fn test_labeled_provider_counters() {
        let m = Metrics::new();
        m.record_provider_request("ollama_local", true, 120.0);
        m.record_provider_request("ollama_local", false, 80.0);
        let out = m.render_prometheus(&GaugeContext::default());
        assert!(out.contains("prism_provider_requests_total{provider=\"ollama_local\"} 2"));
        assert!(out.contains("prism_provider_errors_total{provider=\"ollama_local\"} 1"));
        assert!(out.contains("prism_provider_latency_ms{provider=\"ollama_local\",quantile=\"0.5\"}"));
    }

    #[test]
    fn test_histogram_percentiles() {
        let h = Histogram::default();
        for v in 1..=100 {
            h.observe(v as f64);
        }
        let (p50, p95) = h.percentiles();
        assert!((p50 - 50.0).abs() <= 2.0);
        assert!((p95 - 95.0).abs() <= 2.0);
        assert_eq!(h.count(), 100);
    }

    #[test]
    fn test_histogram_window_bounded() {
        let h = Histogram::default();
        for v in 0..(HISTOGRAM_WINDOW + 500) {
            h.observe(v as f64);
        }
        assert_eq!(h.count(), (HISTOGRAM_WINDOW + 500) as u64);
        assert_eq!(h.samples.lock().len(), HISTOGRAM_WINDOW);
    }

    #[test]
    fn test_gauges_render() {
        let m = Metrics::new();
        let mut gauges = GaugeContext::default();
        gauges.lane_status.insert("web".into(), 2);
        gauges.provider_circuit_state.insert("openai".into(), 1);
        gauges.cache_hits = 7;
        let out = m.render_prometheus(&gauges);
        assert!(out.contains("prism_lane_status{lane=\"web\"} 2"));
        assert!(out.contains("prism_provider_circuit_state{provider=\"openai\"} 1"));
        assert!(out.contains("prism_cache_hits_total 7"));
        assert!(out.contains("prism_system_uptime_seconds"));
    }
}
