//! Prometheus-compatible metrics for the controller
//!
//! Tracks API requests per route, node agent calls per capability,
//! workflow outcomes per kind and node liveness gauges.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 30000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value (milliseconds)
    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.boundaries.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);
        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }
        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));
        result
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // saturating: a gauge never goes below zero
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Call statistics for one label (route, capability or workflow kind)
#[derive(Debug, Default)]
pub struct CallMetrics {
    pub total: Counter,
    pub success: Counter,
    pub error: Counter,
    pub latency: Histogram,
}

impl CallMetrics {
    fn record(&self, duration: Duration, success: bool) {
        self.total.inc();
        self.latency.observe(duration.as_secs_f64() * 1000.0);
        if success {
            self.success.inc();
        } else {
            self.error.inc();
        }
    }
}

type Family = Mutex<BTreeMap<String, Arc<CallMetrics>>>;

fn entry(family: &Family, label: &str) -> Arc<CallMetrics> {
    family
        .lock()
        .entry(label.to_string())
        .or_insert_with(|| Arc::new(CallMetrics::default()))
        .clone()
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    requests: Family,
    agent_calls: Family,
    workflows: Family,
    rollbacks: Mutex<BTreeMap<String, u64>>,

    pub total_requests: Counter,
    pub total_errors: Counter,

    pub nodes_healthy: Gauge,
    pub nodes_unreachable: Gauge,
    pub nodes_degraded: Gauge,
    pub workflows_in_flight: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(BTreeMap::new()),
            agent_calls: Mutex::new(BTreeMap::new()),
            workflows: Mutex::new(BTreeMap::new()),
            rollbacks: Mutex::new(BTreeMap::new()),
            total_requests: Counter::new(),
            total_errors: Counter::new(),
            nodes_healthy: Gauge::new(),
            nodes_unreachable: Gauge::new(),
            nodes_degraded: Gauge::new(),
            workflows_in_flight: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    pub fn endpoint(&self, path: &str) -> Arc<CallMetrics> {
        entry(&self.requests, path)
    }

    /// Record an API request
    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        self.endpoint(path).record(duration, success);
        self.total_requests.inc();
        if !success {
            self.total_errors.inc();
        }
    }

    /// Record a node agent call
    pub fn record_agent_call(&self, capability: &str, duration: Duration, success: bool) {
        entry(&self.agent_calls, capability).record(duration, success);
    }

    pub fn agent_calls(&self, capability: &str) -> Arc<CallMetrics> {
        entry(&self.agent_calls, capability)
    }

    /// Record a finished workflow
    pub fn record_workflow(&self, kind: &str, duration: Duration, success: bool) {
        entry(&self.workflows, kind).record(duration, success);
    }

    pub fn workflow(&self, kind: &str) -> Arc<CallMetrics> {
        entry(&self.workflows, kind)
    }

    pub fn record_rollback(&self, status: &str) {
        *self.rollbacks.lock().entry(status.to_string()).or_insert(0) += 1;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let mut scalar = |name: &str, kind: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} {}\n", name, kind));
            out.push_str(&format!("{} {}\n", name, value));
        };

        scalar(
            "sds_requests_total",
            "counter",
            "Total API requests",
            self.total_requests.get(),
        );
        scalar(
            "sds_errors_total",
            "counter",
            "Total failed API requests",
            self.total_errors.get(),
        );
        scalar(
            "sds_nodes_healthy",
            "gauge",
            "Registered nodes currently healthy",
            self.nodes_healthy.get(),
        );
        scalar(
            "sds_nodes_unreachable",
            "gauge",
            "Registered nodes currently unreachable",
            self.nodes_unreachable.get(),
        );
        scalar(
            "sds_nodes_degraded",
            "gauge",
            "Registered nodes reachable without a replication driver",
            self.nodes_degraded.get(),
        );
        scalar(
            "sds_workflows_in_flight",
            "gauge",
            "Workflows currently running",
            self.workflows_in_flight.get(),
        );
        scalar(
            "sds_uptime_seconds",
            "gauge",
            "Controller uptime in seconds",
            self.uptime_seconds(),
        );

        write_family(&mut out, "sds_request", "path", &self.requests.lock());
        write_family(&mut out, "sds_agent_call", "capability", &self.agent_calls.lock());
        write_family(&mut out, "sds_workflow", "kind", &self.workflows.lock());

        out.push_str("# HELP sds_rollbacks_total Workflow rollbacks by outcome\n");
        out.push_str("# TYPE sds_rollbacks_total counter\n");
        for (status, count) in self.rollbacks.lock().iter() {
            out.push_str(&format!("sds_rollbacks_total{{status=\"{}\"}} {}\n", status, count));
        }

        out
    }
}

fn write_family(
    out: &mut String,
    prefix: &str,
    label: &str,
    family: &BTreeMap<String, Arc<CallMetrics>>,
) {
    out.push_str(&format!("# TYPE {}s_total counter\n", prefix));
    for (value, metrics) in family {
        out.push_str(&format!(
            "{}s_total{{{}=\"{}\"}} {}\n",
            prefix,
            label,
            value,
            metrics.total.get()
        ));
    }

    out.push_str(&format!("# TYPE {}_errors_total counter\n", prefix));
    for (value, metrics) in family {
        out.push_str(&format!(
            "{}_errors_total{{{}=\"{}\"}} {}\n",
            prefix,
            label,
            value,
            metrics.error.get()
        ));
    }

    out.push_str(&format!("# TYPE {}_duration_ms histogram\n", prefix));
    for (value, metrics) in family {
        for (le, count) in metrics.latency.get_buckets() {
            let le = if le.is_infinite() {
                "+Inf".to_string()
            } else {
                le.to_string()
            };
            out.push_str(&format!(
                "{}_duration_ms_bucket{{{}=\"{}\",le=\"{}\"}} {}\n",
                prefix, label, value, le, count
            ));
        }
        out.push_str(&format!(
            "{}_duration_ms_sum{{{}=\"{}\"}} {}\n",
            prefix,
            label,
            value,
            metrics.latency.sum()
        ));
        out.push_str(&format!(
            "{}_duration_ms_count{{{}=\"{}\"}} {}\n",
            prefix,
            label,
            value,
            metrics.latency.count()
        ));
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
