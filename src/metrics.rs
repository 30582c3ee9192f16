//! Prometheus metrics (spec.md §7 "Observability"), backed by a real
//! `prometheus::Registry`.

use prometheus::{Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub cache_status_total: IntCounterVec,
    pub origin_fetch_total: IntCounterVec,
    pub transform_duration_seconds: HistogramVec,
    pub circuit_breaker_state: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            prometheus::Opts::new("imagekit_requests_total", "Total requests handled"),
            &["status"],
        )
        .unwrap();
        let cache_status_total = IntCounterVec::new(
            prometheus::Opts::new("imagekit_cache_status_total", "Cache lookups by outcome"),
            &["status"],
        )
        .unwrap();
        let origin_fetch_total = IntCounterVec::new(
            prometheus::Opts::new("imagekit_origin_fetch_total", "Origin fetches by origin and outcome"),
            &["origin", "outcome"],
        )
        .unwrap();
        let transform_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("imagekit_transform_duration_seconds", "Transform pipeline latency"),
            &["format"],
        )
        .unwrap();
        let circuit_breaker_state = IntCounterVec::new(
            prometheus::Opts::new("imagekit_circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["dependency", "state"],
        )
        .unwrap();

        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(cache_status_total.clone())).unwrap();
        registry.register(Box::new(origin_fetch_total.clone())).unwrap();
        registry.register(Box::new(transform_duration_seconds.clone())).unwrap();
        registry.register(Box::new(circuit_breaker_state.clone())).unwrap();

        Self {
            registry,
            requests_total,
            cache_status_total,
            origin_fetch_total,
            transform_duration_seconds,
            circuit_breaker_state,
        }
    }

    pub fn record_request(&self, status: u16) {
        self.requests_total.with_label_values(&[&status.to_string()]).inc();
    }

    pub fn record_cache_status(&self, status: &str) {
        self.cache_status_total.with_label_values(&[status]).inc();
    }

    pub fn record_origin_fetch(&self, origin: &str, outcome: &str) {
        self.origin_fetch_total.with_label_values(&[origin, outcome]).inc();
    }

    pub fn observe_transform_duration(&self, format: &str, seconds: f64) {
        self.transform_duration_seconds.with_label_values(&[format]).observe(seconds);
    }

    /// Renders the Prometheus text exposition format for `/metrics`.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode(&families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
