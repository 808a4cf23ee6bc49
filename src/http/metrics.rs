//! Prometheus metrics for the lookup service.
//!
//! Each `ScoutMetrics` owns its own `Registry` so tests can build as many
//! app instances as they like without colliding on global registration.

use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

use crate::core::error::LookupError;
use crate::core::types::LookupOutcome;

/// Request latency buckets (seconds). Cache hits land in the first few,
/// browser scrapes in the last few.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.025, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 60.0,
];

#[derive(Clone)]
pub struct ScoutMetrics {
    registry: Registry,

    /// HTTP request counter - labels: endpoint, method, status
    pub requests_total: IntCounterVec,

    /// HTTP request duration histogram - labels: endpoint
    pub request_latency_seconds: HistogramVec,

    /// Lookup outcomes - labels: outcome (hit, miss, or an error kind)
    pub lookups_total: IntCounterVec,

    /// Duration of lookups that went to the portal - labels: outcome
    pub lookup_duration_seconds: HistogramVec,

    /// Records currently held in the cache
    pub cached_records: IntGauge,
}

impl ScoutMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("sunat_scout".into()), None)?;

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Total HTTP requests"),
            &["endpoint", "method", "status"],
        )?;
        let request_latency_seconds = HistogramVec::new(
            HistogramOpts::new("request_latency_seconds", "HTTP request latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["endpoint"],
        )?;
        let lookups_total = IntCounterVec::new(
            Opts::new("lookups_total", "Lookup outcomes by kind"),
            &["outcome"],
        )?;
        let lookup_duration_seconds = HistogramVec::new(
            HistogramOpts::new("lookup_duration_seconds", "Lookup duration in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["outcome"],
        )?;
        let cached_records = IntGauge::new("cached_records", "Records currently cached")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_latency_seconds.clone()))?;
        registry.register(Box::new(lookups_total.clone()))?;
        registry.register(Box::new(lookup_duration_seconds.clone()))?;
        registry.register(Box::new(cached_records.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_latency_seconds,
            lookups_total,
            lookup_duration_seconds,
            cached_records,
        })
    }

    pub fn record_request(&self, endpoint: &str, method: &str, status: u16, duration_secs: f64) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[endpoint, method, status.as_str()])
            .inc();
        self.request_latency_seconds
            .with_label_values(&[endpoint])
            .observe(duration_secs);
    }

    /// Observe the return value of one `LookupService::lookup` call.
    pub fn record_lookup(&self, result: &Result<LookupOutcome, LookupError>) {
        match result {
            Ok(outcome) => {
                let label = outcome.source.cache_header();
                self.lookups_total.with_label_values(&[label]).inc();
                self.lookup_duration_seconds
                    .with_label_values(&[label])
                    .observe(outcome.elapsed.as_secs_f64());
            }
            Err(e) => {
                self.lookups_total.with_label_values(&[e.kind().as_str()]).inc();
            }
        }
    }

    pub fn set_cached_records(&self, count: u64) {
        self.cached_records.set(count as i64);
    }

    /// Prometheus text exposition of everything registered here.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Records count and latency of every request, like a before/after hook.
pub async fn track_requests(
    State(metrics): State<Arc<ScoutMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = request.method().to_string();

    let response = next.run(request).await;

    metrics.record_request(
        &endpoint,
        &method,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// GET /metrics
pub async fn metrics_handler(State(metrics): State<Arc<ScoutMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
