//! Prometheus metrics for the relay.
//!
//! - HTTP request count and latency
//! - Cache hits and misses per backend
//! - Admission denials per endpoint
//! - Upstream domain fetch failures

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_FALLBACKS_TOTAL: &str = "cache_fallbacks_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";

    pub const ADMISSION_DENIED_TOTAL: &str = "admission_denied_total";
    pub const DOMAIN_FETCH_FAILURES_TOTAL: &str = "domain_fetch_failures_total";
    pub const FEEDBACK_JOBS_TOTAL: &str = "feedback_jobs_total";
}

/// Paths that are reported as-is. Everything else is folded into "other".
const KNOWN_PATHS: &[&str] = &[
    "/",
    "/health",
    "/metrics",
    "/data",
    "/attendance",
    "/cgpa",
    "/internals",
    "/exam-schedule",
    "/user-info",
    "/login",
    "/auto-feedback",
];

/// Install the Prometheus recorder. Returns `false` if one is already installed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders the handle.
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format, `None` before [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };
    let path = normalize_path(path);

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "path" => path,
        "status" => status.to_string(),
        "status_class" => status_class
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "path" => path
    )
    .record(duration.as_secs_f64());
}

pub fn record_cache_hit(backend: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "backend" => backend).increment(1);
}

pub fn record_cache_miss(backend: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "backend" => backend).increment(1);
}

pub fn record_cache_fallback() {
    counter!(names::CACHE_FALLBACKS_TOTAL).increment(1);
}

pub fn record_cache_error(op: &'static str) {
    counter!(names::CACHE_ERRORS_TOTAL, "op" => op).increment(1);
}

pub fn record_admission_denied(endpoint: &str) {
    counter!(names::ADMISSION_DENIED_TOTAL, "endpoint" => normalize_path(endpoint)).increment(1);
}

pub fn record_domain_failure(domain: &'static str) {
    counter!(names::DOMAIN_FETCH_FAILURES_TOTAL, "domain" => domain).increment(1);
}

pub fn record_feedback_job(outcome: &'static str) {
    counter!(names::FEEDBACK_JOBS_TOTAL, "outcome" => outcome).increment(1);
}

fn normalize_path(path: &str) -> &'static str {
    KNOWN_PATHS
        .iter()
        .copied()
        .find(|known| *known == path)
        .unwrap_or("other")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/data"), "/data");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/wp-admin/setup.php"), "other");
        assert_eq!(normalize_path("/data/extra"), "other");
    }
}
