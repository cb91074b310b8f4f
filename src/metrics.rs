//! Prometheus metrics for application observability.
//!
//! This module provides Prometheus-compatible metrics for monitoring the
//! governance pipeline. Metrics are exposed via a dedicated HTTP endpoint
//! on the metrics port (default: 9090).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `reqgate_requests_total` - Total requests observed (with labels: method, status)
//! - `reqgate_rate_limit_rejections_total` - Requests rejected over quota (with label: path)
//! - `reqgate_csrf_rejections_total` - Requests rejected by the CSRF guard (with label: reason)
//!
//! ## Histograms
//! - `reqgate_request_duration_seconds` - Request duration (with labels: method, status)
//!
//! These are cumulative process-lifetime series for scraping; the bounded
//! per-request sample buffer lives in [`crate::collector`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use reqgate::metrics::{init_metrics, record_request};
//!
//! // Initialize metrics (call once at startup)
//! init_metrics("0.0.0.0:9090".parse()?)?;
//!
//! // Record metrics as requests complete
//! record_request("POST", 200, 0.045);
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "reqgate_requests_total";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "reqgate_rate_limit_rejections_total";
    pub const CSRF_REJECTIONS_TOTAL: &str = "reqgate_csrf_rejections_total";
    pub const REQUEST_DURATION_SECONDS: &str = "reqgate_request_duration_seconds";
}

/// Initialize the Prometheus metrics exporter.
///
/// This sets up metric descriptions and starts the Prometheus HTTP listener
/// on the specified address (default: 0.0.0.0:9090).
///
/// # Errors
///
/// Returns an error message if the exporter cannot be installed (address in
/// use, exporter already installed).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::REQUESTS_TOTAL, "Total number of requests observed");
    describe_counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        names::CSRF_REJECTIONS_TOTAL,
        "Total number of requests rejected by the CSRF guard"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
///
/// This is useful for cases where metrics are optional.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Record a completed request with its duration.
pub fn record_request(method: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    counter!(names::REQUESTS_TOTAL, "method" => method.to_string(), "status" => status.clone())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status)
        .record(duration_secs);
}

/// Record a request rejected over quota.
pub fn record_rate_limit_rejection(path: &str) {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL, "path" => path.to_string()).increment(1);
}

/// Record a request rejected by the CSRF guard.
pub fn record_csrf_rejection(reason: &str) {
    counter!(names::CSRF_REJECTIONS_TOTAL, "reason" => reason.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests verify the functions don't panic.
    // Full metrics testing requires integration tests with a Prometheus scraper.

    #[test]
    fn test_record_request() {
        // Should not panic even without metrics initialized
        record_request("GET", 200, 0.1);
    }

    #[test]
    fn test_record_rate_limit_rejection() {
        record_rate_limit_rejection("/api/posts");
    }

    #[test]
    fn test_record_csrf_rejection() {
        record_csrf_rejection("token_mismatch");
    }
}
