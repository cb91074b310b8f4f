//! Response models for the built-in endpoints.
//!
//! These are serialization-only types; all aggregation logic lives in
//! [`crate::collector`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collector::{AggregateStats, RequestSample};

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"healthy"`; the process answering at all is the signal.
    pub status: String,
    /// Crate version from Cargo metadata.
    pub version: String,
    /// Seconds since the process started.
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// Response body for `GET /csrf/token`.
///
/// The token also travels in the Set-Cookie header; the body copy is what
/// first-party JavaScript echoes back in the `x-csrf-token` header.
#[derive(Debug, Clone, Serialize)]
pub struct CsrfTokenResponse {
    pub token: String,
}

/// Response body for `GET /internal/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    /// Aggregates computed over the current sample buffer.
    pub stats: AggregateStats,
    /// Most recent samples, newest last, capped at 100.
    pub recent_requests: Vec<RequestSample>,
    /// Host and process context for the figures above.
    pub system: SystemReport,
}

/// Host-level section of the metrics report.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemReport {
    /// Seconds since the process started.
    pub uptime_seconds: u64,
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    pub load_average_1m: f64,
    pub load_average_5m: f64,
    pub load_average_15m: f64,
}
