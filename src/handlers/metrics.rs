//! Internal metrics report endpoint.
//!
//! `GET /internal/metrics` - JSON aggregates over the bounded request
//! sample buffer plus the most recent samples. Intended for dashboards and
//! debugging; the Prometheus scrape surface lives on the separate metrics
//! port (see [`crate::metrics`]).

use axum::Json;
use axum::extract::State;
use tracing::instrument;

use crate::models::{MetricsReport, SystemReport};
use crate::state::AppState;

/// Cap on the `recent_requests` list in the report.
const RECENT_REQUESTS_CAP: usize = 100;

/// Request metrics report.
///
/// # Response Body
///
/// ```json
/// {
///   "stats": {
///     "total_requests": 412,
///     "average_duration_ms": 18.3,
///     "error_rate_percent": 2.4,
///     "requests_per_minute": 87,
///     "status_codes": { "200": 390, "404": 12, "429": 10 },
///     "slowest_endpoints": [
///       { "endpoint": "POST /api/posts", "average_duration_ms": 104.2, "count": 31 }
///     ]
///   },
///   "recent_requests": [ ... ],
///   "system": {
///     "uptime_seconds": 3600,
///     "total_memory_bytes": 16777216000,
///     "free_memory_bytes": 4194304000,
///     "load_average_1m": 0.42,
///     "load_average_5m": 0.38,
///     "load_average_15m": 0.31
///   }
/// }
/// ```
#[instrument(skip(state))]
pub async fn metrics_report(State(state): State<AppState>) -> Json<MetricsReport> {
    let system = state.collector.system_stats();

    Json(MetricsReport {
        stats: state.collector.compute_stats(),
        recent_requests: state.collector.recent(RECENT_REQUESTS_CAP),
        system: SystemReport {
            uptime_seconds: state.uptime_seconds(),
            total_memory_bytes: system.total_memory_bytes,
            free_memory_bytes: system.free_memory_bytes,
            load_average_1m: system.load_average_1m,
            load_average_5m: system.load_average_5m,
            load_average_15m: system.load_average_15m,
        },
    })
}
