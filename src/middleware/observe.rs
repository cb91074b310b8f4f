//! Request observation middleware.
//!
//! Outermost layer of the governance stack: assigns (or propagates) a
//! correlation id, times the request, measures process resource deltas, and
//! records one [`RequestSample`] into the shared collector when the response
//! is produced. Because it wraps the rate limiter and CSRF guard, their
//! rejections are observed like any other response.
//!
//! Observation is strictly best-effort. Sampling failures degrade to zeroed
//! resource figures and the wrapped request is never aborted.
//!
//! # Cancelled Requests
//!
//! If the client disconnects mid-flight, Axum drops the request future and
//! the response never materializes. A drop guard still records the partial
//! sample with the conventional status 499 (client closed request) so
//! abandoned work remains visible in the aggregates.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use chrono::Utc;
use tower::{Layer, Service};
use tracing::debug;
use uuid::Uuid;

use crate::collector::{MetricsCollector, RequestSample};

/// Correlation id header, reused from the request when present.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Nonstandard status recorded for requests dropped before completion.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Observation layer for the Tower middleware stack.
#[derive(Clone)]
pub struct ObserveLayer {
    collector: Arc<MetricsCollector>,
}

impl ObserveLayer {
    /// Create an observation layer recording into the given collector.
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }
}

impl<S> Layer<S> for ObserveLayer {
    type Service = ObserveService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ObserveService {
            inner,
            collector: self.collector.clone(),
        }
    }
}

/// Observation service wrapper.
#[derive(Clone)]
pub struct ObserveService<S> {
    inner: S,
    collector: Arc<MetricsCollector>,
}

impl<S> Service<Request<Body>> for ObserveService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let collector = self.collector.clone();
        let mut inner = self.inner.clone();

        let request_id = incoming_request_id(&req).unwrap_or_else(|| Uuid::new_v4().to_string());

        // Make the id available to downstream extractors and handlers.
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        Box::pin(async move {
            let mut guard = SampleGuard::begin(collector, request_id.clone(), &req);

            let mut response = inner.call(req).await?;

            guard.finish(response.status().as_u16());

            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }

            Ok(response)
        })
    }
}

/// Validate and extract an incoming correlation id.
///
/// Only well-formed header values are propagated; anything unprintable or
/// oversized is replaced with a fresh id.
fn incoming_request_id(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
}

/// Records exactly one sample per observed request.
///
/// Armed on construction; [`finish`](Self::finish) disarms it with the real
/// status. If the request future is dropped first, `Drop` records the
/// partial sample as a client disconnect.
struct SampleGuard {
    collector: Arc<MetricsCollector>,
    request_id: String,
    method: String,
    path: String,
    start: Instant,
    cpu_before_ms: u64,
    armed: bool,
}

impl SampleGuard {
    fn begin(collector: Arc<MetricsCollector>, request_id: String, req: &Request<Body>) -> Self {
        let cpu_before_ms = collector.resource_snapshot().cpu_time_ms;
        Self {
            collector,
            request_id,
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            start: Instant::now(),
            cpu_before_ms,
            armed: true,
        }
    }

    fn finish(&mut self, status: u16) {
        self.armed = false;
        self.record(status);
    }

    fn record(&self, status: u16) {
        let duration = self.start.elapsed();
        let resources = self.collector.resource_snapshot();

        crate::metrics::record_request(&self.method, status, duration.as_secs_f64());

        self.collector.record(RequestSample {
            request_id: self.request_id.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            status,
            duration_ms: duration.as_secs_f64() * 1000.0,
            cpu_time_ms: resources.cpu_time_ms.saturating_sub(self.cpu_before_ms),
            rss_bytes: resources.rss_bytes,
            virtual_mem_bytes: resources.virtual_mem_bytes,
            timestamp: Utc::now(),
        });
    }
}

impl Drop for SampleGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!(
                request_id = %self.request_id,
                path = %self.path,
                "Request dropped before completion; recording as client disconnect"
            );
            self.record(CLIENT_CLOSED_REQUEST);
        }
    }
}
