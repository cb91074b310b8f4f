//! Application routing configuration with the governance middleware stack.
//!
//! # Middleware Stack (request order)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Observation    │ ← x-request-id, timing, sample recording
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 + quota headers if exceeded
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   CSRF Guard     │ ← 403 on invalid token (safe methods bypass)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! Observation wraps the guards so their rejections are sampled and counted
//! like any other response.
//!
//! # Route Groups
//!
//! - `/health` - Liveness probe
//! - `/csrf/token` - CSRF token issuance
//! - `/internal/metrics` - Request metrics report
//! - Everything else is merged in from the embedding application.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::csrf::{CsrfConfig, CsrfLayer};
use crate::middleware::observe::ObserveLayer;
use crate::middleware::rate_limit::{RateLimitError, RateLimitLayer, RateLimitPolicy};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// # Middleware Configuration
///
/// Middleware is configured based on the application config:
///
/// - **Rate Limiting**: Enabled if `rate_limit_max_requests > 0`
/// - **CSRF**: Always enabled; cookie attributes from `csrf_*` settings
/// - **CORS**: Configured from `cors_allowed_origins`
///
/// # Arguments
///
/// * `state` - Application state containing config, collector, and stores
/// * `app_routes` - The embedding application's routes, governed by the
///   same middleware stack as the built-in endpoints
///
/// # Errors
///
/// Returns `RateLimitError` if the rate limiting configuration is invalid.
pub fn build_router(
    state: AppState,
    app_routes: Router<AppState>,
) -> Result<Router, RateLimitError> {
    let config = &state.config;

    let cors = build_cors_layer(&config.cors_allowed_origins);

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/csrf/token", get(handlers::issue_csrf_token))
        .route("/internal/metrics", get(handlers::metrics_report))
        .merge(app_routes);

    // Layers apply bottom-up: the last layer added runs first on requests.

    // 1. Request body size limit (prevents DoS via large payloads)
    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. CORS
    router = router.layer(cors);

    // 3. Tracing
    router = router.layer(TraceLayer::new_for_http());

    // 4. CSRF guard, sharing the token registry with the token endpoint
    router = router.layer(CsrfLayer::new(
        CsrfConfig {
            token_ttl: config.csrf_token_ttl,
            secure_cookies: config.csrf_secure_cookies,
        },
        state.csrf_tokens.clone(),
    ));

    // 5. Rate limiting (if enabled)
    if config.rate_limiting_enabled() {
        info!(
            max_requests = config.rate_limit_max_requests,
            window_secs = config.rate_limit_window.as_secs(),
            cache_size = config.rate_limit_cache_size,
            "Rate limiting enabled"
        );
        let policy = RateLimitPolicy::api()
            .with_window(config.rate_limit_window)
            .with_max(config.rate_limit_max_requests);
        router = router.layer(RateLimitLayer::new(policy, state.api_store.clone())?);
    } else {
        info!("Rate limiting disabled (RATE_LIMIT_MAX_REQUESTS=0)");
    }

    // 6. Observation, outermost so guard rejections are sampled too
    router = router.layer(ObserveLayer::new(state.collector.clone()));

    Ok(router.with_state(state))
}

/// Build CORS layer from configuration.
///
/// # Arguments
///
/// * `allowed_origins` - List of allowed origins, or `["*"]` for any origin
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_cors_layer_any() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_build_cors_layer_specific() {
        let origins = vec![
            "https://example.com".to_string(),
            "https://app.example.com".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
        // Just verify it doesn't panic
    }
}
