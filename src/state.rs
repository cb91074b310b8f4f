//! Shared application state for Axum handlers.
//!
//! This module provides thread-safe, clonable state that is shared across
//! all request handlers and middleware:
//!
//! - **Collector**: Bounded request sample buffer for the metrics report
//! - **Window Stores**: Rate limiter counters (general API and auth-scoped)
//! - **Configuration**: Runtime configuration access
//!
//! # Thread Safety
//!
//! All components are wrapped in `Arc` and use interior mutability patterns
//! that are safe for concurrent access from multiple handlers.
//!
//! # Injectability
//!
//! Nothing here is a process-wide singleton. Tests construct as many
//! isolated `AppState` instances as they need; two states never share
//! counters or samples.

use std::sync::Arc;
use std::time::Instant;

use crate::collector::MetricsCollector;
use crate::config::Config;
use crate::middleware::csrf::TokenStore;
use crate::middleware::rate_limit::{
    RateLimitError, RateLimitLayer, RateLimitPolicy, WindowStore,
};

/// Shared application state for Axum handlers.
///
/// This struct is cloned for each request handler. All internal data
/// is wrapped in `Arc` for efficient sharing.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Request sample collector shared with the observation layer
    pub collector: Arc<MetricsCollector>,
    /// Window counters for the general API limiter
    pub api_store: Arc<WindowStore>,
    /// Window counters for the auth-scoped limiter, kept separate so login
    /// attempts never compete with general traffic for LRU slots
    pub auth_store: Arc<WindowStore>,
    /// Registry of currently-valid single-use CSRF tokens, shared between
    /// the guard layer and the token endpoint
    pub csrf_tokens: Arc<TokenStore>,
    /// Timestamp when the application started
    pub started_at: Instant,
}

impl AppState {
    /// Create new application state from configuration.
    ///
    /// Buffer and cache capacities come from the validated config, so this
    /// never constructs zero-sized components.
    pub fn new(config: Config) -> Self {
        let collector = Arc::new(MetricsCollector::new(
            config.metrics_buffer_size,
            config.slow_request_threshold,
        ));
        let api_store = Arc::new(WindowStore::new(config.rate_limit_cache_size));
        let auth_store = Arc::new(WindowStore::new(config.rate_limit_cache_size));
        let csrf_tokens = Arc::new(TokenStore::new(config.csrf_token_cache_size));

        Self {
            config: Arc::new(config),
            collector,
            api_store,
            auth_store,
            csrf_tokens,
            started_at: Instant::now(),
        }
    }

    /// Rate limit layer for authentication routes.
    ///
    /// Uses the [`RateLimitPolicy::auth`] preset (tight quota, keyed by the
    /// submitted email) against the dedicated auth store. Embedding services
    /// apply this to their login/signup route group:
    ///
    /// ```rust,ignore
    /// let auth_routes = Router::new()
    ///     .route("/login", post(login))
    ///     .layer(state.auth_rate_limit_layer()?);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if the preset is misconfigured.
    pub fn auth_rate_limit_layer(&self) -> Result<RateLimitLayer, RateLimitError> {
        RateLimitLayer::new(RateLimitPolicy::auth(), self.auth_store.clone())
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
