//! # Reqgate
//!
//! Request governance middleware for Axum services: rate limiting, CSRF
//! protection, and request metrics as one composable stack.
//!
//! - **Rate Limiting**: Fixed-window counters per client key, with an LRU
//!   bound on tracked keys so memory stays flat under key floods
//! - **CSRF Protection**: Double-submit cookie validation with
//!   constant-time comparison and token rotation on success
//! - **Observability**: Correlation ids, structured logging, a bounded
//!   request sample buffer, and Prometheus export
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Observe → Rate Limit → CSRF → Trace → CORS)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, csrf token, metrics report, app routes)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Shared State (window stores, sample collector, config)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::{Router, routing::get};
//! use reqgate::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config);
//!
//!     let app_routes = Router::new().route("/api/hello", get(|| async { "hi" }));
//!     let app = build_router(state, app_routes)?;
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Governance Configuration
//!
//! Tune the general limiter:
//! ```bash
//! RATE_LIMIT_MAX_REQUESTS=100 RATE_LIMIT_WINDOW_MS=900000 cargo run
//! ```
//!
//! Allow plain-HTTP cookies in local development:
//! ```bash
//! CSRF_SECURE_COOKIES=false cargo run
//! ```

pub mod collector;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use collector::{AggregateStats, MetricsCollector, RequestSample};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use middleware::csrf::{CsrfConfig, CsrfLayer, TokenStore};
pub use middleware::rate_limit::{RateLimitLayer, RateLimitPolicy, WindowStore};
pub use routes::build_router;
pub use state::AppState;
