//! HTTP request handlers for the built-in endpoints.
//!
//! The crate's own surface is deliberately small: a health probe, the CSRF
//! token endpoint, and the internal metrics report. Application routes are
//! merged in by the embedding service via [`crate::routes::build_router`].

pub mod csrf;
pub mod health;
pub mod metrics;

pub use csrf::issue_csrf_token;
pub use health::health_check;
pub use metrics::metrics_report;
