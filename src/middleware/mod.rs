//! HTTP middleware for request governance and observability.
//!
//! This module provides the production middleware components:
//!
//! - **Rate Limiting**: Fixed-window counters per client key with an LRU
//!   bound on tracked keys
//! - **CSRF Protection**: Double-submit cookie validation with constant-time
//!   comparison and rotation on success
//! - **Observation**: Correlation ids, timing, resource sampling, and the
//!   bounded request sample buffer
//! - **Client Keying**: Proxy-header client address extraction
//!
//! # Architecture
//!
//! ```text
//! Request → Observe → Rate Limiter → CSRF Guard → Handler → Response
//!              ↓           ↓             ↓
//!        x-request-id  429 + quota    403 Forbidden
//!                        headers
//! ```
//!
//! The observation layer sits outermost so that rejections produced by the
//! inner guards are sampled and counted like any other response.
//!
//! # Security Considerations
//!
//! - CSRF token comparison uses constant-time equality to prevent timing attacks
//! - Rate limiting prevents abuse and brute-force attempts
//! - Limiter memory is bounded against floods of spoofed client keys
//! - Correlation ids enable audit trails and debugging

pub mod csrf;
pub mod ip;
pub mod observe;
pub mod rate_limit;

pub use csrf::{CSRF_COOKIE_NAME, CSRF_HEADER_NAME, CsrfConfig, CsrfLayer, TokenStore};
pub use ip::{UNKNOWN_CLIENT, extract_client_key};
pub use observe::{ObserveLayer, REQUEST_ID_HEADER};
pub use rate_limit::{
    KeyPolicy, RateLimitError, RateLimitLayer, RateLimitPolicy, WindowStore,
};
