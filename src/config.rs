//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible
//! defaults for development. In production, configure via environment
//! variables or a `.env` file.
//!
//! # Governance Tuning
//!
//! - `RATE_LIMIT_WINDOW_MS`: General API rate limit window (default: 15 minutes)
//! - `RATE_LIMIT_MAX_REQUESTS`: Requests allowed per window (default: 100)
//! - `RATE_LIMIT_CACHE_SIZE`: Hard cap on tracked keys (default: 10000)
//! - `SLOW_REQUEST_THRESHOLD_MS`: Duration above which a request logs as slow (default: 1000)
//! - `METRICS_BUFFER_SIZE`: Request sample ring buffer capacity (default: 1000)
//! - `CSRF_TOKEN_TTL_SECS`: Token cookie lifetime (default: 24 hours)

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Maximum request body size in bytes (default: 10MB)
    /// Prevents denial-of-service via large payloads
    pub max_request_body_size: usize,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// General API rate limit window length (default: 15 minutes)
    pub rate_limit_window: Duration,

    /// Requests allowed per key per window (default: 100)
    /// Set to 0 to disable the general limiter
    pub rate_limit_max_requests: u32,

    /// Hard maximum number of tracked keys before LRU eviction (default: 10000).
    /// Bounds limiter memory against floods of unique (spoofed) keys.
    pub rate_limit_cache_size: usize,

    // =========================================================================
    // CSRF Configuration
    // =========================================================================
    /// Lifetime of an issued CSRF token cookie (default: 24 hours)
    pub csrf_token_ttl: Duration,

    /// Whether CSRF cookies carry the `Secure` attribute (default: true).
    /// Disable only for local development over plain HTTP.
    pub csrf_secure_cookies: bool,

    /// Hard cap on concurrently valid CSRF tokens before LRU eviction
    /// (default: 10000). Bounds single-use token tracking memory.
    pub csrf_token_cache_size: usize,

    // =========================================================================
    // Request Metrics Configuration
    // =========================================================================
    /// Capacity of the request sample ring buffer (default: 1000)
    pub metrics_buffer_size: usize,

    /// Requests slower than this are logged as warnings (default: 1000ms)
    pub slow_request_threshold: Duration,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any configuration value is invalid
    /// (e.g., non-numeric PORT value, zero-sized buffers).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?,

            // Rate limiting
            rate_limit_window: Duration::from_millis(Self::parse_env(
                "RATE_LIMIT_WINDOW_MS",
                900_000,
            )?),
            rate_limit_max_requests: Self::parse_env("RATE_LIMIT_MAX_REQUESTS", 100)?,
            rate_limit_cache_size: Self::parse_env("RATE_LIMIT_CACHE_SIZE", 10_000)?,

            // CSRF
            csrf_token_ttl: Duration::from_secs(Self::parse_env("CSRF_TOKEN_TTL_SECS", 86_400)?),
            csrf_secure_cookies: Self::parse_env("CSRF_SECURE_COOKIES", true)?,
            csrf_token_cache_size: Self::parse_env("CSRF_TOKEN_CACHE_SIZE", 10_000)?,

            // Request metrics
            metrics_buffer_size: Self::parse_env("METRICS_BUFFER_SIZE", 1000)?,
            slow_request_threshold: Duration::from_millis(Self::parse_env(
                "SLOW_REQUEST_THRESHOLD_MS",
                1000,
            )?),

            // Security
            cors_allowed_origins: Self::parse_cors_origins(),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    fn validate(&self) -> AppResult<()> {
        if self.rate_limit_window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW_MS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_cache_size == 0 {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_CACHE_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.metrics_buffer_size == 0 {
            return Err(AppError::ConfigError(
                "METRICS_BUFFER_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.csrf_token_ttl.is_zero() {
            return Err(AppError::ConfigError(
                "CSRF_TOKEN_TTL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.csrf_token_cache_size == 0 {
            return Err(AppError::ConfigError(
                "CSRF_TOKEN_CACHE_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the general API rate limiter is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_max_requests > 0
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr + ToString,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse CORS allowed origins from environment variable.
    fn parse_cors_origins() -> Vec<String> {
        env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            // Rate limiting
            rate_limit_window: Duration::from_secs(15 * 60),
            rate_limit_max_requests: 100,
            rate_limit_cache_size: 10_000,
            // CSRF
            csrf_token_ttl: Duration::from_secs(24 * 60 * 60),
            csrf_secure_cookies: true,
            csrf_token_cache_size: 10_000,
            // Request metrics
            metrics_buffer_size: 1000,
            slow_request_threshold: Duration::from_millis(1000),
            // Security
            cors_allowed_origins: vec!["*".to_string()],
            // Observability
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}
