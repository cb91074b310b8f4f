//! CSRF protection middleware using the double-submit-cookie pattern.
//!
//! # Protocol
//!
//! A random token lives in an http-only, SameSite=Strict cookie. Browsers
//! attach the cookie automatically; legitimate first-party JavaScript echoes
//! the same value in the `x-csrf-token` header (obtained from the token
//! endpoint). A cross-site attacker can trigger the cookie but cannot read
//! it, so it cannot produce a matching header.
//!
//! State machine per client:
//!
//! - **Unissued** → the first safe-method response sets a fresh token cookie
//!   and registers the token in the server-side [`TokenStore`].
//! - **Issued** → state-changing requests must echo the token in the header.
//! - **Validating** → cookie and header are compared in constant time, then
//!   the token is spent atomically in the store; missing cookie, missing
//!   header, mismatch, and replay of a spent token are distinct diagnostics
//!   but one user-visible outcome (403, handler never invoked).
//! - **Validated → Rotated** → after the inner handler completes
//!   successfully, a new token is registered and set, invalidating the
//!   previous value. When the handler errors, rotation is skipped and the
//!   spent token is restored so the client's retry still validates.
//!
//! # Security Properties
//!
//! - Tokens are 32 bytes from a cryptographically secure RNG, hex-encoded,
//!   never derived from request input.
//! - Comparison uses `subtle::ConstantTimeEq` to avoid timing side channels.
//! - Each token validates at most once: consumption from the store is atomic
//!   under its lock, so of two concurrent requests presenting the same pair
//!   exactly one is admitted.
//! - Security logs carry the request context, never the token value.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use lru::LruCache;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::error::ErrorBody;

/// Cookie name holding the CSRF token.
pub const CSRF_COOKIE_NAME: &str = "csrf-token";

/// Request header expected to echo the cookie token.
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";

/// Raw token length in bytes (hex-encoded to twice this many characters).
const CSRF_TOKEN_BYTES: usize = 32;

/// Why a state-changing request failed CSRF validation.
///
/// Three distinct conditions for internal diagnostics; all map to the same
/// 403 so the rejection leaks nothing about which side was wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsrfRejection {
    MissingCookie,
    MissingHeader,
    Mismatch,
    /// Cookie and header matched, but the token was already spent (or was
    /// never issued by this server).
    Replayed,
}

impl CsrfRejection {
    fn reason(self) -> &'static str {
        match self {
            CsrfRejection::MissingCookie => "missing_cookie",
            CsrfRejection::MissingHeader => "missing_header",
            CsrfRejection::Mismatch => "token_mismatch",
            CsrfRejection::Replayed => "token_replayed",
        }
    }
}

/// Server-side registry of currently-valid tokens.
///
/// Double-submit comparison alone cannot make a token single-use: a captured
/// cookie/header pair would replay until the cookie expires. Every issued
/// token is registered here and spent atomically on its first successful
/// validation, so a second presentation of the same pair is rejected even
/// though cookie and header still match.
///
/// LRU-bounded like the rate limiter's window store; evicting the coldest
/// token under a flood costs that client one re-issue round trip.
pub struct TokenStore {
    tokens: Mutex<LruCache<String, ()>>,
}

impl TokenStore {
    /// Create a store bounded to `capacity` concurrently valid tokens.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            tokens: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Mark a token as valid for exactly one future validation.
    pub fn register(&self, token: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(token.to_string(), ());
    }

    /// Spend a token. Returns `false` when it was never issued, already
    /// spent, or evicted; check-and-remove is one atomic unit under the
    /// lock, so concurrent presenters of the same token cannot both win.
    pub fn consume(&self, token: &str) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(token)
            .is_some()
    }

    /// Number of currently valid tokens.
    pub fn len(&self) -> usize {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no tokens are currently valid.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mint a fresh CSRF token from the thread-local CSPRNG.
pub fn mint_token() -> String {
    let mut bytes = [0u8; CSRF_TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);

    use std::fmt::Write;

    let mut token = String::with_capacity(CSRF_TOKEN_BYTES * 2);
    for byte in bytes {
        // Writing to a String cannot fail.
        let _ = write!(token, "{byte:02x}");
    }
    token
}

/// Render the Set-Cookie value for a token.
///
/// Attributes follow the double-submit hardening baseline: http-only (no
/// script access), SameSite=Strict, path-wide, bounded lifetime, and
/// `Secure` unless explicitly disabled for plain-HTTP development.
pub fn build_cookie(token: &str, ttl: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{CSRF_COOKIE_NAME}={token}; Path=/; Max-Age={}; HttpOnly; SameSite=Strict",
        ttl.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Extract the CSRF token from the request's Cookie header(s).
fn cookie_token(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, token)) = pair.trim().split_once('=')
                && name == CSRF_COOKIE_NAME
                && !token.is_empty()
            {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Extract the echoed token from the CSRF request header.
fn header_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CSRF_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Compare the cookie and header tokens.
///
/// The comparison is constant-time so response timing reveals nothing about
/// how many leading bytes matched.
fn validate(cookie: Option<&str>, header: Option<&str>) -> Result<(), CsrfRejection> {
    let cookie = cookie.ok_or(CsrfRejection::MissingCookie)?;
    let header = header.ok_or(CsrfRejection::MissingHeader)?;

    if cookie.as_bytes().ct_eq(header.as_bytes()).into() {
        Ok(())
    } else {
        Err(CsrfRejection::Mismatch)
    }
}

/// Configuration for the CSRF guard.
#[derive(Debug, Clone, Copy)]
pub struct CsrfConfig {
    /// Cookie lifetime; an expired cookie is simply absent on the next
    /// request, forcing re-issuance.
    pub token_ttl: Duration,
    /// Whether cookies carry the `Secure` attribute.
    pub secure_cookies: bool,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(24 * 60 * 60),
            secure_cookies: true,
        }
    }
}

/// CSRF guard layer for the Tower middleware stack.
#[derive(Clone)]
pub struct CsrfLayer {
    config: Arc<CsrfConfig>,
    tokens: Arc<TokenStore>,
}

impl CsrfLayer {
    /// Create a CSRF layer over a shared token registry.
    ///
    /// The registry is shared with the token endpoint so tokens minted
    /// there validate here.
    pub fn new(config: CsrfConfig, tokens: Arc<TokenStore>) -> Self {
        Self {
            config: Arc::new(config),
            tokens,
        }
    }
}

impl<S> Layer<S> for CsrfLayer {
    type Service = CsrfService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CsrfService {
            inner,
            config: self.config.clone(),
            tokens: self.tokens.clone(),
        }
    }
}

/// CSRF guard service wrapper.
#[derive(Clone)]
pub struct CsrfService<S> {
    inner: S,
    config: Arc<CsrfConfig>,
    tokens: Arc<TokenStore>,
}

impl<S> Service<Request<Body>> for CsrfService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let config = self.config.clone();
        let tokens = self.tokens.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // Safe methods bypass validation but receive a token when the
            // client has none yet (the Unissued → Issued transition).
            if req.method().is_safe() {
                let needs_token = cookie_token(req.headers()).is_none();
                let mut response = inner.call(req).await?;
                // The token endpoint sets its own cookie; don't clobber it.
                if needs_token && !sets_token_cookie(response.headers()) {
                    issue_token(response.headers_mut(), &config, &tokens);
                }
                return Ok(response);
            }

            let cookie = cookie_token(req.headers());
            let header = header_token(req.headers());

            let rejection = match validate(cookie.as_deref(), header.as_deref()) {
                Err(rejection) => Some(rejection),
                // The pair matches; now spend the token. Exactly one of any
                // concurrent presenters of the same token gets past this.
                Ok(()) if !tokens.consume(cookie.as_deref().unwrap_or_default()) => {
                    Some(CsrfRejection::Replayed)
                }
                Ok(()) => None,
            };

            if let Some(rejection) = rejection {
                // Security event: context only, never the token itself.
                warn!(
                    method = %req.method(),
                    path = %req.uri().path(),
                    reason = rejection.reason(),
                    "CSRF validation failed"
                );
                crate::metrics::record_csrf_rejection(rejection.reason());

                return Ok(rejection_response());
            }

            debug!(path = %req.uri().path(), "CSRF token validated");

            let mut response = inner.call(req).await?;

            if response.status().as_u16() < 400 {
                // Rotate: the spent token stays spent, a fresh one replaces it.
                issue_token(response.headers_mut(), &config, &tokens);
            } else if let Some(token) = cookie {
                // A failed mutation restores the spent token so the client's
                // retry with the same pair still validates.
                tokens.register(&token);
            }

            Ok(response)
        })
    }
}

/// Mint, register, and set a fresh token on a response.
fn issue_token(headers: &mut HeaderMap, config: &CsrfConfig, tokens: &TokenStore) {
    let token = mint_token();
    tokens.register(&token);
    set_token_cookie(headers, &token, config);
}

/// Whether a response already sets the token cookie.
fn sets_token_cookie(headers: &HeaderMap) -> bool {
    headers.get_all(SET_COOKIE).iter().any(|value| {
        value.to_str().is_ok_and(|s| {
            s.strip_prefix(CSRF_COOKIE_NAME)
                .is_some_and(|rest| rest.starts_with('='))
        })
    })
}

/// Set (or rotate) the token cookie on a response.
fn set_token_cookie(headers: &mut HeaderMap, token: &str, config: &CsrfConfig) {
    let cookie = build_cookie(token, config.token_ttl, config.secure_cookies);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        headers.insert(SET_COOKIE, value);
    }
}

/// Build the 403 rejection response shared by all failure conditions.
fn rejection_response() -> Response<Body> {
    (
        StatusCode::FORBIDDEN,
        axum::Json(ErrorBody::new("invalid_csrf_token", "Invalid CSRF token")),
    )
        .into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_token_is_hex_of_expected_length() {
        let token = mint_token();
        assert_eq!(token.len(), CSRF_TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_mint_token_is_unique() {
        assert_ne!(mint_token(), mint_token());
    }

    #[test]
    fn test_build_cookie_attributes() {
        let cookie = build_cookie("abc123", Duration::from_secs(3600), true);
        assert!(cookie.starts_with("csrf-token=abc123"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Secure"));
    }

    #[test]
    fn test_build_cookie_without_secure() {
        let cookie = build_cookie("abc123", Duration::from_secs(3600), false);
        assert!(!cookie.contains("Secure"));
    }

    #[test]
    fn test_cookie_token_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("session=xyz; csrf-token=deadbeef; theme=dark"),
        );

        assert_eq!(cookie_token(&headers), Some("deadbeef".to_string()));
    }

    #[test]
    fn test_cookie_token_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("session=xyz"));

        assert_eq!(cookie_token(&headers), None);
    }

    #[test]
    fn test_validate_missing_cookie() {
        assert_eq!(
            validate(None, Some("t")),
            Err(CsrfRejection::MissingCookie)
        );
    }

    #[test]
    fn test_validate_missing_header() {
        assert_eq!(
            validate(Some("t"), None),
            Err(CsrfRejection::MissingHeader)
        );
    }

    #[test]
    fn test_validate_mismatch() {
        assert_eq!(
            validate(Some("aaaa"), Some("bbbb")),
            Err(CsrfRejection::Mismatch)
        );
    }

    #[test]
    fn test_validate_match() {
        assert!(validate(Some("deadbeef"), Some("deadbeef")).is_ok());
    }

    #[test]
    fn test_validate_different_lengths_mismatch() {
        assert_eq!(
            validate(Some("short"), Some("much-longer-token")),
            Err(CsrfRejection::Mismatch)
        );
    }

    #[test]
    fn test_token_spends_exactly_once() {
        let store = TokenStore::new(16);
        store.register("tok");

        assert!(store.consume("tok"));
        assert!(!store.consume("tok"));
    }

    #[test]
    fn test_unknown_token_does_not_consume() {
        let store = TokenStore::new(16);
        assert!(!store.consume("never-issued"));
    }

    #[test]
    fn test_token_store_is_bounded() {
        let store = TokenStore::new(10);
        for i in 0..100 {
            store.register(&format!("tok-{i}"));
        }
        assert!(store.len() <= 10);
    }

    #[test]
    fn test_concurrent_consumers_single_winner() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(TokenStore::new(16));
        store.register("shared");

        let wins: usize = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || usize::from(store.consume("shared")))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert_eq!(wins, 1);
    }
}
