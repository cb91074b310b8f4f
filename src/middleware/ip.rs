//! Client address extraction for rate limit keying.
//!
//! The rate limiter's default key is the client address taken from proxy
//! headers. Parsing short-circuits on the first match and uses
//! `Cow<'static, str>` so the shared "unknown" fallback never allocates.
//!
//! # Security Warning: Spoofing Risk
//!
//! These headers are client-controlled. Per-key limiting is only meaningful
//! when this service sits behind a reverse proxy that overwrites (not
//! appends to) `X-Forwarded-For`/`X-Real-IP`. Requests without either header
//! all share the `"unknown"` key, which collectively rate-limits headerless
//! traffic rather than letting it bypass accounting entirely.

use std::borrow::Cow;

use axum::http::Request;

/// Fallback key when no client address can be determined.
///
/// Monitor for high "unknown" traffic in production: it usually means a
/// misconfigured proxy in front of this service.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Extract the client address from request headers.
///
/// # Header Priority
///
/// Checks in order (returns first match):
/// 1. `X-Forwarded-For` header (first address in a comma-separated list —
///    the original client, with subsequent entries being intermediate proxies)
/// 2. `X-Real-IP` header
/// 3. Falls back to [`UNKNOWN_CLIENT`]
///
/// # Returns
///
/// `Cow<'static, str>` - borrowed for the fallback (no allocation), owned
/// for actual addresses. Use `.into_owned()` when the key must outlive the
/// request reference.
#[inline]
pub fn extract_client_key<B>(req: &Request<B>) -> Cow<'static, str> {
    // X-Forwarded-For format: "client, proxy1, proxy2"
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
    {
        return Cow::Owned(first.trim().to_string());
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        return Cow::Owned(value.trim().to_string());
    }

    Cow::Borrowed(UNKNOWN_CLIENT)
}
