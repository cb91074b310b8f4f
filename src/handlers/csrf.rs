//! CSRF token endpoint.
//!
//! `GET /csrf/token` - mints a fresh token and delivers it twice: in the
//! http-only cookie (which the browser will attach automatically) and in
//! the JSON body (which first-party JavaScript echoes back in the
//! `x-csrf-token` header on state-changing requests).

use axum::Json;
use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::response::{AppendHeaders, IntoResponse};
use tracing::instrument;

use crate::middleware::csrf::{build_cookie, mint_token};
use crate::models::CsrfTokenResponse;
use crate::state::AppState;

/// Issue a fresh CSRF token.
///
/// The token is registered as single-use: it validates exactly one
/// state-changing request, whose response carries the next token.
///
/// # Response Body
///
/// ```json
/// { "token": "9f86d081884c7d65..." }
/// ```
#[instrument(skip(state))]
pub async fn issue_csrf_token(State(state): State<AppState>) -> impl IntoResponse {
    let token = mint_token();
    state.csrf_tokens.register(&token);
    let cookie = build_cookie(
        &token,
        state.config.csrf_token_ttl,
        state.config.csrf_secure_cookies,
    );

    (
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(CsrfTokenResponse { token }),
    )
}
