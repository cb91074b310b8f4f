//! End-to-end tests for the governance middleware stack.
//!
//! These drive a fully assembled router in-process with `tower::ServiceExt`,
//! covering the rate limiter's quota accounting and headers, the CSRF
//! protocol (issuance, validation, rotation), and request sample collection.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{Request, Response, StatusCode};
use axum::routing::{get, post};
use tower::ServiceExt;

use reqgate::{AppState, Config, build_router};

fn test_config(max: u32, window: Duration) -> Config {
    Config {
        rate_limit_max_requests: max,
        rate_limit_window: window,
        csrf_secure_cookies: false,
        metrics_port: 0,
        ..Config::default()
    }
}

/// Assemble a governed app with one GET and one POST route.
fn app(config: Config) -> (Router, AppState, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let get_hits = hits.clone();
    let post_hits = hits.clone();

    let routes = Router::new()
        .route(
            "/api/ping",
            get(move || {
                let hits = get_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "pong"
                }
            }),
        )
        .route(
            "/api/submit",
            post(move || {
                let hits = post_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "accepted"
                }
            }),
        )
        .route(
            "/api/fail",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );

    let state = AppState::new(config);
    let router = build_router(state.clone(), routes).unwrap();
    (router, state, hits)
}

fn get_request(path: &str, client: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("x-forwarded-for", client)
        .body(Body::empty())
        .unwrap()
}

fn post_request(path: &str, client: &str, cookie: Option<&str>, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("x-forwarded-for", client);
    if let Some(cookie) = cookie {
        builder = builder.header(COOKIE, format!("csrf-token={cookie}"));
    }
    if let Some(token) = token {
        builder = builder.header("x-csrf-token", token);
    }
    builder.body(Body::empty()).unwrap()
}

fn header(res: &Response<Body>, name: &str) -> Option<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn set_cookie_token(res: &Response<Body>) -> Option<String> {
    res.headers().get_all(SET_COOKIE).iter().find_map(|v| {
        let s = v.to_str().ok()?;
        let rest = s.strip_prefix("csrf-token=")?;
        rest.split(';').next().map(|t| t.to_string())
    })
}

async fn json_body(res: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// =============================================================================
// Rate Limiting
// =============================================================================

#[tokio::test]
async fn quota_headers_count_down_then_reject() {
    let (app, _, _) = app(test_config(3, Duration::from_secs(60)));

    for expected_remaining in ["2", "1", "0"] {
        let res = app
            .clone()
            .oneshot(get_request("/api/ping", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(header(&res, "x-ratelimit-limit").as_deref(), Some("3"));
        assert_eq!(
            header(&res, "x-ratelimit-remaining").as_deref(),
            Some(expected_remaining)
        );
        assert!(header(&res, "x-ratelimit-reset").is_some());
    }

    let res = app
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&res, "x-ratelimit-remaining").as_deref(), Some("0"));
    assert!(header(&res, "retry-after").is_some());

    let body = json_body(res).await;
    assert_eq!(body["error"], "rate_limited");
}

#[tokio::test]
async fn handler_is_not_invoked_past_quota() {
    let (app, _, hits) = app(test_config(2, Duration::from_secs(60)));

    for _ in 0..5 {
        let _ = app
            .clone()
            .oneshot(get_request("/api/ping", "10.0.0.2"))
            .await
            .unwrap();
    }

    // Five attempts against max=2: the handler ran exactly twice.
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn window_rollover_restores_quota() {
    let (app, _, _) = app(test_config(2, Duration::from_millis(300)));

    for _ in 0..2 {
        let res = app
            .clone()
            .oneshot(get_request("/api/ping", "10.0.0.3"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    let res = app
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.3"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let res = app
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.3"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header(&res, "x-ratelimit-remaining").as_deref(), Some("1"));
}

#[tokio::test]
async fn clients_are_limited_independently() {
    let (app, _, _) = app(test_config(1, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.4"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.4"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

    // A different client still has its full quota.
    let res = app
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn limiter_can_be_disabled() {
    let (app, _, _) = app(test_config(0, Duration::from_secs(60)));

    for _ in 0..10 {
        let res = app
            .clone()
            .oneshot(get_request("/api/ping", "10.0.0.6"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(header(&res, "x-ratelimit-limit").is_none());
    }
}

// =============================================================================
// CSRF Protection
// =============================================================================

#[tokio::test]
async fn safe_request_issues_token_cookie() {
    let (app, _, _) = app(test_config(100, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(get_request("/api/ping", "10.1.0.1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let token = set_cookie_token(&res).unwrap();
    assert_eq!(token.len(), 64);
}

#[tokio::test]
async fn token_endpoint_body_matches_cookie() {
    let (app, _, _) = app(test_config(100, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(get_request("/csrf/token", "10.1.0.2"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let cookie = set_cookie_token(&res).unwrap();
    let body = json_body(res).await;
    assert_eq!(body["token"], cookie.as_str());
}

#[tokio::test]
async fn post_without_token_is_forbidden() {
    let (app, _, hits) = app(test_config(100, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(post_request("/api/submit", "10.1.0.3", None, None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let body = json_body(res).await;
    assert_eq!(body["error"], "invalid_csrf_token");
}

#[tokio::test]
async fn post_with_mismatched_token_is_forbidden() {
    let (app, _, hits) = app(test_config(100, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(post_request(
            "/api/submit",
            "10.1.0.4",
            Some("aaaa"),
            Some("bbbb"),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn valid_token_admits_and_rotates() {
    let (app, _, _) = app(test_config(100, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(get_request("/csrf/token", "10.1.0.5"))
        .await
        .unwrap();
    let token = set_cookie_token(&res).unwrap();

    let res = app
        .clone()
        .oneshot(post_request(
            "/api/submit",
            "10.1.0.5",
            Some(&token),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Success rotated the token.
    let rotated = set_cookie_token(&res).unwrap();
    assert_ne!(rotated, token);

    // The old token no longer validates against the new cookie.
    let res = app
        .clone()
        .oneshot(post_request(
            "/api/submit",
            "10.1.0.5",
            Some(&rotated),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // The rotated pair validates.
    let res = app
        .clone()
        .oneshot(post_request(
            "/api/submit",
            "10.1.0.5",
            Some(&rotated),
            Some(&rotated),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn same_token_pair_is_accepted_only_once() {
    let (app, _, hits) = app(test_config(100, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(get_request("/csrf/token", "10.1.0.7"))
        .await
        .unwrap();
    let token = set_cookie_token(&res).unwrap();

    let res = app
        .clone()
        .oneshot(post_request(
            "/api/submit",
            "10.1.0.7",
            Some(&token),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Replaying the identical pair (cookie and header still match) is
    // rejected: the token was spent by the first request.
    let res = app
        .clone()
        .oneshot(post_request(
            "/api/submit",
            "10.1.0.7",
            Some(&token),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_requests_with_one_token_admit_exactly_one() {
    let (app, _, hits) = app(test_config(100, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(get_request("/csrf/token", "10.1.0.8"))
        .await
        .unwrap();
    let token = set_cookie_token(&res).unwrap();

    let (first, second) = tokio::join!(
        app.clone().oneshot(post_request(
            "/api/submit",
            "10.1.0.8",
            Some(&token),
            Some(&token),
        )),
        app.clone().oneshot(post_request(
            "/api/submit",
            "10.1.0.8",
            Some(&token),
            Some(&token),
        )),
    );

    let statuses = [first.unwrap().status(), second.unwrap().status()];
    assert_eq!(
        statuses.iter().filter(|s| **s == StatusCode::OK).count(),
        1
    );
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == StatusCode::FORBIDDEN)
            .count(),
        1
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_handler_does_not_rotate() {
    let (app, _, _) = app(test_config(100, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(get_request("/csrf/token", "10.1.0.6"))
        .await
        .unwrap();
    let token = set_cookie_token(&res).unwrap();

    let res = app
        .clone()
        .oneshot(post_request(
            "/api/fail",
            "10.1.0.6",
            Some(&token),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(set_cookie_token(&res).is_none());

    // The unrotated token remains valid for the retry.
    let res = app
        .clone()
        .oneshot(post_request(
            "/api/submit",
            "10.1.0.6",
            Some(&token),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

// =============================================================================
// Request Metrics
// =============================================================================

#[tokio::test]
async fn requests_are_sampled_including_rejections() {
    let (app, state, _) = app(test_config(2, Duration::from_secs(60)));

    for _ in 0..3 {
        let _ = app
            .clone()
            .oneshot(get_request("/api/ping", "10.2.0.1"))
            .await
            .unwrap();
    }

    let stats = state.collector.compute_stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.status_codes.get(&200), Some(&2));
    // The 429 was produced by the limiter, yet still observed.
    assert_eq!(stats.status_codes.get(&429), Some(&1));
}

#[tokio::test]
async fn metrics_report_endpoint_serves_aggregates() {
    let (app, _, _) = app(test_config(100, Duration::from_secs(60)));

    let _ = app
        .clone()
        .oneshot(get_request("/api/ping", "10.2.0.2"))
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(get_request("/internal/metrics", "10.2.0.3"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body = json_body(res).await;
    assert_eq!(body["stats"]["total_requests"], 1);
    let recent = body["recent_requests"].as_array().unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0]["path"], "/api/ping");
    assert_eq!(recent[0]["status"], 200);

    // Host context rides along with the request figures.
    assert!(body["system"]["uptime_seconds"].as_u64().is_some());
    assert!(body["system"]["total_memory_bytes"].as_u64().is_some());
    assert!(body["system"]["load_average_1m"].as_f64().is_some());
}

#[tokio::test]
async fn auth_limiter_keys_by_submitted_email() {
    let state = AppState::new(test_config(100, Duration::from_secs(60)));
    let app = Router::new()
        .route("/login", post(|| async { "ok" }))
        .layer(state.auth_rate_limit_layer().unwrap());

    let login = |email: &str| {
        Request::builder()
            .method("POST")
            .uri("/login")
            .header("x-forwarded-for", "10.3.0.1")
            .body(Body::from(format!(r#"{{"email":"{email}"}}"#)))
            .unwrap()
    };

    for _ in 0..5 {
        let res = app
            .clone()
            .oneshot(login("alice@example.com"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    let res = app
        .clone()
        .oneshot(login("alice@example.com"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

    // A different identity from the same address is unaffected.
    let res = app
        .clone()
        .oneshot(login("bob@example.com"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let (app, _, _) = app(test_config(100, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(get_request("/api/ping", "10.2.0.4"))
        .await
        .unwrap();
    assert!(header(&res, "x-request-id").is_some());

    // An incoming id is propagated unchanged.
    let req = Request::builder()
        .method("GET")
        .uri("/api/ping")
        .header("x-forwarded-for", "10.2.0.4")
        .header("x-request-id", "trace-me-123")
        .body(Body::empty())
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(header(&res, "x-request-id").as_deref(), Some("trace-me-123"));
}

#[tokio::test]
async fn health_endpoint_reports_healthy() {
    let (app, _, _) = app(test_config(100, Duration::from_secs(60)));

    let res = app
        .clone()
        .oneshot(get_request("/health", "10.2.0.5"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body = json_body(res).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}
