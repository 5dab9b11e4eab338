//! Integration tests for the chatgate server
//!
//! Drives the full router, with session, CSRF and CSP layers, against a
//! filesystem session store in a temporary directory.

use axum::{
    body::{Body, Bytes},
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use axum_test::TestServer;
use chatgate::{config::BackendChoice, CspPhase, GuardState, SecurityConfig};
use chatgate_server::{app, CHAT_PATH};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "integration-test-secret-0123456789abcdef";

async fn test_state(dir: &TempDir, phase: CspPhase) -> GuardState {
    let mut config = SecurityConfig {
        secret_key: SECRET.to_string(),
        ..SecurityConfig::default()
    };
    config.session.backend = BackendChoice::Filesystem;
    config.session.fallback_dir = dir.path().to_path_buf();
    config.session.secure_cookie = false;
    config.csp.phase = phase;
    GuardState::initialize(config)
        .await
        .expect("state should initialize")
}

async fn test_app(dir: &TempDir) -> (Router, GuardState) {
    let state = test_state(dir, CspPhase::ReportOnly).await;
    let router = app(state.clone()).expect("app should build");
    (router, state)
}

async fn body_bytes(res: Response) -> Bytes {
    axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .expect("body should be readable")
}

/// `name=value` part of the session cookie set on `res`.
fn session_cookie(res: &Response) -> String {
    let raw = res
        .headers()
        .get(header::SET_COOKIE)
        .expect("session cookie should be set")
        .to_str()
        .unwrap();
    raw.split(';').next().unwrap().to_string()
}

fn nonce_from_policy(policy: &str) -> String {
    let start = policy.find("'nonce-").expect("policy should carry a nonce") + "'nonce-".len();
    let end = policy[start..].find('\'').unwrap() + start;
    policy[start..end].to_string()
}

#[tokio::test]
async fn test_post_without_token_is_forbidden() {
    let dir = TempDir::new().unwrap();
    let (router, _) = test_app(&dir).await;
    let server = TestServer::new(router).unwrap();

    let response = server.post(CHAT_PATH).json(&json!({"message": "hi"})).await;

    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
    let body: Value = response.json();
    assert_eq!(body["code"], "CSRF_TOKEN_MISSING");
}

#[tokio::test]
async fn test_empty_csp_report_is_accepted() {
    let dir = TempDir::new().unwrap();
    let (router, state) = test_app(&dir).await;
    let server = TestServer::new(router).unwrap();

    let response = server
        .post("/api/csp-report")
        .content_type("application/csp-report")
        .bytes(Bytes::from_static(b"{}"))
        .await;

    assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
    assert_eq!(state.csp().violation_count(), 0);
}

#[tokio::test]
async fn test_csp_report_is_recorded_without_token() {
    let dir = TempDir::new().unwrap();
    let (router, state) = test_app(&dir).await;
    let server = TestServer::new(router).unwrap();

    let report = json!({"csp-report": {
        "document-uri": "http://localhost:5000/",
        "violated-directive": "script-src",
        "blocked-uri": "inline",
        "line-number": 12,
    }});
    let response = server
        .post("/api/csp-report")
        .content_type("application/csp-report")
        .bytes(Bytes::from(report.to_string()))
        .await;
    assert_eq!(response.status_code(), StatusCode::NO_CONTENT);

    let summary: Value = server.get("/api/csp-violations").await.json();
    assert_eq!(summary["total"], 1);
    assert_eq!(summary["by_directive"]["script-src"], 1);
    assert_eq!(summary["recent"][0]["line_number"], 12);
    assert_eq!(state.csp().violation_count(), 1);
}

#[tokio::test]
async fn test_csrf_token_endpoint() {
    let dir = TempDir::new().unwrap();
    let (router, _) = test_app(&dir).await;
    let server = TestServer::new(router).unwrap();

    let response = server.get("/api/csrf-token").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    let token = body["csrf_token"].as_str().unwrap();
    assert_eq!(token.len(), 32);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(body["expires_in"], 3600);
}

#[tokio::test]
async fn test_index_gets_report_only_policy_and_nonces() {
    let dir = TempDir::new().unwrap();
    let (router, _) = test_app(&dir).await;
    let server = TestServer::new(router).unwrap();

    let response = server.get("/").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let headers = response.headers();
    assert!(headers.get("content-security-policy").is_none());
    let policy = headers
        .get("content-security-policy-report-only")
        .expect("report-only policy should be set")
        .to_str()
        .unwrap()
        .to_string();
    assert!(policy.starts_with("default-src 'self'"));
    assert!(policy.ends_with("report-uri /api/csp-report"));

    let nonce = nonce_from_policy(&policy);
    let html = response.text();
    assert!(html.contains(&format!("<script nonce=\"{nonce}\">")));
    assert!(html.contains(&format!("<style nonce=\"{nonce}\">")));
}

#[tokio::test]
async fn test_strict_phase_enforces() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, CspPhase::Strict).await;
    let server = TestServer::new(app(state).unwrap()).unwrap();

    let response = server.get("/").await;
    let policy = response
        .headers()
        .get("content-security-policy")
        .expect("enforcing policy should be set")
        .to_str()
        .unwrap()
        .to_string();
    assert!(policy.contains("'strict-dynamic'"));
    assert!(policy.contains("block-all-mixed-content"));
    assert!(response
        .headers()
        .get("content-security-policy-report-only")
        .is_none());
}

#[tokio::test]
async fn test_api_responses_skip_csp() {
    let dir = TempDir::new().unwrap();
    let (router, _) = test_app(&dir).await;
    let server = TestServer::new(router).unwrap();

    let response = server.get("/api/health/session").await;
    assert!(response
        .headers()
        .get("content-security-policy-report-only")
        .is_none());
}

#[tokio::test]
async fn test_session_health() {
    let dir = TempDir::new().unwrap();
    let (router, _) = test_app(&dir).await;
    let server = TestServer::new(router).unwrap();

    let health: Value = server.get("/api/health/session").await.json();
    assert_eq!(health["backend"], "filesystem");
    assert_eq!(health["connected"], true);
    assert_eq!(health["fallback_active"], false);
}

#[tokio::test]
async fn test_chat_round_trip_rotates_token() {
    let dir = TempDir::new().unwrap();
    let (router, _) = test_app(&dir).await;

    let res = router
        .clone()
        .oneshot(
            Request::get("/api/csrf-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let cookie = session_cookie(&res);
    let body: Value = serde_json::from_slice(&body_bytes(res).await).unwrap();
    let token = body["csrf_token"].as_str().unwrap().to_string();

    let chat = |token: String| {
        Request::post(CHAT_PATH)
            .header(header::COOKIE, cookie.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"message": " hello ", "csrf_token": token}).to_string(),
            ))
            .unwrap()
    };

    let res = router.clone().oneshot(chat(token.clone())).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let rotated = res
        .headers()
        .get("x-csrf-token")
        .expect("rotated token should be returned")
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(rotated, token);
    let reply: Value = serde_json::from_slice(&body_bytes(res).await).unwrap();
    assert_eq!(reply["reply"], "You said: hello");
    assert_eq!(reply["turns"], 1);

    // The consumed token is no longer accepted
    let res = router.clone().oneshot(chat(token)).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(&body_bytes(res).await).unwrap();
    assert_eq!(body["code"], "CSRF_TOKEN_INVALID");

    let res = router.oneshot(chat(rotated)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let reply: Value = serde_json::from_slice(&body_bytes(res).await).unwrap();
    assert_eq!(reply["turns"], 2);
}

#[tokio::test]
async fn test_header_token_is_accepted() {
    let dir = TempDir::new().unwrap();
    let (router, _) = test_app(&dir).await;

    let res = router
        .clone()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let cookie = session_cookie(&res);
    let html = String::from_utf8(body_bytes(res).await.to_vec()).unwrap();
    let marker = "name=\"csrf-token\" content=\"";
    let start = html.find(marker).unwrap() + marker.len();
    let token = &html[start..start + 32];

    let res = router
        .oneshot(
            Request::post(CHAT_PATH)
                .header(header::COOKIE, cookie)
                .header(header::CONTENT_TYPE, "application/json")
                .header("X-CSRFToken", token)
                .body(Body::from(r#"{"message":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}
