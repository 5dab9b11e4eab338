//! HTTP endpoints of the security layer.
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .merge(chatgate::routes::router())
//!     .with_state(state.clone());
//! let app = chatgate::protect(app, &state)?;
//! ```
//!
//! The violation endpoints are operator tools and carry no authentication of
//! their own.

use crate::csp::ViolationSummary;
use crate::session::{BackendHealth, SessionHandle};
use crate::state::GuardState;
use axum::{
    extract::{Query, Request, State},
    http::{header::USER_AGENT, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Path of the token endpoint.
pub const CSRF_TOKEN_PATH: &str = "/api/csrf-token";
/// Path of the violation ingestion endpoint.
pub const CSP_REPORT_PATH: &str = "/api/csp-report";
/// Path of the violation summary endpoint.
pub const CSP_VIOLATIONS_PATH: &str = "/api/csp-violations";
/// Path of the session backend health endpoint.
pub const SESSION_HEALTH_PATH: &str = "/api/health/session";

const DEFAULT_RECENT: usize = 20;

/// Largest violation report body that is parsed. Bigger bodies are dropped.
pub const MAX_REPORT_BYTES: usize = 64 * 1024;

/// Security routes, to be merged into the application router.
pub fn router() -> Router<GuardState> {
    Router::new()
        .route(CSRF_TOKEN_PATH, get(csrf_token))
        .route(CSP_REPORT_PATH, post(csp_report))
        .route(
            CSP_VIOLATIONS_PATH,
            get(csp_violations).delete(clear_csp_violations),
        )
        .route(SESSION_HEALTH_PATH, get(session_health))
}

/// Response for the token endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct CsrfTokenResponse {
    /// Live token for this session
    pub csrf_token: String,
    /// Token lifetime in seconds
    pub expires_in: u64,
}

/// `GET /api/csrf-token`
pub async fn csrf_token(
    State(state): State<GuardState>,
    session: SessionHandle,
) -> Json<CsrfTokenResponse> {
    let csrf_token = state.csrf().get_or_create(&mut session.lock());
    Json(CsrfTokenResponse {
        csrf_token,
        expires_in: state.csrf().lifetime_seconds(),
    })
}

/// `POST /api/csp-report`
///
/// Always answers 204, whatever the body. Browsers send
/// `application/csp-report`, so the body is read and parsed by hand, under
/// its own size bound rather than the extractor default.
pub async fn csp_report(State(state): State<GuardState>, req: Request) -> StatusCode {
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = match axum::body::to_bytes(req.into_body(), MAX_REPORT_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            debug!(error = %err, "Ignoring unreadable or oversized CSP report");
            return StatusCode::NO_CONTENT;
        }
    };
    if let Ok(report) = serde_json::from_slice::<serde_json::Value>(&body) {
        state.csp().record_violation(&report, user_agent.as_deref());
    } else {
        debug!(bytes = body.len(), "Ignoring non-JSON CSP report");
    }
    StatusCode::NO_CONTENT
}

/// Query for the violation summary
#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    /// How many raw records to include
    pub recent: Option<usize>,
}

/// `GET /api/csp-violations?recent=N`
pub async fn csp_violations(
    State(state): State<GuardState>,
    Query(query): Query<RecentQuery>,
) -> Json<ViolationSummary> {
    Json(state.csp().summarize(query.recent.unwrap_or(DEFAULT_RECENT)))
}

/// Response for clearing violations
#[derive(Debug, Serialize, Deserialize)]
pub struct ClearedResponse {
    /// Records removed
    pub cleared: usize,
}

/// `DELETE /api/csp-violations`
pub async fn clear_csp_violations(State(state): State<GuardState>) -> Json<ClearedResponse> {
    let cleared = state.csp().clear_violations();
    info!(cleared, "CSP violation buffer cleared");
    Json(ClearedResponse { cleared })
}

/// `GET /api/health/session`
pub async fn session_health(State(state): State<GuardState>) -> Json<BackendHealth> {
    Json(state.sessions().health_check().await)
}
