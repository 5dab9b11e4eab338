//! The standard security pipeline and the tower layer that runs it.

use super::pipeline::{Pipeline, PipelineEntry, Stage, StageContext};
use crate::config::CsrfSettings;
use crate::csp::{CspExempt, CspPolicyEngine};
use crate::csrf::CsrfTokenManager;
use crate::error::{ConfigError, SecurityError};
use crate::telemetry::token_prefix;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE},
        HeaderName, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{error, warn};

/// Makes sure every session carries a live CSRF token, so pages rendered on
/// GET can embed it.
#[derive(Debug, Clone)]
pub struct CsrfEnsureStage {
    csrf: Arc<CsrfTokenManager>,
}

#[async_trait]
impl Stage for CsrfEnsureStage {
    async fn on_request(&self, req: Request, ctx: &mut StageContext) -> Result<Request, Response> {
        if let Some(session) = &ctx.session {
            self.csrf.get_or_create(&mut session.lock());
        }
        Ok(req)
    }
}

/// Rejects unsafe requests that lack a valid token.
#[derive(Debug, Clone)]
pub struct CsrfVerifyStage {
    csrf: Arc<CsrfTokenManager>,
}

#[async_trait]
impl Stage for CsrfVerifyStage {
    async fn on_request(&self, req: Request, ctx: &mut StageContext) -> Result<Request, Response> {
        let (req, token) = self.csrf.extract_token(req).await;
        let Some(token) = token else {
            warn!(path = %ctx.path(), method = %ctx.method, "CSRF token missing");
            return Err(SecurityError::CsrfTokenMissing.into_response());
        };

        let valid = ctx
            .session
            .as_ref()
            .is_some_and(|session| self.csrf.validate(&token, &session.lock()));
        if !valid {
            warn!(
                path = %ctx.path(),
                method = %ctx.method,
                token = %token_prefix(&token),
                "CSRF token invalid or expired"
            );
            return Err(SecurityError::CsrfTokenInvalid.into_response());
        }

        ctx.csrf_validated = true;
        Ok(req)
    }
}

/// Replaces the token after a verified request and hands the new one back in
/// a response header.
#[derive(Debug, Clone)]
pub struct CsrfRotateStage {
    csrf: Arc<CsrfTokenManager>,
    header: HeaderName,
}

#[async_trait]
impl Stage for CsrfRotateStage {
    async fn on_response(&self, mut res: Response, ctx: &mut StageContext) -> Response {
        if !ctx.csrf_validated {
            return res;
        }
        let Some(session) = &ctx.session else {
            return res;
        };
        let token = self.csrf.refresh(&mut session.lock());
        if let Ok(value) = HeaderValue::from_str(&token) {
            res.headers_mut().insert(self.header.clone(), value);
        }
        res
    }
}

/// Attaches the policy header to HTML responses and nonces their inline
/// scripts and styles.
#[derive(Debug, Clone)]
pub struct CspStage {
    csp: Arc<CspPolicyEngine>,
}

fn is_html(res: &Response) -> bool {
    res.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/html"))
}

#[async_trait]
impl Stage for CspStage {
    async fn on_response(&self, res: Response, ctx: &mut StageContext) -> Response {
        if res.extensions().get::<CspExempt>().is_some() || !is_html(&res) {
            return res;
        }

        let nonce = self.csp.generate_nonce();
        let policy = self.csp.header_for(&nonce);
        let (mut parts, body) = res.into_parts();

        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(policy.name.as_bytes()),
            HeaderValue::from_str(&policy.value),
        ) else {
            error!(path = %ctx.path(), "CSP policy is not a valid header");
            return Response::from_parts(parts, body);
        };
        parts.headers.insert(name, value);

        let bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(path = %ctx.path(), error = %err, "Failed to buffer HTML response");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        let body = match std::str::from_utf8(&bytes) {
            Ok(html) => Body::from(self.csp.inject_nonce(html, &nonce)),
            Err(_) => Body::from(bytes),
        };
        parts.headers.remove(CONTENT_LENGTH);
        Response::from_parts(parts, body)
    }
}

/// Standard pipeline: `csrf-ensure`, `csrf-verify`, `csrf-rotate`, `csp`.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] if the configured rotation header name is
/// not a valid HTTP header name.
pub fn standard_pipeline(
    settings: &CsrfSettings,
    csrf: Arc<CsrfTokenManager>,
    csp: Arc<CspPolicyEngine>,
) -> Result<Pipeline, ConfigError> {
    let header = HeaderName::from_bytes(settings.response_header.as_bytes())
        .map_err(|e| ConfigError::Invalid(format!("csrf.response_header: {e}")))?;
    let exempt: Arc<[String]> = settings.exempt_paths.clone().into();
    let csp_for_predicate = csp.clone();

    Ok(Pipeline::new()
        .with(PipelineEntry::new(
            "csrf-ensure",
            |ctx: &StageContext| ctx.session.is_some(),
            CsrfEnsureStage { csrf: csrf.clone() },
        ))
        .with(PipelineEntry::new(
            "csrf-verify",
            move |ctx: &StageContext| {
                !ctx.is_safe_method() && !exempt.iter().any(|p| p == ctx.path())
            },
            CsrfVerifyStage { csrf: csrf.clone() },
        ))
        .with(PipelineEntry::new(
            "csrf-rotate",
            |ctx: &StageContext| ctx.session.is_some(),
            CsrfRotateStage { csrf, header },
        ))
        .with(PipelineEntry::new(
            "csp",
            move |ctx: &StageContext| !csp_for_predicate.is_exempt_path(ctx.path()),
            CspStage { csp },
        )))
}

/// Layer running a [`Pipeline`] around the inner service.
#[derive(Clone)]
pub struct SecurityLayer {
    pipeline: Arc<Pipeline>,
}

impl fmt::Debug for SecurityLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityLayer")
            .field("stages", &self.pipeline.names())
            .finish()
    }
}

impl SecurityLayer {
    /// Layer for `pipeline`.
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    /// The pipeline this layer runs.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl<S> Layer<S> for SecurityLayer {
    type Service = SecurityMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityMiddleware {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

/// Service produced by [`SecurityLayer`].
#[derive(Clone)]
pub struct SecurityMiddleware<S> {
    inner: S,
    pipeline: Arc<Pipeline>,
}

impl<S: fmt::Debug> fmt::Debug for SecurityMiddleware<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityMiddleware")
            .field("inner", &self.inner)
            .field("stages", &self.pipeline.names())
            .finish()
    }
}

impl<S> Service<Request> for SecurityMiddleware<S>
where
    S: Service<Request, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move { pipeline.run(req, move |req| inner.call(req)).await })
    }
}
