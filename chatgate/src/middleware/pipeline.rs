//! Ordered request/response stages with per-request predicates.
//!
//! Each [`PipelineEntry`] pairs a predicate with a [`Stage`]. Predicates are
//! evaluated once, before any stage runs. Matching stages see the request in
//! registration order and the response in reverse order, like nested layers.
//! A stage may answer the request itself by returning `Err(response)`; the
//! handler is then skipped and only stages that already accepted the request
//! get to see the response.

use crate::session::SessionHandle;
use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{Method, Uri},
    response::Response,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Per-request facts shared by all stages.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Request method.
    pub method: Method,
    /// Request URI.
    pub uri: Uri,
    /// Session, when a session layer runs outside this pipeline.
    pub session: Option<SessionHandle>,
    /// Set once the CSRF token of this request has been verified.
    pub csrf_validated: bool,
}

impl StageContext {
    /// Context for `req`.
    #[must_use]
    pub fn from_request(req: &Request) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            session: req.extensions().get::<SessionHandle>().cloned(),
            csrf_validated: false,
        }
    }

    /// Request path.
    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Whether the method is GET, HEAD or OPTIONS. Every other method,
    /// including TRACE and extension methods, needs a CSRF token.
    #[must_use]
    pub fn is_safe_method(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

/// One step of the security pipeline. Both hooks default to pass-through.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Inspect or replace the request, or answer it directly with `Err`.
    async fn on_request(
        &self,
        req: Request,
        _ctx: &mut StageContext,
    ) -> Result<Request, Response> {
        Ok(req)
    }

    /// Inspect or replace the response.
    async fn on_response(&self, res: Response, _ctx: &mut StageContext) -> Response {
        res
    }
}

/// Decides whether an entry applies to a request.
pub type Predicate = Arc<dyn Fn(&StageContext) -> bool + Send + Sync>;

/// A named stage and the predicate gating it.
#[derive(Clone)]
pub struct PipelineEntry {
    /// Name used in logs and for introspection.
    pub name: &'static str,
    /// Gate evaluated once per request.
    pub predicate: Predicate,
    /// The stage itself.
    pub stage: Arc<dyn Stage>,
}

impl fmt::Debug for PipelineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PipelineEntry {
    /// Entry gated by `predicate`.
    pub fn new<P, S>(name: &'static str, predicate: P, stage: S) -> Self
    where
        P: Fn(&StageContext) -> bool + Send + Sync + 'static,
        S: Stage + 'static,
    {
        Self {
            name,
            predicate: Arc::new(predicate),
            stage: Arc::new(stage),
        }
    }

    /// Entry that applies to every request.
    pub fn always<S: Stage + 'static>(name: &'static str, stage: S) -> Self {
        Self::new(name, |_| true, stage)
    }
}

/// Ordered list of entries.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    entries: Vec<PipelineEntry>,
}

impl Pipeline {
    /// Empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    #[must_use]
    pub fn with(mut self, entry: PipelineEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Entry names, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// Names of the entries whose predicate matches `ctx`.
    #[must_use]
    pub fn matching(&self, ctx: &StageContext) -> Vec<&'static str> {
        self.active(ctx).iter().map(|e| e.name).collect()
    }

    fn active(&self, ctx: &StageContext) -> Vec<&PipelineEntry> {
        self.entries
            .iter()
            .filter(|entry| (entry.predicate)(ctx))
            .collect()
    }

    /// Run `req` through the matching stages and `handler`.
    ///
    /// # Errors
    ///
    /// Propagates the handler's error; stages themselves never fail.
    pub async fn run<F, Fut, E>(&self, req: Request, handler: F) -> Result<Response, E>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Result<Response, E>>,
    {
        let mut ctx = StageContext::from_request(&req);
        let active = self.active(&ctx);

        let mut outcome: Result<Request, Response> = Ok(req);
        let mut entered = 0;
        for entry in &active {
            let req = match outcome {
                Ok(req) => req,
                Err(res) => {
                    outcome = Err(res);
                    break;
                }
            };
            outcome = entry.stage.on_request(req, &mut ctx).await;
            if outcome.is_ok() {
                entered += 1;
            } else {
                tracing::debug!(stage = entry.name, path = %ctx.path(), "Request answered by stage");
            }
        }

        let mut res = match outcome {
            Ok(req) => handler(req).await?,
            Err(res) => res,
        };
        for entry in active[..entered].iter().rev() {
            res = entry.stage.on_response(res, &mut ctx).await;
        }
        Ok(res)
    }
}
