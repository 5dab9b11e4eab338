//! Session middleware for automatic session management
//!
//! Reads the signed session cookie, loads the session from the
//! [`SessionStore`], exposes it to the rest of the stack as a
//! [`SessionHandle`], and persists it once the response is ready.

use crate::config::SessionSettings;
use crate::error::ConfigError;
use crate::session::{Session, SessionHandle, SessionId, SessionStore};
use axum::{
    body::Body,
    extract::Request,
    http::header::{COOKIE, SET_COOKIE},
    response::Response,
};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies session cookie values (`<id>.<hex mac>`).
#[derive(Clone)]
pub(crate) struct CookieSigner {
    mac: HmacSha256,
}

impl fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieSigner(..)")
    }
}

impl CookieSigner {
    pub(crate) fn new(secret: &[u8]) -> Result<Self, ConfigError> {
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| ConfigError::Invalid(format!("secret_key unusable for signing: {e}")))?;
        Ok(Self { mac })
    }

    pub(crate) fn sign(&self, id: &SessionId) -> String {
        let mut mac = self.mac.clone();
        mac.update(id.as_str().as_bytes());
        format!("{id}.{}", hex::encode(mac.finalize().into_bytes()))
    }

    /// Recover the session ID from a cookie value. Tampered or malformed
    /// values yield `None`.
    pub(crate) fn verify(&self, value: &str) -> Option<SessionId> {
        let (id, signature) = value.rsplit_once('.')?;
        let id: SessionId = id.parse().ok()?;
        let signature = hex::decode(signature).ok()?;
        let mut mac = self.mac.clone();
        mac.update(id.as_str().as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(id)
    }
}

/// Cookie attributes derived from [`SessionSettings`].
#[derive(Debug, Clone)]
struct CookieConfig {
    name: String,
    max_age_secs: u64,
    secure: bool,
    same_site: &'static str,
}

impl CookieConfig {
    fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            name: settings.cookie_name.clone(),
            max_age_secs: settings.ttl_seconds,
            secure: settings.secure_cookie,
            same_site: settings.same_site.as_str(),
        }
    }

    fn header(&self, value: &str, max_age_secs: u64) -> String {
        let mut cookie = format!(
            "{}={value}; Path=/; Max-Age={max_age_secs}; SameSite={}; HttpOnly",
            self.name, self.same_site
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

#[derive(Debug)]
struct Shared {
    store: Arc<SessionStore>,
    signer: CookieSigner,
    cookie: CookieConfig,
    ttl: std::time::Duration,
}

/// Layer for session middleware
#[derive(Clone, Debug)]
pub struct SessionLayer {
    shared: Arc<Shared>,
}

impl SessionLayer {
    /// Create a session layer over `store`, signing cookies with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `secret` cannot key the cookie MAC.
    pub fn new(
        store: Arc<SessionStore>,
        settings: &SessionSettings,
        secret: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                signer: CookieSigner::new(secret.as_bytes())?,
                cookie: CookieConfig::from_settings(settings),
                ttl: settings.ttl(),
            }),
        })
    }
}

impl<S> Layer<S> for SessionLayer {
    type Service = SessionMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SessionMiddleware {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Session middleware that handles cookie-based sessions
///
/// Loads the session on request and saves it on response when it changed.
#[derive(Clone)]
pub struct SessionMiddleware<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S: fmt::Debug> fmt::Debug for SessionMiddleware<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMiddleware")
            .field("inner", &self.inner)
            .field("cookie", &self.shared.cookie)
            .finish_non_exhaustive()
    }
}

impl<S> Service<Request> for SessionMiddleware<S>
where
    S: Service<Request, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let shared = self.shared.clone();
        // Take the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let cookie = cookie_value(&req, &shared.cookie.name);

        Box::pin(async move {
            let session = load_session(&shared, cookie).await;
            // Only freshly created sessions start out dirty.
            let is_new = session.is_dirty();
            let handle = SessionHandle::new(session);
            req.extensions_mut().insert(handle.clone());

            let mut response = inner.call(req).await?;

            let session = handle.snapshot();
            persist(&shared, &session, is_new, &mut response).await;
            Ok(response)
        })
    }
}

async fn load_session(shared: &Shared, cookie: Option<String>) -> Session {
    let Some(id) = cookie.and_then(|v| shared.signer.verify(&v)) else {
        return Session::new(SessionId::generate());
    };

    match shared
        .store
        .get_json::<HashMap<String, Value>>(&id.storage_key())
        .await
    {
        Ok(Some(data)) => Session::from_stored(id, data),
        Ok(None) => {
            debug!("Session cookie refers to an unknown or expired session");
            Session::new(SessionId::generate())
        }
        Err(err) => {
            warn!(error = %err, "Session load failed, starting a new session");
            Session::new(SessionId::generate())
        }
    }
}

async fn persist(shared: &Shared, session: &Session, is_new: bool, response: &mut Response<Body>) {
    let key = session.id().storage_key();

    if session.is_destroyed() {
        if let Err(err) = shared.store.delete(&key).await {
            warn!(error = %err, "Failed to delete session");
        }
        if !is_new {
            set_cookie(response, &shared.cookie.header("", 0));
        }
        return;
    }

    if session.is_dirty() {
        if let Err(err) = shared.store.set_json(&key, session.data(), shared.ttl).await {
            warn!(error = %err, "Failed to save session");
            return;
        }
    }

    if is_new {
        let value = shared.signer.sign(session.id());
        set_cookie(
            response,
            &shared.cookie.header(&value, shared.cookie.max_age_secs),
        );
    }
}

/// Extract a cookie value from the request
fn cookie_value(req: &Request, cookie_name: &str) -> Option<String> {
    let cookie_header = req.headers().get(COOKIE)?;
    let cookie_str = cookie_header.to_str().ok()?;

    cookie_str.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        (name.trim() == cookie_name).then(|| value.trim().to_string())
    })
}

fn set_cookie(response: &mut Response<Body>, cookie: &str) {
    if let Ok(header_value) = cookie.parse() {
        response.headers_mut().append(SET_COOKIE, header_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FilesystemBackend;
    use axum::http::Request as HttpRequest;
    use axum::{routing::get, Router};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    async fn layer(dir: &TempDir) -> (SessionLayer, Arc<SessionStore>) {
        let settings = SessionSettings {
            fallback_dir: dir.path().to_path_buf(),
            secure_cookie: false,
            ..SessionSettings::default()
        };
        let fs = Arc::new(FilesystemBackend::open(dir.path()).await.unwrap());
        let store = Arc::new(SessionStore::new(None, fs, &settings));
        (
            SessionLayer::new(store.clone(), &settings, SECRET).unwrap(),
            store,
        )
    }

    fn app(layer: SessionLayer) -> Router {
        routes().layer(layer)
    }

    fn routes() -> Router {
        Router::new()
            .route(
                "/count",
                get(|session: SessionHandle| async move {
                    let mut session = session.lock();
                    let count = session.get::<u32>("count").unwrap_or(0) + 1;
                    session.insert("count", &count).unwrap();
                    count.to_string()
                }),
            )
            .route(
                "/logout",
                get(|session: SessionHandle| async move {
                    session.lock().clear();
                    "bye"
                }),
            )
    }

    fn session_cookie(response: &Response<Body>) -> Option<String> {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("chatgate_session="))
            .and_then(|v| v.split(';').next())
            .map(str::to_string)
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_signer_round_trip_and_tamper() {
        let signer = CookieSigner::new(SECRET.as_bytes()).unwrap();
        let id = SessionId::generate();
        let signed = signer.sign(&id);
        assert_eq!(signer.verify(&signed), Some(id.clone()));

        let mut tampered = signed.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        assert_eq!(signer.verify(&tampered), None);

        let other = CookieSigner::new(b"another secret of sufficient length!").unwrap();
        assert_eq!(other.verify(&signed), None);
        assert_eq!(signer.verify(id.as_str()), None);
    }

    #[tokio::test]
    async fn test_session_persists_across_requests() {
        let dir = TempDir::new().unwrap();
        let (layer, _store) = layer(&dir).await;
        let app = app(layer);

        let first = app
            .clone()
            .oneshot(HttpRequest::get("/count").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let cookie = session_cookie(&first).expect("new session sets a cookie");
        assert_eq!(body_string(first).await, "1");

        let second = app
            .oneshot(
                HttpRequest::get("/count")
                    .header(COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(session_cookie(&second).is_none());
        assert_eq!(body_string(second).await, "2");
    }

    #[tokio::test]
    async fn test_cookie_request_runs_on_spawned_task() {
        let dir = TempDir::new().unwrap();
        let (layer, _store) = layer(&dir).await;
        let mut service = layer.layer(routes());

        let first = tokio::spawn(
            service.call(HttpRequest::get("/count").body(Body::empty()).unwrap()),
        )
        .await
        .unwrap()
        .unwrap();
        let cookie = session_cookie(&first).unwrap();

        let request = HttpRequest::get("/count")
            .header(COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        let second = tokio::spawn(service.call(request))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body_string(second).await, "2");
    }

    #[tokio::test]
    async fn test_forged_cookie_starts_fresh_session() {
        let dir = TempDir::new().unwrap();
        let (layer, _store) = layer(&dir).await;
        let forged = format!("chatgate_session={}.deadbeef", SessionId::generate());

        let response = app(layer)
            .oneshot(
                HttpRequest::get("/count")
                    .header(COOKIE, forged)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(session_cookie(&response).is_some());
        assert_eq!(body_string(response).await, "1");
    }

    #[tokio::test]
    async fn test_cleared_session_is_deleted() {
        let dir = TempDir::new().unwrap();
        let (layer, store) = layer(&dir).await;
        let app = app(layer);

        let first = app
            .clone()
            .oneshot(HttpRequest::get("/count").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let cookie = session_cookie(&first).unwrap();
        let id = cookie
            .trim_start_matches("chatgate_session=")
            .split('.')
            .next()
            .unwrap()
            .to_string();
        let key = format!("session:{id}");
        assert!(store.get(&key).await.unwrap().is_some());

        let response = app
            .oneshot(
                HttpRequest::get("/logout")
                    .header(COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let expired = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(expired.contains("Max-Age=0"));
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
