//! CSRF token lifecycle.
//!
//! One live token per session, stored under [`SESSION_KEY`] as
//! `{token, created_at}`. Older sessions may still carry a bare string; those
//! are never accepted and are replaced on the next
//! [`get_or_create`](CsrfTokenManager::get_or_create).

use crate::config::CsrfSettings;
use crate::session::Session;
use crate::telemetry::token_prefix;
use axum::{
    body::Body,
    extract::Request,
    http::header::CONTENT_TYPE,
};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Session key holding the CSRF token.
pub const SESSION_KEY: &str = "csrf_token";

/// Length of a token in hex characters.
pub const TOKEN_LEN: usize = 32;

/// Source of the current time, in fractional Unix seconds.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_precision_loss)]
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Token as persisted in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredToken {
    /// Current representation.
    Versioned {
        /// Token value.
        token: String,
        /// Creation time, fractional Unix seconds.
        created_at: f64,
    },
    /// Bare token string written by older releases. Carries no timestamp.
    Legacy(String),
}

impl StoredToken {
    /// Decode whatever the session holds. Unrecognized shapes yield `None`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Versioned { token, created_at } => {
                serde_json::json!({ "token": token, "created_at": created_at })
            }
            Self::Legacy(token) => Value::String(token.clone()),
        }
    }
}

fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Issues, validates and rotates per-session CSRF tokens.
#[derive(Debug, Clone)]
pub struct CsrfTokenManager {
    lifetime_secs: f64,
    clock: Arc<dyn Clock>,
    header_name: String,
    form_field: String,
    json_field: String,
    max_body_bytes: usize,
}

impl CsrfTokenManager {
    /// Manager on the system clock.
    #[must_use]
    pub fn new(settings: &CsrfSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Manager on an explicit clock.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn with_clock(settings: &CsrfSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            lifetime_secs: settings.token_lifetime_seconds as f64,
            clock,
            header_name: settings.header_name.clone(),
            form_field: settings.form_field.clone(),
            json_field: settings.json_field.clone(),
            max_body_bytes: settings.max_body_bytes,
        }
    }

    /// Fresh 32-character lowercase hex token (128 random bits).
    #[must_use]
    pub fn generate() -> String {
        let mut bytes = [0u8; TOKEN_LEN / 2];
        rand::rng().fill(&mut bytes);
        hex::encode(bytes)
    }

    /// The session's live token, creating or migrating one if needed.
    pub fn get_or_create(&self, session: &mut Session) -> String {
        match self.live_token(session) {
            Some(token) => token,
            None => self.refresh(session),
        }
    }

    /// Whether `token` matches the session's live token.
    ///
    /// Missing, malformed, legacy and expired tokens are all simply invalid.
    #[must_use]
    pub fn validate(&self, token: &str, session: &Session) -> bool {
        if !is_well_formed(token) {
            debug!(token = %token_prefix(token), "Rejecting malformed CSRF token");
            return false;
        }
        let Some(stored) = self.live_token(session) else {
            debug!("Session holds no live CSRF token");
            return false;
        };
        token.as_bytes().ct_eq(stored.as_bytes()).into()
    }

    /// Replace the session's token unconditionally.
    pub fn refresh(&self, session: &mut Session) -> String {
        let token = Self::generate();
        let stored = StoredToken::Versioned {
            token: token.clone(),
            created_at: self.clock.now(),
        };
        session.insert_value(SESSION_KEY, stored.to_value());
        debug!(token = %token_prefix(&token), "Issued CSRF token");
        token
    }

    /// Token lifetime in whole seconds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn lifetime_seconds(&self) -> u64 {
        self.lifetime_secs as u64
    }

    /// Locate the submitted token: header, then form field, then JSON field.
    ///
    /// The body is only read for form and JSON requests, at most
    /// `max_body_bytes` of it, and handed back intact in the returned request.
    pub async fn extract_token(&self, req: Request) -> (Request, Option<String>) {
        let from_header = req
            .headers()
            .get(self.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        if from_header.is_some() {
            return (req, from_header);
        }

        let Some(kind) = BodyKind::of(&req) else {
            return (req, None);
        };

        let (parts, body) = req.into_parts();
        let bytes = match axum::body::to_bytes(body, self.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(error = %err, "Request body unreadable while looking for CSRF token");
                return (Request::from_parts(parts, Body::empty()), None);
            }
        };

        let token = match kind {
            BodyKind::Form => url::form_urlencoded::parse(&bytes)
                .find(|(name, _)| name == self.form_field.as_str())
                .map(|(_, value)| value.into_owned()),
            BodyKind::Json => serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|v| v.get(&self.json_field)?.as_str().map(str::to_string)),
        }
        .filter(|v| !v.is_empty());

        (Request::from_parts(parts, Body::from(bytes)), token)
    }

    /// Well-formed, versioned, unexpired token held by the session.
    fn live_token(&self, session: &Session) -> Option<String> {
        match StoredToken::from_value(session.get_value(SESSION_KEY)?)? {
            StoredToken::Versioned { token, created_at } => {
                let age = self.clock.now() - created_at;
                let fresh = (0.0..self.lifetime_secs).contains(&age);
                (fresh && is_well_formed(&token)).then_some(token)
            }
            StoredToken::Legacy(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BodyKind {
    Form,
    Json,
}

impl BodyKind {
    fn of(req: &Request) -> Option<Self> {
        let content_type = req.headers().get(CONTENT_TYPE)?.to_str().ok()?;
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime == "application/x-www-form-urlencoded" {
            Some(Self::Form)
        } else if mime == "application/json" || mime.ends_with("+json") {
            Some(Self::Json)
        } else {
            None
        }
    }
}
