//! Per-client sessions and their storage.
//!
//! A [`Session`] is an opaque string → JSON mapping. The
//! [`SessionLayer`] loads it from the [`SessionStore`] on the way in, hands
//! handlers a shared [`SessionHandle`] through request extensions, and writes
//! it back on the way out.

mod filesystem;
mod middleware;
#[cfg(feature = "redis")]
mod redis_backend;
mod store;

pub use filesystem::FilesystemBackend;
pub use middleware::{SessionLayer, SessionMiddleware};
#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;
pub use store::{BackendHealth, BackendKind, SessionBackend, SessionStore};

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Length of an encoded session ID (32 random bytes, unpadded base64).
const SESSION_ID_LEN: usize = 43;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session ID.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Borrow the ID as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage key for this session, before namespacing.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("session:{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejected session ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed session id")]
pub struct InvalidSessionId;

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == SESSION_ID_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if well_formed {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidSessionId)
        }
    }
}

/// Server-side session state for one client.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    data: HashMap<String, Value>,
    dirty: bool,
    destroyed: bool,
}

impl Session {
    /// Start an empty session. New sessions are dirty so they get persisted.
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            data: HashMap::new(),
            dirty: true,
            destroyed: false,
        }
    }

    /// Rehydrate a stored session.
    #[must_use]
    pub const fn from_stored(id: SessionId, data: HashMap<String, Value>) -> Self {
        Self {
            id,
            data,
            dirty: false,
            destroyed: false,
        }
    }

    /// Session ID.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Raw value under `key`.
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Typed value under `key`; `None` if absent or of another shape.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Store a raw value.
    pub fn insert_value(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
        self.dirty = true;
    }

    /// Store a serializable value.
    ///
    /// # Errors
    ///
    /// Returns error if value cannot be serialized
    pub fn insert<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.insert_value(key, value);
        Ok(())
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Drop all data and mark the session for deletion.
    pub fn clear(&mut self) {
        self.data.clear();
        self.destroyed = true;
        self.dirty = true;
    }

    /// Whether the session changed since it was loaded.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether [`clear`](Self::clear) was called.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Stored contents.
    #[must_use]
    pub const fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }
}

/// Shared, request-scoped access to the current session.
///
/// Cloning is cheap; all clones point at the same session. Never hold the
/// guard across an `.await`.
#[derive(Debug, Clone)]
pub struct SessionHandle(Arc<Mutex<Session>>);

impl SessionHandle {
    /// Wrap a session.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    /// Lock the session.
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.0.lock()
    }

    /// Copy of the current session state.
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.0.lock().clone()
    }
}

impl<S> FromRequestParts<S> for SessionHandle
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "Session not initialized"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_parse_back() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), SESSION_ID_LEN);
        assert_eq!(id.as_str().parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn test_rejects_malformed_ids() {
        assert!("".parse::<SessionId>().is_err());
        assert!("../../etc/passwd".parse::<SessionId>().is_err());
        assert!("a".repeat(SESSION_ID_LEN + 1).parse::<SessionId>().is_err());
    }

    #[test]
    fn test_new_session_is_dirty_loaded_is_clean() {
        assert!(Session::new(SessionId::generate()).is_dirty());
        let loaded = Session::from_stored(SessionId::generate(), HashMap::new());
        assert!(!loaded.is_dirty());
    }

    #[test]
    fn test_insert_get_remove() {
        let mut session = Session::from_stored(SessionId::generate(), HashMap::new());
        session.insert("history", &vec!["hi", "there"]).unwrap();
        assert!(session.is_dirty());
        let history: Vec<String> = session.get("history").unwrap();
        assert_eq!(history, vec!["hi", "there"]);
        assert_eq!(session.remove("history"), Some(json!(["hi", "there"])));
        assert!(session.get_value("history").is_none());
    }

    #[test]
    fn test_clear_marks_destroyed() {
        let mut session = Session::new(SessionId::generate());
        session.insert_value("k", json!(1));
        session.clear();
        assert!(session.is_destroyed());
        assert!(session.data().is_empty());
    }

    #[test]
    fn test_handle_clones_share_state() {
        let handle = SessionHandle::new(Session::new(SessionId::generate()));
        let other = handle.clone();
        other.lock().insert_value("scenario", json!("tavern"));
        assert_eq!(handle.lock().get_value("scenario"), Some(&json!("tavern")));
    }
}
