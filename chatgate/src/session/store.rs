//! Backend-agnostic session storage with sticky failover.
//!
//! The store owns two backends: an optional primary (Redis) and a local
//! filesystem fallback. Any failure of the primary, whether at startup or on a
//! later call, switches the store to the fallback for the rest of the process
//! lifetime. There is no automatic fail-back.

use crate::config::{BackendChoice, SessionSettings};
use crate::error::{ConfigError, StoreError};
use crate::session::FilesystemBackend;
use crate::telemetry::redact_url;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which kind of backend is serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Redis key-value store.
    Redis,
    /// Local filesystem directory.
    Filesystem,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redis => f.write_str("redis"),
            Self::Filesystem => f.write_str("filesystem"),
        }
    }
}

/// Storage operations every session backend provides.
///
/// Keys arrive already namespaced. Implementations bound their own I/O with
/// timeouts; the store never waits on them unbounded.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Backend kind, for health reporting.
    fn kind(&self) -> BackendKind;

    /// Fetch a value; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a value with a time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a value. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Remove expired entries the backend does not expire on its own.
    /// Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// Point-in-time view of backend health. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealth {
    /// Backend currently serving requests.
    pub backend: BackendKind,
    /// Whether the configured backend is connected and answering.
    pub connected: bool,
    /// Whether the store has failed over to the filesystem.
    pub fallback_active: bool,
    /// Short description of the last problem, without backend internals.
    pub error: Option<String>,
}

/// Session storage facade.
pub struct SessionStore {
    primary: Option<Arc<dyn SessionBackend>>,
    fallback: Arc<dyn SessionBackend>,
    fallback_active: AtomicBool,
    failover_reason: Mutex<Option<String>>,
    key_prefix: String,
    health_timeout: Duration,
    fallback_writes: AtomicU64,
    purge_every: u64,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("primary", &self.primary.as_ref().map(|p| p.kind()))
            .field("fallback", &self.fallback.kind())
            .field("fallback_active", &self.is_fallback_active())
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Build the store from configuration and pick the active backend.
    ///
    /// Primary connection problems are not errors: they are logged and the
    /// store runs on the filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FallbackDir`] if the fallback directory cannot
    /// be created, since then no backend is usable at all.
    pub async fn initialize(settings: &SessionSettings) -> Result<Self, ConfigError> {
        let fallback: Arc<dyn SessionBackend> = Arc::new(
            FilesystemBackend::open(&settings.fallback_dir)
                .await
                .map_err(ConfigError::FallbackDir)?,
        );

        if settings.backend == BackendChoice::Filesystem {
            info!(dir = %settings.fallback_dir.display(), "Session store using filesystem backend");
            return Ok(Self::new(None, fallback, settings));
        }

        match build_primary(settings) {
            Ok(primary) => {
                let store = Self::new(Some(primary), fallback, settings);
                store.probe_primary(settings.connect_timeout()).await;
                Ok(store)
            }
            Err(err) => {
                let store = Self::new(None, fallback, settings);
                store.activate_fallback(&err);
                Ok(store)
            }
        }
    }

    /// Assemble a store from explicit backends without probing.
    #[must_use]
    pub fn new(
        primary: Option<Arc<dyn SessionBackend>>,
        fallback: Arc<dyn SessionBackend>,
        settings: &SessionSettings,
    ) -> Self {
        Self {
            primary,
            fallback,
            fallback_active: AtomicBool::new(false),
            failover_reason: Mutex::new(None),
            key_prefix: settings.key_prefix.clone(),
            health_timeout: settings.health_timeout(),
            fallback_writes: AtomicU64::new(0),
            purge_every: settings.purge_every_writes,
        }
    }

    /// Ping the primary once, bounded by `timeout`, failing over on error.
    pub async fn probe_primary(&self, timeout: Duration) {
        let Some(primary) = self.primary.as_ref() else {
            return;
        };
        match bounded(timeout, primary.ping()).await {
            Ok(()) => info!(backend = %primary.kind(), "Session store connected to primary backend"),
            Err(err) => self.activate_fallback(&err),
        }
    }

    /// Whether the store has switched to the filesystem backend.
    #[must_use]
    pub fn is_fallback_active(&self) -> bool {
        self.fallback_active.load(Ordering::Acquire)
    }

    /// Probe the active backend. Never fails; problems land in the result.
    pub async fn health_check(&self) -> BackendHealth {
        let backend = self.active();
        let probe = bounded(self.health_timeout, backend.ping()).await;

        if self.is_fallback_active() {
            let reason = self
                .failover_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "primary backend unavailable".to_string());
            let error = match probe {
                Ok(()) => reason,
                Err(err) => format!("{reason}; fallback probe failed: {}", err.summary()),
            };
            return BackendHealth {
                backend: backend.kind(),
                connected: false,
                fallback_active: true,
                error: Some(error),
            };
        }

        BackendHealth {
            backend: backend.kind(),
            connected: probe.is_ok(),
            fallback_active: false,
            error: probe.err().map(|err| err.summary().to_string()),
        }
    }

    /// Fetch a raw value.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback backend fails as well.
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = self.namespaced(key);
        if let Some(primary) = self.live_primary() {
            match primary.get(&key).await {
                Ok(value) => return Ok(value),
                Err(err) => self.activate_fallback(&err),
            }
        }
        self.fallback.get(&key).await
    }

    /// Store a raw value with a time-to-live.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback backend fails as well.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let key = self.namespaced(key);
        if let Some(primary) = self.live_primary() {
            match primary.set(&key, value, ttl).await {
                Ok(()) => return Ok(()),
                Err(err) => self.activate_fallback(&err),
            }
        }
        self.fallback.set(&key, value, ttl).await?;
        self.count_fallback_write().await;
        Ok(())
    }

    /// Remove a value.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback backend fails as well.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = self.namespaced(key);
        if let Some(primary) = self.live_primary() {
            match primary.delete(&key).await {
                Ok(()) => return Ok(()),
                Err(err) => self.activate_fallback(&err),
            }
        }
        self.fallback.delete(&key).await
    }

    /// Fetch and decode a JSON value. Undecodable entries read as absent.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback backend fails as well.
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                debug!(error = %err, "Discarding undecodable stored value");
                Ok(None)
            }
        }
    }

    /// Encode and store a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or both backends fail.
    pub async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }

    /// Sweep expired entries from the fallback backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the fallback cannot be listed or cleaned.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.fallback.purge_expired().await
    }

    /// Abandoned sessions are never read again, so the fallback is swept
    /// every `purge_every` writes.
    async fn count_fallback_write(&self) {
        if self.purge_every == 0 {
            return;
        }
        let writes = self.fallback_writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.purge_every != 0 {
            return;
        }
        match self.purge_expired().await {
            Ok(removed) => debug!(removed, writes, "Swept expired sessions from fallback"),
            Err(err) => warn!(error = %err, "Failed to sweep expired sessions"),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    fn live_primary(&self) -> Option<&Arc<dyn SessionBackend>> {
        if self.is_fallback_active() {
            None
        } else {
            self.primary.as_ref()
        }
    }

    fn active(&self) -> &Arc<dyn SessionBackend> {
        self.live_primary().unwrap_or(&self.fallback)
    }

    /// One-way switch to the fallback. Only the first caller logs.
    fn activate_fallback(&self, cause: &StoreError) {
        if self.fallback_active.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            error = %cause,
            fallback = %self.fallback.kind(),
            "Primary session backend unavailable, switching to fallback for the rest of this process"
        );
        *self.failover_reason.lock() = Some(format!("primary backend {}", cause.summary()));
    }
}

async fn bounded<F>(timeout: Duration, fut: F) -> Result<(), StoreError>
where
    F: std::future::Future<Output = Result<(), StoreError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

#[cfg(feature = "redis")]
fn build_primary(settings: &SessionSettings) -> Result<Arc<dyn SessionBackend>, StoreError> {
    debug!(url = %redact_url(&settings.redis_url), "Creating Redis session backend");
    let backend = crate::session::RedisBackend::new(
        &settings.redis_url,
        settings.connect_timeout(),
        settings.socket_timeout(),
    )?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
fn build_primary(settings: &SessionSettings) -> Result<Arc<dyn SessionBackend>, StoreError> {
    debug!(url = %redact_url(&settings.redis_url), "Redis support not compiled in");
    Err(StoreError::Backend("redis driver unavailable".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> SessionSettings {
        SessionSettings {
            fallback_dir: dir.path().to_path_buf(),
            connect_timeout_ms: 200,
            socket_timeout_ms: 200,
            health_timeout_ms: 200,
            ..SessionSettings::default()
        }
    }

    fn unreachable_primary() -> MockSessionBackend {
        let mut mock = MockSessionBackend::new();
        mock.expect_kind().return_const(BackendKind::Redis);
        mock.expect_ping()
            .returning(|| Err(StoreError::Backend("Connection refused (os error 111)".into())));
        mock.expect_get().never();
        mock.expect_set().never();
        mock
    }

    async fn fallback(dir: &TempDir) -> Arc<dyn SessionBackend> {
        Arc::new(FilesystemBackend::open(dir.path()).await.unwrap())
    }

    #[tokio::test]
    async fn test_unreachable_primary_fails_over() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let store = SessionStore::new(
            Some(Arc::new(unreachable_primary())),
            fallback(&dir).await,
            &settings,
        );
        store.probe_primary(settings.connect_timeout()).await;

        let health = store.health_check().await;
        assert!(!health.connected);
        assert!(health.fallback_active);
        assert_eq!(health.backend, BackendKind::Filesystem);
        let error = health.error.unwrap();
        assert!(!error.contains("111"), "backend detail leaked: {error}");

        store.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_fallback_writes_sweep_expired_entries() {
        let dir = TempDir::new().unwrap();
        let settings = SessionSettings {
            purge_every_writes: 3,
            ..settings(&dir)
        };
        let store = SessionStore::new(None, fallback(&dir).await, &settings);
        let files = || std::fs::read_dir(dir.path()).unwrap().count();

        store.set("a", "v", Duration::ZERO).await.unwrap();
        store.set("b", "v", Duration::ZERO).await.unwrap();
        assert_eq!(files(), 2);

        // Third write triggers the sweep; only the live entry survives.
        store.set("c", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(files(), 1);
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_sweep_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let settings = SessionSettings {
            purge_every_writes: 0,
            ..settings(&dir)
        };
        let store = SessionStore::new(None, fallback(&dir).await, &settings);
        for key in ["a", "b", "c", "d"] {
            store.set(key, "v", Duration::ZERO).await.unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 4);
        assert_eq!(store.purge_expired().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_runtime_error_is_sticky() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);

        let mut primary = MockSessionBackend::new();
        primary.expect_kind().return_const(BackendKind::Redis);
        primary.expect_ping().returning(|| Ok(()));
        primary
            .expect_get()
            .times(1)
            .returning(|_| Err(StoreError::Timeout(Duration::from_millis(200))));
        primary.expect_set().never();

        let store = SessionStore::new(Some(Arc::new(primary)), fallback(&dir).await, &settings);
        store.probe_primary(settings.connect_timeout()).await;
        assert!(!store.is_fallback_active());

        assert_eq!(store.get("missing").await.unwrap(), None);
        assert!(store.is_fallback_active());

        // Primary is never consulted again, even though its ping now succeeds.
        store.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.health_check().await.fallback_active);
    }

    #[tokio::test]
    async fn test_healthy_primary_serves_requests() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);

        let mut primary = MockSessionBackend::new();
        primary.expect_kind().return_const(BackendKind::Redis);
        primary.expect_ping().returning(|| Ok(()));
        primary
            .expect_get()
            .withf(|key| key == "chatgate:session:abc")
            .returning(|_| Ok(Some("{}".to_string())));

        let store = SessionStore::new(Some(Arc::new(primary)), fallback(&dir).await, &settings);
        store.probe_primary(settings.connect_timeout()).await;

        assert_eq!(store.get("session:abc").await.unwrap().as_deref(), Some("{}"));
        let health = store.health_check().await;
        assert!(health.connected);
        assert!(!health.fallback_active);
        assert_eq!(health.backend, BackendKind::Redis);
        assert_eq!(health.error, None);
    }

    #[tokio::test]
    async fn test_filesystem_only_configuration() {
        let dir = TempDir::new().unwrap();
        let settings = SessionSettings {
            backend: BackendChoice::Filesystem,
            ..settings(&dir)
        };
        let store = SessionStore::initialize(&settings).await.unwrap();
        let health = store.health_check().await;
        assert!(health.connected);
        assert!(!health.fallback_active);
        assert_eq!(health.backend, BackendKind::Filesystem);
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let fs = Arc::new(FilesystemBackend::open(dir.path()).await.unwrap());
        let store = SessionStore::new(None, fs.clone(), &settings);

        store.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(fs.get("chatgate:k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(fs.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_round_trip_and_garbage() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let store = SessionStore::new(None, fallback(&dir).await, &settings);

        store
            .set_json("obj", &serde_json::json!({"a": 1}), Duration::from_secs(60))
            .await
            .unwrap();
        let value: Option<serde_json::Value> = store.get_json("obj").await.unwrap();
        assert_eq!(value, Some(serde_json::json!({"a": 1})));

        store.set("bad", "not json", Duration::from_secs(60)).await.unwrap();
        let value: Option<serde_json::Value> = store.get_json("bad").await.unwrap();
        assert_eq!(value, None);
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn test_initialize_with_refused_redis_uses_fallback() {
        let dir = TempDir::new().unwrap();
        let settings = SessionSettings {
            redis_url: "redis://127.0.0.1:1/".to_string(),
            ..settings(&dir)
        };
        let store = SessionStore::initialize(&settings).await.unwrap();
        let health = store.health_check().await;
        assert!(!health.connected);
        assert!(health.fallback_active);

        store.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
