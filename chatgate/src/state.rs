//! Shared state built once at startup.

use crate::config::SecurityConfig;
use crate::csp::CspPolicyEngine;
use crate::csrf::CsrfTokenManager;
use crate::error::ConfigError;
use crate::middleware::{standard_pipeline, SecurityLayer};
use crate::session::{SessionLayer, SessionStore};
use std::sync::Arc;
use tracing::info;

/// Security components shared by every request.
///
/// Cheap to clone; all clones share the same store, token manager and
/// violation buffer.
#[derive(Debug, Clone)]
pub struct GuardState {
    config: Arc<SecurityConfig>,
    sessions: Arc<SessionStore>,
    csrf: Arc<CsrfTokenManager>,
    csp: Arc<CspPolicyEngine>,
}

impl GuardState {
    /// Validate `config`, connect the session store and build the engines.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is unusable or no session
    /// backend can be opened.
    pub async fn initialize(config: SecurityConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let sessions = SessionStore::initialize(&config.session).await?;
        let state = Self::from_parts(config, sessions);
        info!(
            csp_phase = %state.csp.phase(),
            fallback_active = state.sessions.is_fallback_active(),
            "Security layer initialized"
        );
        Ok(state)
    }

    /// Assemble state around an existing store, without validation.
    #[must_use]
    pub fn from_parts(config: SecurityConfig, sessions: SessionStore) -> Self {
        Self {
            csrf: Arc::new(CsrfTokenManager::new(&config.csrf)),
            csp: Arc::new(CspPolicyEngine::new(&config.csp)),
            sessions: Arc::new(sessions),
            config: Arc::new(config),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Session store.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// CSRF token manager.
    #[must_use]
    pub fn csrf(&self) -> &Arc<CsrfTokenManager> {
        &self.csrf
    }

    /// CSP engine.
    #[must_use]
    pub fn csp(&self) -> &Arc<CspPolicyEngine> {
        &self.csp
    }

    /// Layer loading and saving sessions.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the secret cannot key the cookie MAC.
    pub fn session_layer(&self) -> Result<SessionLayer, ConfigError> {
        SessionLayer::new(
            self.sessions.clone(),
            &self.config.session,
            &self.config.secret_key,
        )
    }

    /// Layer running the standard CSRF and CSP pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unusable CSRF response header.
    pub fn security_layer(&self) -> Result<SecurityLayer, ConfigError> {
        standard_pipeline(&self.config.csrf, self.csrf.clone(), self.csp.clone())
            .map(SecurityLayer::new)
    }
}
