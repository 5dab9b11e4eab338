//! Security layer for axum chat applications.
//!
//! Provides CSRF token issuance and verification bound to a server-side
//! session, a phased Content-Security-Policy with per-response nonces and
//! violation telemetry, and a session store that fails over from Redis to
//! the local filesystem.
//!
//! ```rust,ignore
//! let state = GuardState::initialize(SecurityConfig::load()?).await?;
//! let app = Router::new()
//!     .route("/", get(index))
//!     .merge(chatgate::routes::router())
//!     .with_state(state.clone());
//! let app = chatgate::protect(app, &state)?;
//! ```

pub mod config;
pub mod csp;
pub mod csrf;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod session;
pub mod state;
pub mod telemetry;

use axum::Router;

pub use config::{CsrfSettings, CspSettings, SecurityConfig, SessionSettings};
pub use csp::{CspExempt, CspPhase, CspPolicyEngine};
pub use csrf::CsrfTokenManager;
pub use error::{ConfigError, SecurityError, StoreError};
pub use session::{Session, SessionHandle, SessionStore};
pub use state::GuardState;

/// Wrap `router` in the security pipeline and the session layer.
///
/// The session layer sits outside so that every pipeline stage sees the
/// loaded session.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a layer cannot be built from the configuration.
pub fn protect<S>(router: Router<S>, state: &GuardState) -> Result<Router<S>, ConfigError>
where
    S: Clone + Send + Sync + 'static,
{
    Ok(router
        .layer(state.security_layer()?)
        .layer(state.session_layer()?))
}
