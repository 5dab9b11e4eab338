//! Configuration for the security layer.

use crate::csp::CspPhase;
use crate::error::ConfigError;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Minimum accepted length of the signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Security layer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Secret used to sign session cookies.
    #[serde(default)]
    pub secret_key: String,
    /// Session storage configuration.
    #[serde(default)]
    pub session: SessionSettings,
    /// CSRF configuration.
    #[serde(default)]
    pub csrf: CsrfSettings,
    /// Content-Security-Policy configuration.
    #[serde(default)]
    pub csp: CspSettings,
}

/// Which session backend to try first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Redis primary with filesystem fallback.
    #[default]
    Redis,
    /// Filesystem only.
    Filesystem,
}

/// SameSite cookie policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    /// Strict same-site policy
    Strict,
    /// Lax same-site policy (recommended)
    #[default]
    Lax,
    /// No same-site restriction (requires Secure)
    None,
}

impl SameSite {
    /// Convert to cookie attribute string
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}

/// Session storage and cookie configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Backend to try first.
    #[serde(default)]
    pub backend: BackendChoice,
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Namespace prefix for every persisted key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Session lifetime in seconds.
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,
    /// Connect timeout for the primary backend.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-command timeout for the primary backend.
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// Timeout for health probes.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    /// Sweep expired entries from the filesystem backend after this many
    /// writes to it. Zero disables the sweep.
    #[serde(default = "default_purge_every_writes")]
    pub purge_every_writes: u64,
    /// Directory for the filesystem fallback backend.
    #[serde(default = "default_fallback_dir")]
    pub fallback_dir: PathBuf,
    /// Session cookie name.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Secure cookie (HTTPS only).
    #[serde(default = "default_secure_cookie")]
    pub secure_cookie: bool,
    /// SameSite policy.
    #[serde(default)]
    pub same_site: SameSite,
}

/// CSRF configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CsrfSettings {
    /// Token lifetime in seconds.
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_seconds: u64,
    /// Request header carrying the token.
    #[serde(default = "default_header_name")]
    pub header_name: String,
    /// Form field carrying the token.
    #[serde(default = "default_token_field")]
    pub form_field: String,
    /// JSON body field carrying the token.
    #[serde(default = "default_token_field")]
    pub json_field: String,
    /// Response header carrying a rotated token.
    #[serde(default = "default_response_header")]
    pub response_header: String,
    /// Paths that skip CSRF verification (exact match).
    #[serde(default = "default_csrf_exempt_paths")]
    pub exempt_paths: Vec<String>,
    /// Largest body buffered while looking for a token.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Content-Security-Policy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CspSettings {
    /// Enforcement phase.
    #[serde(default)]
    pub phase: CspPhase,
    /// Force report-only delivery on or off. Defaults to `phase == ReportOnly`.
    #[serde(default)]
    pub report_only: Option<bool>,
    /// Violation ingestion endpoint.
    #[serde(default = "default_report_uri")]
    pub report_uri: String,
    /// Violation ring buffer capacity.
    #[serde(default = "default_violation_capacity")]
    pub violation_capacity: usize,
    /// Script CDNs allowed in every phase.
    #[serde(default = "default_script_cdn_sources")]
    pub script_cdn_sources: Vec<String>,
    /// Analytics origins (dropped in the strict phase).
    #[serde(default = "default_analytics_sources")]
    pub analytics_sources: Vec<String>,
    /// Stylesheet origins.
    #[serde(default = "default_style_sources")]
    pub style_sources: Vec<String>,
    /// Font origins.
    #[serde(default = "default_font_sources")]
    pub font_sources: Vec<String>,
    /// Path prefixes that never get CSP treatment.
    #[serde(default = "default_csp_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

// Default value functions
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "chatgate:".to_string()
}

const fn default_session_ttl() -> u64 {
    86400 // 24 hours
}

const fn default_connect_timeout_ms() -> u64 {
    5000
}

const fn default_socket_timeout_ms() -> u64 {
    5000
}

const fn default_health_timeout_ms() -> u64 {
    1000
}

const fn default_purge_every_writes() -> u64 {
    500
}

fn default_fallback_dir() -> PathBuf {
    PathBuf::from("./data/sessions")
}

fn default_cookie_name() -> String {
    "chatgate_session".to_string()
}

const fn default_secure_cookie() -> bool {
    !cfg!(debug_assertions)
}

const fn default_token_lifetime() -> u64 {
    3600 // 1 hour
}

fn default_header_name() -> String {
    "X-CSRFToken".to_string()
}

fn default_token_field() -> String {
    "csrf_token".to_string()
}

fn default_response_header() -> String {
    "X-CSRF-Token".to_string()
}

fn default_csrf_exempt_paths() -> Vec<String> {
    vec!["/api/csp-report".to_string()]
}

const fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_report_uri() -> String {
    "/api/csp-report".to_string()
}

const fn default_violation_capacity() -> usize {
    1000
}

fn default_script_cdn_sources() -> Vec<String> {
    vec![
        "https://cdn.jsdelivr.net".to_string(),
        "https://cdnjs.cloudflare.com".to_string(),
    ]
}

fn default_analytics_sources() -> Vec<String> {
    vec![
        "https://www.googletagmanager.com".to_string(),
        "https://www.google-analytics.com".to_string(),
    ]
}

fn default_style_sources() -> Vec<String> {
    vec![
        "https://fonts.googleapis.com".to_string(),
        "https://cdn.jsdelivr.net".to_string(),
        "https://cdnjs.cloudflare.com".to_string(),
    ]
}

fn default_font_sources() -> Vec<String> {
    vec![
        "https://fonts.gstatic.com".to_string(),
        "https://cdnjs.cloudflare.com".to_string(),
    ]
}

fn default_csp_exempt_paths() -> Vec<String> {
    vec!["/api/".to_string()]
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backend: BackendChoice::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            ttl_seconds: default_session_ttl(),
            connect_timeout_ms: default_connect_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            purge_every_writes: default_purge_every_writes(),
            fallback_dir: default_fallback_dir(),
            cookie_name: default_cookie_name(),
            secure_cookie: default_secure_cookie(),
            same_site: SameSite::default(),
        }
    }
}

impl Default for CsrfSettings {
    fn default() -> Self {
        Self {
            token_lifetime_seconds: default_token_lifetime(),
            header_name: default_header_name(),
            form_field: default_token_field(),
            json_field: default_token_field(),
            response_header: default_response_header(),
            exempt_paths: default_csrf_exempt_paths(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for CspSettings {
    fn default() -> Self {
        Self {
            phase: CspPhase::default(),
            report_only: None,
            report_uri: default_report_uri(),
            violation_capacity: default_violation_capacity(),
            script_cdn_sources: default_script_cdn_sources(),
            analytics_sources: default_analytics_sources(),
            style_sources: default_style_sources(),
            font_sources: default_font_sources(),
            exempt_paths: default_csp_exempt_paths(),
        }
    }
}

impl SessionSettings {
    /// Session lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Primary backend connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Primary backend per-command timeout.
    #[must_use]
    pub const fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Health probe timeout.
    #[must_use]
    pub const fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

impl CspSettings {
    /// Whether the policy is delivered with the report-only header.
    #[must_use]
    pub fn delivers_report_only(&self) -> bool {
        self.report_only
            .unwrap_or(self.phase == CspPhase::ReportOnly)
    }
}

impl SecurityConfig {
    /// Load configuration from files and environment.
    ///
    /// Later sources win: `config/default.toml`, `config/local.toml`, then
    /// `CHATGATE_`-prefixed variables (nested with `__`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be extracted or fails
    /// [`validate`](Self::validate).
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Self::figment().extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Figment with the standard provider stack.
    #[must_use]
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Toml::file("config/local.toml"))
            .merge(Env::prefixed("CHATGATE_").split("__"))
    }

    /// Reject configurations that must not reach request handling.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSecret`] or [`ConfigError::WeakSecret`]
    /// for an unusable signing secret, and [`ConfigError::Invalid`] for
    /// zero lifetimes or capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secret_len = self.secret_key.len();
        if secret_len == 0 {
            return Err(ConfigError::MissingSecret);
        }
        if secret_len < MIN_SECRET_LEN {
            return Err(ConfigError::WeakSecret {
                min: MIN_SECRET_LEN,
                actual: secret_len,
            });
        }
        if self.csrf.token_lifetime_seconds == 0 {
            return Err(ConfigError::Invalid(
                "csrf.token_lifetime_seconds must be positive".to_string(),
            ));
        }
        if self.csp.violation_capacity == 0 {
            return Err(ConfigError::Invalid(
                "csp.violation_capacity must be positive".to_string(),
            ));
        }
        if self.session.key_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "session.key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
