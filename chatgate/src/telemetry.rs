//! Tracing setup and log-safe renderings of secrets.

use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

/// Characters of a CSRF token that may appear in logs.
pub const TOKEN_LOG_PREFIX: usize = 8;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "chatgate=info,chatgate_server=info,tower_http=info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Install the global tracing subscriber.
///
/// Does nothing if a subscriber is already installed, so tests and embedding
/// applications can call it freely.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .parse_lossy(
            std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
        );

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Short, non-sensitive prefix of a token for log lines.
#[must_use]
pub fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(TOKEN_LOG_PREFIX).collect();
    if token.chars().count() > TOKEN_LOG_PREFIX {
        format!("{prefix}...")
    } else {
        prefix
    }
}

/// Backend URL with credentials removed.
#[must_use]
pub fn redact_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return "<unparseable url>".to_string();
    };
    if url.password().is_some() {
        let _ = url.set_password(Some("***"));
    }
    url.to_string()
}
