//! Phase-dependent policy construction.

use super::CspPhase;
use crate::config::CspSettings;

/// Header name for an enforced policy.
pub const ENFORCE_HEADER: &str = "Content-Security-Policy";

/// Header name for a report-only policy.
pub const REPORT_ONLY_HEADER: &str = "Content-Security-Policy-Report-Only";

/// A built policy and the header it should be delivered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyHeader {
    /// Header name.
    pub name: &'static str,
    /// Directive string.
    pub value: String,
}

/// Origin allow-lists that feed the directives.
#[derive(Debug, Clone, Default)]
pub struct SourceLists {
    /// Script CDNs, allowed in every phase.
    pub script_cdn: Vec<String>,
    /// Analytics origins, dropped in the strict phase.
    pub analytics: Vec<String>,
    /// Stylesheet origins.
    pub style: Vec<String>,
    /// Font origins.
    pub font: Vec<String>,
}

impl From<&CspSettings> for SourceLists {
    fn from(settings: &CspSettings) -> Self {
        Self {
            script_cdn: settings.script_cdn_sources.clone(),
            analytics: settings.analytics_sources.clone(),
            style: settings.style_sources.clone(),
            font: settings.font_sources.clone(),
        }
    }
}

struct Directive {
    parts: Vec<String>,
}

impl Directive {
    fn new(name: &str) -> Self {
        Self {
            parts: vec![name.to_string()],
        }
    }

    fn with(mut self, source: impl Into<String>) -> Self {
        self.parts.push(source.into());
        self
    }

    fn with_all(mut self, sources: &[String]) -> Self {
        self.parts.extend(sources.iter().cloned());
        self
    }

    fn render(self) -> String {
        self.parts.join(" ")
    }
}

/// Build the policy for `phase`. `report_only` only picks the header name.
#[must_use]
pub fn build_header(
    nonce: &str,
    phase: CspPhase,
    report_only: bool,
    sources: &SourceLists,
    report_uri: &str,
) -> PolicyHeader {
    let nonce_source = format!("'nonce-{nonce}'");

    let script = match phase {
        CspPhase::ReportOnly => Directive::new("script-src")
            .with("'self'")
            .with("'unsafe-inline'")
            .with("'unsafe-eval'")
            .with(nonce_source.clone())
            .with_all(&sources.script_cdn)
            .with_all(&sources.analytics),
        CspPhase::Mixed => Directive::new("script-src")
            .with("'self'")
            .with(nonce_source.clone())
            .with_all(&sources.script_cdn)
            .with_all(&sources.analytics),
        CspPhase::Strict => Directive::new("script-src")
            .with("'self'")
            .with(nonce_source.clone())
            .with("'strict-dynamic'")
            .with_all(&sources.script_cdn),
    };

    let style = match phase {
        CspPhase::ReportOnly => Directive::new("style-src")
            .with("'self'")
            .with("'unsafe-inline'")
            .with_all(&sources.style),
        CspPhase::Mixed => Directive::new("style-src")
            .with("'self'")
            .with("'unsafe-inline'")
            .with(nonce_source)
            .with_all(&sources.style),
        CspPhase::Strict => Directive::new("style-src")
            .with("'self'")
            .with(nonce_source)
            .with_all(&sources.style),
    };

    let mut directives = vec![
        Directive::new("default-src").with("'self'").render(),
        script.render(),
        style.render(),
        Directive::new("font-src")
            .with("'self'")
            .with("data:")
            .with_all(&sources.font)
            .render(),
        "img-src 'self' data: blob: https:".to_string(),
        Directive::new("connect-src")
            .with("'self'")
            .with_all(&sources.analytics)
            .render(),
        "media-src 'self' blob:".to_string(),
        "object-src 'none'".to_string(),
        "frame-ancestors 'none'".to_string(),
        "base-uri 'self'".to_string(),
        "form-action 'self'".to_string(),
    ];

    match phase {
        CspPhase::ReportOnly => {}
        CspPhase::Mixed => directives.push("upgrade-insecure-requests".to_string()),
        CspPhase::Strict => {
            directives.push("upgrade-insecure-requests".to_string());
            directives.push("block-all-mixed-content".to_string());
        }
    }
    directives.push(format!("report-uri {report_uri}"));

    PolicyHeader {
        name: if report_only {
            REPORT_ONLY_HEADER
        } else {
            ENFORCE_HEADER
        },
        value: directives.join("; "),
    }
}
