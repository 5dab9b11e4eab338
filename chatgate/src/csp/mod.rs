//! Content-Security-Policy: phased policies, nonces and violation telemetry.
//!
//! The [`CspPolicyEngine`] is built once at startup. It owns the configured
//! [`CspPhase`], the origin allow-lists and the violation buffer; everything
//! else here is pure.

mod nonce;
mod policy;
mod report;

pub use nonce::{generate_nonce, inject_nonce};
pub use policy::{build_header, PolicyHeader, SourceLists, ENFORCE_HEADER, REPORT_ONLY_HEADER};
pub use report::{
    BlockedUriCount, ViolationLog, ViolationRecord, ViolationSummary, MAX_FIELD_LEN,
    TOP_BLOCKED_URIS,
};

use crate::config::CspSettings;
use axum::response::{IntoResponseParts, ResponseParts};
use serde::Deserialize;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Enforcement phase, fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CspPhase {
    /// Permissive policy, reported but not enforced.
    #[default]
    ReportOnly,
    /// Nonce-based scripts, inline styles still allowed.
    Mixed,
    /// Nonces only, no `unsafe-*` sources.
    Strict,
}

impl fmt::Display for CspPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReportOnly => "report_only",
            Self::Mixed => "mixed",
            Self::Strict => "strict",
        })
    }
}

/// Unrecognized phase name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown CSP phase '{0}' (expected report_only, mixed or strict)")]
pub struct UnknownPhase(String);

impl FromStr for CspPhase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "report_only" | "reportonly" => Ok(Self::ReportOnly),
            "mixed" => Ok(Self::Mixed),
            "strict" => Ok(Self::Strict),
            _ => Err(UnknownPhase(s.to_string())),
        }
    }
}

/// Response marker that opts a response out of CSP handling.
///
/// ```rust,ignore
/// async fn raw() -> impl IntoResponse {
///     (CspExempt, Html("<script>legacy()</script>"))
/// }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CspExempt;

impl IntoResponseParts for CspExempt {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        res.extensions_mut().insert(self);
        Ok(res)
    }
}

/// Builds policies for the configured phase and collects violation reports.
#[derive(Debug)]
pub struct CspPolicyEngine {
    phase: CspPhase,
    report_only: bool,
    report_uri: String,
    sources: SourceLists,
    exempt_paths: Vec<String>,
    violations: ViolationLog,
}

impl CspPolicyEngine {
    /// Engine for `settings`.
    #[must_use]
    pub fn new(settings: &CspSettings) -> Self {
        Self {
            phase: settings.phase,
            report_only: settings.delivers_report_only(),
            report_uri: settings.report_uri.clone(),
            sources: SourceLists::from(settings),
            exempt_paths: settings.exempt_paths.clone(),
            violations: ViolationLog::new(settings.violation_capacity),
        }
    }

    /// Configured phase.
    #[must_use]
    pub const fn phase(&self) -> CspPhase {
        self.phase
    }

    /// Fresh nonce for one response.
    #[must_use]
    pub fn generate_nonce(&self) -> String {
        generate_nonce()
    }

    /// Policy for an explicit phase and delivery mode, using this engine's
    /// allow-lists and report endpoint.
    #[must_use]
    pub fn build_header(&self, nonce: &str, phase: CspPhase, report_only: bool) -> PolicyHeader {
        build_header(nonce, phase, report_only, &self.sources, &self.report_uri)
    }

    /// Policy for the configured phase and delivery mode.
    #[must_use]
    pub fn header_for(&self, nonce: &str) -> PolicyHeader {
        self.build_header(nonce, self.phase, self.report_only)
    }

    /// Rewrite `html` so its inline scripts and styles carry `nonce`.
    #[must_use]
    pub fn inject_nonce(&self, html: &str, nonce: &str) -> String {
        inject_nonce(html, nonce)
    }

    /// Whether `path` falls under an exempt prefix.
    #[must_use]
    pub fn is_exempt_path(&self, path: &str) -> bool {
        self.exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Ingest one report body. Payloads without a `csp-report` object are
    /// dropped; the return value says whether anything was stored.
    pub fn record_violation(&self, body: &serde_json::Value, user_agent: Option<&str>) -> bool {
        let Some(record) = ViolationRecord::from_report(body, user_agent) else {
            debug!("Discarding malformed CSP report");
            return false;
        };
        debug!(
            directive = %record.violated_directive,
            blocked_uri = %record.blocked_uri,
            "CSP violation reported"
        );
        self.violations.push(record);
        true
    }

    /// Aggregate the buffered reports.
    #[must_use]
    pub fn summarize(&self, recent: usize) -> ViolationSummary {
        self.violations.summarize(recent.min(self.violations.capacity()))
    }

    /// Drop all buffered reports; returns how many were removed.
    pub fn clear_violations(&self) -> usize {
        self.violations.clear()
    }

    /// Buffered reports.
    #[must_use]
    pub fn violation_count(&self) -> usize {
        self.violations.len()
    }
}
