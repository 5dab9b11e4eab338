//! Middleware layers for chatgate
//!
//! Provides:
//! - A generic ordered pipeline of request/response stages
//! - The standard CSRF and CSP stages and the layer that runs them

pub mod pipeline;
pub mod security;

pub use pipeline::{Pipeline, PipelineEntry, Predicate, Stage, StageContext};
pub use security::{
    standard_pipeline, CsrfEnsureStage, CsrfRotateStage, CsrfVerifyStage, CspStage,
    SecurityLayer, SecurityMiddleware,
};
