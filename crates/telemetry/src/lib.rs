//! Pass tracing and compute accounting for TokenFold.
//!
//! Records the sequence length at every stage of a forward pass, prices
//! each stage with an analytical MAC model, and reports how much compute
//! token reduction saved relative to the dense trunk.

pub mod cost;
pub mod engine;
pub mod model;

pub use cost::{gmacs, CostModel};
pub use engine::TelemetryEngine;
pub use model::{PassTrace, SavingsSummary, StageSpan};

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown trace id: {0}")]
    UnknownTrace(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
