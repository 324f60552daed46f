//! Error types for the TokenFold domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Every error is fatal to
//! the forward pass that raised it: the pipeline is deterministic, so there
//! is nothing to retry.

use thiserror::Error;

/// The top-level error type for all TokenFold operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Schedule / cache / model configuration ---
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // --- Tensor shape contracts between collaborators ---
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    // --- Tensor engine ---
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    // --- Configuration files ---
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for an [`Error::InvalidConfiguration`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Shorthand for an [`Error::ShapeMismatch`].
    pub fn shape(
        context: &'static str,
        expected: impl Into<String>,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.into(),
            actual: format!("{actual:?}"),
        }
    }

    /// Whether this error came from a malformed configuration rather than
    /// from the data flowing through a pass.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration(_) | Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_configuration_displays_correctly() {
        let err = Error::invalid("keep_rate must be in (0, 1], got 1.5");
        assert!(err.to_string().contains("Invalid configuration"));
        assert!(err.to_string().contains("1.5"));
        assert!(err.is_configuration());
    }

    #[test]
    fn shape_mismatch_displays_correctly() {
        let err = Error::shape("relevance scorer", "[2, H, 197, 197]", [2, 12, 179, 179]);
        let text = err.to_string();
        assert!(text.contains("relevance scorer"));
        assert!(text.contains("197"));
        assert!(text.contains("179"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn tensor_errors_convert() {
        let err: Error = candle_core::Error::Msg("boom".into()).into();
        assert!(matches!(err, Error::Tensor(_)));
        assert!(err.to_string().contains("boom"));
    }
}
