//! Error types for the flow core

use thiserror::Error;

/// Flow error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// Input length or tensor shape does not fit the channel grouping
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Invalid layer, stack or chunking configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Mixing matrix cannot be inverted
    #[error("Singular {channels}x{channels} mixing matrix")]
    SingularMatrix { channels: usize },

    /// Mixing matrix would flip orientation (or collapse)
    #[error("Mixing matrix determinant must be positive, got {determinant}")]
    NonPositiveDeterminant { determinant: f64 },

    /// Parameter name not known to the stack
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// Parameter required by the stack is absent
    #[error("Missing parameter: {0}")]
    MissingParameter(String),
}

impl FlowError {
    pub(crate) fn shape(expected: impl Into<String>, got: impl Into<String>) -> Self {
        FlowError::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Result type for flow operations
pub type FlowResult<T> = Result<T, FlowError>;
