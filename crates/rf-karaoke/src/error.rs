//! Error types for the separation engine

use rf_flow::FlowError;
use thiserror::Error;

/// Separation engine error types
#[derive(Error, Debug)]
pub enum SeparationError {
    /// Error raised inside the flow core
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// Mixed/target signals do not line up or do not fit the grouping
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Rejected engine configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SeparationError {
    pub(crate) fn shape(expected: impl Into<String>, got: impl Into<String>) -> Self {
        SeparationError::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Result type for separation operations
pub type SeparationResult<T> = Result<T, SeparationError>;
