//! Typed configuration errors.

use thiserror::Error;

/// Reasons a [`TransformerConfig`](crate::model::TransformerConfig) is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    #[error("additive positional encoding needs pe_size == embedding width ({width}), got {pe_size}")]
    PeWidthMismatch { pe_size: usize, width: usize },

    #[error("pe_size must be even when positional encoding is enabled, got {0}")]
    OddPeSize(usize),

    #[error(
        "test_points ({test_points}) must be smaller than the shorter context length ({context})"
    )]
    TooManyTestPoints { test_points: usize, context: usize },

    #[error("dropout_rate must lie in [0, 1), got {0}")]
    DropoutOutOfRange(f32),

    #[error("clip must be non-negative, got {0}")]
    NegativeClip(f64),

    #[error("{0} are mutually exclusive")]
    Conflicting(&'static str),

    #[error("{0}")]
    Unsupported(&'static str),
}

impl From<ConfigError> for candle_core::Error {
    fn from(err: ConfigError) -> Self {
        candle_core::Error::Msg(err.to_string())
    }
}
