//! Error types for denoiser operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DenoiserError {
    /// Invalid or inconsistent configuration. Always fatal and raised before
    /// any tensor work happens.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Predicted/target/mask tensors or pyramid scale counts disagree.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DenoiserError {
    pub fn configuration(message: impl Into<String>) -> Self {
        DenoiserError::Configuration(message.into())
    }

    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        DenoiserError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
