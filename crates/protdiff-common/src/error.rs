//! Error types shared across the protdiff workspace.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors produced by loss computation and perplexity evaluation.
#[derive(Debug, Error)]
pub enum ProtDiffError {
    #[error("{op}: expected shape {expected}, got {actual:?}")]
    Shape { op: &'static str, expected: String, actual: Vec<usize> },

    #[error("timestep {timestep} for sequence {index} is outside [1, {tmax}]")]
    InvalidTimestep { index: usize, timestep: u32, tmax: usize },

    #[error("token {token} is outside the {vocab}-token vocabulary")]
    InvalidToken { token: u32, vocab: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("dataset is empty")]
    EmptyDataset,

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtDiffError {
    /// Shape mismatch helper used by the validation functions in [`crate::tensor`].
    pub fn shape(op: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        Self::Shape { op, expected: expected.into(), actual: actual.to_vec() }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, ProtDiffError>;
