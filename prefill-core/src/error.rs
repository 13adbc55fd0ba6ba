use thiserror::Error;

use crate::types::DType;

#[derive(Error, Debug)]
pub enum PrefillError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Head dim mismatch: q={q}, k={k}, v={v}")]
    HeadDimMismatch { q: usize, k: usize, v: usize },

    #[error("Unsupported head dim: {0} (supported: 16, 32, 64, 128)")]
    UnsupportedHeadDim(usize),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Dtype mismatch: expected {expected:?}, got {got:?} for {what}")]
    DtypeMismatch {
        what: &'static str,
        expected: DType,
        got: DType,
    },

    #[error("Invalid sequence {index}: {reason}")]
    InvalidSequence { index: usize, reason: String },

    #[error("Invalid block table: {0}")]
    InvalidBlockTable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PrefillError>;
