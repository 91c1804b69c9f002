use thiserror::Error;

use crate::types::DType;

#[derive(Error, Debug)]
pub enum LoupeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid generation config: {0}")]
    InvalidConfig(String),

    #[error("Numeric error: {0}")]
    Numeric(String),

    #[error("Unsupported dtype: {0:?}")]
    UnsupportedDtype(DType),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LoupeError {
    /// True for a missing checkpoint, feature file, or image reference.
    pub fn is_not_found(&self) -> bool {
        match self {
            LoupeError::NotFound(_) => true,
            LoupeError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoupeError>;
