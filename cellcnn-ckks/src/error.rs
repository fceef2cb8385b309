//! Error types for leveled CKKS arithmetic.

use thiserror::Error;

/// Failures raised by a CKKS backend or the evaluator built on it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CkksError {
    #[error("level exhausted: cannot {op} a ciphertext at level {level}")]
    LevelExhausted { op: &'static str, level: usize },

    #[error("invalid level {level} (maximum {max})")]
    InvalidLevel { level: usize, max: usize },

    #[error("missing rotation key for rotation {0}")]
    MissingRotationKey(i64),

    #[error("missing relinearization key")]
    MissingRelinearizationKey,

    #[error("missing conjugation key")]
    MissingConjugationKey,

    #[error("scale mismatch: {left:.6e} vs {right:.6e}")]
    ScaleMismatch { left: f64, right: f64 },

    #[error("ciphertext degree {0} too high for this operation (relinearize first)")]
    DegreeTooHigh(usize),

    #[error("too many values: {count} > {slots} slots")]
    TooManyValues { count: usize, slots: usize },

    #[error("unsupported parameters: {0}")]
    UnsupportedParameters(String),

    #[error("operands were encrypted under different keys")]
    KeyMismatch,

    #[error("polynomial degree {0} not supported (max 3)")]
    PolynomialDegree(usize),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CkksError>;

impl From<bincode::Error> for CkksError {
    fn from(e: bincode::Error) -> Self {
        CkksError::Serialization(e.to_string())
    }
}
