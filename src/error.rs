use cellcnn_ckks::CkksError;
use thiserror::Error;

/// Configuration rejected before any state is built.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be even, got {value}")]
    NotEven { field: &'static str, value: usize },

    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: usize,
        value: usize,
    },

    #[error("{field} out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },

    #[error("layout needs {needed} slots but the ring offers {available}")]
    SlotOverflow { needed: usize, available: usize },

    #[error("invalid configuration document: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum CnnError {
    #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("encrypted arithmetic failed: {0}")]
    EncryptedArithmetic(#[from] CkksError),

    #[error("malformed message: {0}")]
    Serialization(String),

    #[error("no message within {0:?}")]
    ProtocolTimeout(std::time::Duration),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("missing state: {0}")]
    MissingState(&'static str),
}

pub type Result<T> = std::result::Result<T, CnnError>;

/// Error categories surfaced in abort diagnostics and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ShapeMismatch,
    EncryptedArithmetic,
    Serialization,
    ProtocolTimeout,
    Config,
    DataLoad,
    ProtocolAbort,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShapeMismatch => "ShapeMismatch",
            Self::EncryptedArithmetic => "EncryptedArithmeticError",
            Self::Serialization => "SerializationError",
            Self::ProtocolTimeout => "ProtocolTimeout",
            Self::Config => "ConfigError",
            Self::DataLoad => "DataLoadError",
            Self::ProtocolAbort => "ProtocolAbort",
        }
    }

    /// Process exit code for a driver that stops on this kind of error.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Config => 1,
            Self::DataLoad => 2,
            Self::Serialization | Self::ProtocolTimeout | Self::ProtocolAbort => 3,
            Self::EncryptedArithmetic | Self::ShapeMismatch => 4,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CnnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            // a missing scratch ciphertext is a scheme-invariant violation
            Self::EncryptedArithmetic(_) | Self::MissingState(_) => ErrorKind::EncryptedArithmetic,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::ProtocolTimeout(_) => ErrorKind::ProtocolTimeout,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_exit_codes() {
        let e: CnnError = CkksError::MissingRotationKey(3).into();
        assert_eq!(e.kind(), ErrorKind::EncryptedArithmetic);
        assert_eq!(e.kind().exit_code(), 4);

        let e: CnnError = ConfigError::NotEven {
            field: "features",
            value: 3,
        }
        .into();
        assert_eq!(e.kind().as_str(), "ConfigError");
        assert_eq!(e.kind().exit_code(), 1);

        assert_eq!(ErrorKind::DataLoad.exit_code(), 2);
        assert_eq!(CnnError::Serialization("x".into()).kind().exit_code(), 3);
    }
}
