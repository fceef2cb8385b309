use std::time::Duration;

use cellcnn::ConfigError;

/// Default receive timeout for a party waiting on its parent or children.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shape and behaviour of one federated training session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub parties: usize,
    /// Children per internal node.
    pub fan_out: usize,
    /// Per-receive timeout.
    pub timeout: Duration,
    pub train_plain: bool,
    pub train_encrypted: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            parties: 1,
            fan_out: 2,
            timeout: DEFAULT_TIMEOUT,
            train_plain: true,
            train_encrypted: true,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parties == 0 {
            return Err(ConfigError::TooSmall {
                field: "parties",
                min: 1,
                value: 0,
            });
        }
        if self.fan_out == 0 {
            return Err(ConfigError::TooSmall {
                field: "fan_out",
                min: 1,
                value: 0,
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "timeout",
                detail: "must be positive".into(),
            });
        }
        if !self.train_plain && !self.train_encrypted {
            return Err(ConfigError::OutOfRange {
                field: "train_plain",
                detail: "at least one of cleartext or encrypted training must run".into(),
            });
        }
        Ok(())
    }
}
