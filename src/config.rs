//! Immutable training configuration.

use cellcnn_ckks::CkksParameters;
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::context::{PREDICTION_DEPTH, PREDICTION_HEADROOM};
use crate::error::{CnnError, ConfigError, Result};
use crate::layout::Layout;

/// Fewest levels the forward, refresh, backward and prediction chain fits in,
/// with one prime left under the prediction scores.
pub const MIN_LEVELS: usize = PREDICTION_DEPTH + PREDICTION_HEADROOM + 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnnConfig {
    /// Cells per sample.
    pub cells: usize,
    /// Markers per cell.
    pub features: usize,
    /// Filters in the convolution bank.
    pub filters: usize,
    pub classes: usize,
    pub batch_size: usize,
    /// Samples held by one party.
    pub samples: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub epochs: usize,
    pub log_n: u32,
    pub log_slots: u32,
    pub scale: f64,
    pub levels: usize,
    pub deterministic: bool,
    pub seed: u64,
    pub activation: Activation,
    /// Parties contributing a gradient each iteration.
    pub n_parties: usize,
    /// Add encryption noise on the simulated backend.
    pub encryption_noise: bool,
}

impl Default for CnnConfig {
    fn default() -> Self {
        Self {
            cells: 200,
            features: 38,
            filters: 8,
            classes: 2,
            batch_size: 16,
            samples: 200,
            learning_rate: 0.1,
            momentum: 0.9,
            epochs: 1,
            log_n: 14,
            log_slots: 13,
            scale: cellcnn_ckks::DEFAULT_SCALE,
            levels: 12,
            deterministic: false,
            seed: 0,
            activation: Activation::Narrow,
            n_parties: 1,
            encryption_noise: false,
        }
    }
}

fn require_even(field: &'static str, value: usize) -> std::result::Result<(), ConfigError> {
    if value % 2 != 0 {
        return Err(ConfigError::NotEven { field, value });
    }
    Ok(())
}

fn require_min(field: &'static str, min: usize, value: usize) -> std::result::Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall { field, min, value });
    }
    Ok(())
}

impl CnnConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CnnError::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        require_min("features", 2, self.features)?;
        require_even("features", self.features)?;
        require_min("filters", 2, self.filters)?;
        require_even("filters", self.filters)?;
        require_min("batch_size", 2, self.batch_size)?;
        require_even("batch_size", self.batch_size)?;
        require_min("classes", 1, self.classes)?;
        require_min("cells", 2, self.cells)?;
        require_even("cells", self.cells)?;
        require_min("samples", 1, self.samples)?;
        require_min("epochs", 1, self.epochs)?;
        require_min("n_parties", 1, self.n_parties)?;
        require_min("levels", MIN_LEVELS, self.levels)?;
        if self.log_slots == 0 || self.log_slots >= self.log_n {
            return Err(ConfigError::OutOfRange {
                field: "log_slots",
                detail: format!("{} must be in [1, log_n = {})", self.log_slots, self.log_n),
            });
        }
        if !(self.scale.is_finite() && self.scale > 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "scale",
                detail: format!("{} must be finite and > 1", self.scale),
            });
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 10.0) {
            return Err(ConfigError::OutOfRange {
                field: "learning_rate",
                detail: format!("{} not in (0, 10]", self.learning_rate),
            });
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::OutOfRange {
                field: "momentum",
                detail: format!("{} not in [0, 1)", self.momentum),
            });
        }
        let needed = Layout::new(self).used_slots();
        let available = 1usize << self.log_slots;
        if needed > available {
            return Err(ConfigError::SlotOverflow { needed, available });
        }
        Ok(())
    }

    /// `⌈epochs · samples / batch_size⌉`.
    pub fn max_iterations(&self) -> usize {
        (self.epochs * self.samples).div_ceil(self.batch_size)
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self)
    }

    pub fn ckks_parameters(&self) -> Result<CkksParameters> {
        Ok(CkksParameters::new(self.log_n, self.log_slots, self.levels, self.scale)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> CnnConfig {
        CnnConfig {
            cells: 2,
            features: 4,
            filters: 2,
            classes: 2,
            batch_size: 2,
            samples: 1,
            log_n: 8,
            log_slots: 7,
            ..CnnConfig::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        CnnConfig::default().validate().unwrap();
        tiny().validate().unwrap();
    }

    #[test]
    fn odd_dimensions_rejected() {
        let c = CnnConfig {
            features: 5,
            ..tiny()
        };
        assert_eq!(
            c.validate(),
            Err(ConfigError::NotEven {
                field: "features",
                value: 5
            })
        );
        let c = CnnConfig {
            batch_size: 3,
            ..tiny()
        };
        assert!(matches!(c.validate(), Err(ConfigError::NotEven { .. })));
        let c = CnnConfig { cells: 3, ..tiny() };
        assert_eq!(
            c.validate(),
            Err(ConfigError::NotEven {
                field: "cells",
                value: 3
            })
        );
    }

    #[test]
    fn too_few_levels_and_slots() {
        assert_eq!(MIN_LEVELS, 11);
        let c = CnnConfig { levels: 10, ..tiny() };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::TooSmall { field: "levels", min: 11, value: 10 })
        ));
        let c = CnnConfig {
            log_n: 7,
            log_slots: 6,
            ..tiny()
        };
        assert!(matches!(c.validate(), Err(ConfigError::SlotOverflow { needed: 74, .. })));
    }

    #[test]
    fn iterations_round_up() {
        let c = CnnConfig {
            samples: 33,
            batch_size: 16,
            epochs: 2,
            ..CnnConfig::default()
        };
        assert_eq!(c.max_iterations(), 5);
    }

    #[test]
    fn json_roundtrip_with_partial_document() {
        let c = CnnConfig::from_json(r#"{"features": 4, "filters": 2, "activation": "Wide"}"#).unwrap();
        assert_eq!(c.features, 4);
        assert_eq!(c.activation, Activation::Wide);
        assert_eq!(c.batch_size, 16);
        let back = CnnConfig::from_json(&c.to_json().unwrap()).unwrap();
        assert_eq!(back, c);
        assert!(matches!(
            CnnConfig::from_json(r#"{"features": 3}"#),
            Err(CnnError::Config(ConfigError::NotEven { .. }))
        ));
    }
}
