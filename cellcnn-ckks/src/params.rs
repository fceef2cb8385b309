//! CKKS scheme parameters.
//!
//! A parameter set picks a ring dimension, a slot count, a prefix of the
//! NTT-friendly prime table as the modulus chain and a default scale. The
//! same parameters drive both backends so that level and scale bookkeeping
//! is identical between them.

use serde::{Deserialize, Serialize};

use crate::error::{CkksError, Result};
use crate::rns::ntt::{CHAIN_PRIMES, NTT_PRIMES};

/// Default scale 2^36. The chain primes sit just below 2^36, so a
/// ciphertext-ciphertext product followed by a rescale keeps the scale
/// close to this value.
pub const DEFAULT_SCALE: f64 = 68_719_476_736.0;

/// Relative tolerance under which two scales are treated as equal.
pub const SCALE_TOLERANCE: f64 = 1e-3;

/// Standard deviation for discrete Gaussian error sampling.
pub const SIGMA: f64 = 3.2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CkksParameters {
    /// log2 of the ring dimension N.
    pub log_n: u32,
    /// log2 of the number of usable slots.
    pub log_slots: u32,
    /// Modulus chain, level `l` uses `moduli[0..=l]`.
    pub moduli: Vec<i64>,
    /// Scale used for fresh encodings.
    pub default_scale: f64,
}

impl CkksParameters {
    /// Build a parameter set with `levels` primes (maximum level `levels - 1`).
    pub fn new(log_n: u32, log_slots: u32, levels: usize, default_scale: f64) -> Result<Self> {
        if levels == 0 || levels > CHAIN_PRIMES {
            return Err(CkksError::UnsupportedParameters(format!(
                "{} levels requested, between 1 and {} available",
                levels, CHAIN_PRIMES
            )));
        }
        if log_slots == 0 || log_slots >= log_n {
            return Err(CkksError::UnsupportedParameters(format!(
                "log_slots {} must be in [1, log_n = {})",
                log_slots, log_n
            )));
        }
        if !(default_scale.is_finite() && default_scale > 1.0) {
            return Err(CkksError::UnsupportedParameters(format!(
                "scale {} must be finite and > 1",
                default_scale
            )));
        }
        Ok(Self {
            log_n,
            log_slots,
            moduli: NTT_PRIMES[..levels].to_vec(),
            default_scale,
        })
    }

    pub fn n(&self) -> usize {
        1 << self.log_n
    }

    pub fn slots(&self) -> usize {
        1 << self.log_slots
    }

    pub fn max_level(&self) -> usize {
        self.moduli.len() - 1
    }

    /// Prime dropped when rescaling a ciphertext at `level`.
    pub fn q(&self, level: usize) -> f64 {
        self.moduli[level] as f64
    }

    pub fn check_level(&self, level: usize) -> Result<()> {
        if level > self.max_level() {
            return Err(CkksError::InvalidLevel {
                level,
                max: self.max_level(),
            });
        }
        Ok(())
    }

    /// Normalize a rotation amount into `[0, slots)`.
    pub fn normalize_rotation(&self, k: i64) -> usize {
        k.rem_euclid(self.slots() as i64) as usize
    }
}

/// True when two scales agree within [`SCALE_TOLERANCE`].
pub fn scales_match(a: f64, b: f64) -> bool {
    (a / b - 1.0).abs() <= SCALE_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_prime_prefix() {
        let p = CkksParameters::new(10, 9, 4, DEFAULT_SCALE).unwrap();
        assert_eq!(p.max_level(), 3);
        assert_eq!(p.moduli, NTT_PRIMES[..4].to_vec());
        assert_eq!(p.slots(), 512);
        assert_eq!(p.n(), 1024);
    }

    #[test]
    fn rejects_bad_slot_count() {
        assert!(CkksParameters::new(10, 10, 4, DEFAULT_SCALE).is_err());
        assert!(CkksParameters::new(10, 0, 4, DEFAULT_SCALE).is_err());
    }

    #[test]
    fn rejects_too_many_levels() {
        assert!(CkksParameters::new(10, 9, 20, DEFAULT_SCALE).is_err());
        assert!(CkksParameters::new(10, 9, 19, DEFAULT_SCALE).is_ok());
        assert!(CkksParameters::new(10, 9, 0, DEFAULT_SCALE).is_err());
    }

    #[test]
    fn rotation_normalization_wraps_negative() {
        let p = CkksParameters::new(6, 4, 2, DEFAULT_SCALE).unwrap();
        assert_eq!(p.normalize_rotation(-1), 15);
        assert_eq!(p.normalize_rotation(17), 1);
        assert_eq!(p.normalize_rotation(0), 0);
    }

    #[test]
    fn scale_tolerance() {
        assert!(scales_match(DEFAULT_SCALE, DEFAULT_SCALE * (1.0 + 4e-5)));
        assert!(!scales_match(DEFAULT_SCALE, DEFAULT_SCALE * 1.01));
    }

    #[test]
    fn default_scale_is_close_to_chain_primes() {
        for &q in NTT_PRIMES.iter() {
            assert!(scales_match(q as f64, DEFAULT_SCALE));
        }
    }
}
