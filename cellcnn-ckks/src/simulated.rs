//! Slot-level simulation of the CKKS interface.
//!
//! Ciphertexts carry their slot vector in the clear next to the level, scale
//! and degree bookkeeping a lattice ciphertext would have, plus the
//! fingerprint of the key that encrypted them. Every rule the lattice
//! backend enforces (key presence, level exhaustion, scale agreement,
//! relinearization before rotation) is enforced here as well, and values are
//! re-quantized at the current scale on encode and rescale so precision loss
//! tracks the real scheme. Encryption can add Gaussian noise.
//!
//! It exists for fast functional testing of circuits at full layout sizes.
//! It offers no confidentiality.

use std::collections::BTreeSet;

use num_complex::Complex64;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CkksError, Result};
use crate::params::{scales_match, CkksParameters, SIGMA};
use crate::scheme::{CkksScheme, Leveled};

pub type KeyId = [u8; 32];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimPlaintext {
    pub values: Vec<Complex64>,
    pub level: usize,
    pub scale: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimCiphertext {
    pub key_id: KeyId,
    pub values: Vec<Complex64>,
    pub level: usize,
    pub scale: f64,
    pub degree: usize,
}

impl Leveled for SimPlaintext {
    fn level(&self) -> usize {
        self.level
    }
    fn scale(&self) -> f64 {
        self.scale
    }
}

impl Leveled for SimCiphertext {
    fn level(&self) -> usize {
        self.level
    }
    fn scale(&self) -> f64 {
        self.scale
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimSecretKey {
    pub share: [u8; 32],
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimPublicKey {
    pub key_id: KeyId,
}

#[derive(Clone, Debug)]
pub struct SimEvaluationKeys {
    pub key_id: KeyId,
    pub rotations: BTreeSet<usize>,
}

/// Simulated backend. `noise_std` is the standard deviation of the slot
/// noise added at encryption, in units of the coefficient error (it is
/// divided by the scale).
#[derive(Clone, Debug)]
pub struct SimulatedCkks {
    params: CkksParameters,
    noise_std: f64,
}

impl SimulatedCkks {
    pub fn new(params: CkksParameters) -> Self {
        Self {
            params,
            noise_std: 0.0,
        }
    }

    /// Add encryption noise comparable to a ring of dimension N with σ = 3.2.
    pub fn with_encryption_noise(params: CkksParameters) -> Self {
        let noise_std = SIGMA * (params.n() as f64).sqrt();
        Self { params, noise_std }
    }

    pub fn noise_std(&self) -> f64 {
        self.noise_std
    }

    fn key_id(sk: &SimSecretKey) -> KeyId {
        let mut hasher = Sha256::new();
        hasher.update(b"cellcnn-sim-key\0");
        hasher.update(sk.share);
        hasher.finalize().into()
    }

    fn quantize(values: &mut [Complex64], scale: f64) {
        for v in values.iter_mut() {
            *v = Complex64::new((v.re * scale).round() / scale, (v.im * scale).round() / scale);
        }
    }

    fn check_pair(&self, a: &SimCiphertext, b: &SimCiphertext) -> Result<()> {
        if a.key_id != b.key_id {
            return Err(CkksError::KeyMismatch);
        }
        Ok(())
    }

    fn check_keys(&self, ct: &SimCiphertext, keys: &SimEvaluationKeys) -> Result<()> {
        if ct.key_id != keys.key_id {
            return Err(CkksError::KeyMismatch);
        }
        if ct.degree > 1 {
            return Err(CkksError::DegreeTooHigh(ct.degree));
        }
        Ok(())
    }

    fn combine(
        &self,
        a: &SimCiphertext,
        b_values: &[Complex64],
        b_scale: f64,
        b_level: usize,
        b_degree: usize,
        sign: f64,
    ) -> Result<SimCiphertext> {
        if !scales_match(a.scale, b_scale) {
            return Err(CkksError::ScaleMismatch {
                left: a.scale,
                right: b_scale,
            });
        }
        // The second operand is read at the first operand's scale.
        let ratio = b_scale / a.scale;
        let values = a
            .values
            .iter()
            .zip(b_values.iter())
            .map(|(x, y)| *x + *y * (sign * ratio))
            .collect();
        Ok(SimCiphertext {
            key_id: a.key_id,
            values,
            level: a.level.min(b_level),
            scale: a.scale,
            degree: a.degree.max(b_degree),
        })
    }
}

impl CkksScheme for SimulatedCkks {
    type Plaintext = SimPlaintext;
    type Ciphertext = SimCiphertext;
    type SecretKey = SimSecretKey;
    type PublicKey = SimPublicKey;
    type EvaluationKeys = SimEvaluationKeys;

    fn params(&self) -> &CkksParameters {
        &self.params
    }

    fn gen_secret_key(&self, rng: &mut dyn RngCore) -> SimSecretKey {
        let mut share = [0u8; 32];
        rng.fill_bytes(&mut share);
        SimSecretKey { share }
    }

    fn aggregate_secret_keys(&self, shares: &[SimSecretKey]) -> Result<SimSecretKey> {
        if shares.is_empty() {
            return Err(CkksError::UnsupportedParameters("no key shares".into()));
        }
        // Byte-wise wrapping sum stands in for the sum of ring elements.
        let mut share = [0u8; 32];
        for s in shares {
            for (acc, b) in share.iter_mut().zip(s.share.iter()) {
                *acc = acc.wrapping_add(*b);
            }
        }
        Ok(SimSecretKey { share })
    }

    fn gen_public_key(&self, sk: &SimSecretKey, _rng: &mut dyn RngCore) -> SimPublicKey {
        SimPublicKey {
            key_id: Self::key_id(sk),
        }
    }

    fn gen_evaluation_keys(
        &self,
        sk: &SimSecretKey,
        rotations: &[i64],
        _rng: &mut dyn RngCore,
    ) -> Result<SimEvaluationKeys> {
        let rotations = rotations
            .iter()
            .map(|&k| self.params.normalize_rotation(k))
            .filter(|&k| k != 0)
            .collect();
        Ok(SimEvaluationKeys {
            key_id: Self::key_id(sk),
            rotations,
        })
    }

    fn encode(&self, values: &[Complex64], level: usize, scale: f64) -> Result<SimPlaintext> {
        self.params.check_level(level)?;
        let slots = self.params.slots();
        if values.len() > slots {
            return Err(CkksError::TooManyValues {
                count: values.len(),
                slots,
            });
        }
        let mut padded = values.to_vec();
        padded.resize(slots, Complex64::new(0.0, 0.0));
        Self::quantize(&mut padded, scale);
        Ok(SimPlaintext {
            values: padded,
            level,
            scale,
        })
    }

    fn decode(&self, pt: &SimPlaintext) -> Vec<Complex64> {
        pt.values.clone()
    }

    fn encrypt(
        &self,
        pt: &SimPlaintext,
        pk: &SimPublicKey,
        rng: &mut dyn RngCore,
    ) -> Result<SimCiphertext> {
        let mut values = pt.values.clone();
        if self.noise_std > 0.0 {
            let std = self.noise_std / pt.scale;
            for v in values.iter_mut() {
                *v += Complex64::new(gaussian(rng) * std, gaussian(rng) * std);
            }
        }
        Ok(SimCiphertext {
            key_id: pk.key_id,
            values,
            level: pt.level,
            scale: pt.scale,
            degree: 1,
        })
    }

    fn decrypt(&self, ct: &SimCiphertext, sk: &SimSecretKey) -> Result<SimPlaintext> {
        if ct.key_id != Self::key_id(sk) {
            return Err(CkksError::KeyMismatch);
        }
        Ok(SimPlaintext {
            values: ct.values.clone(),
            level: ct.level,
            scale: ct.scale,
        })
    }

    fn add(&self, a: &SimCiphertext, b: &SimCiphertext) -> Result<SimCiphertext> {
        self.check_pair(a, b)?;
        self.combine(a, &b.values, b.scale, b.level, b.degree, 1.0)
    }

    fn sub(&self, a: &SimCiphertext, b: &SimCiphertext) -> Result<SimCiphertext> {
        self.check_pair(a, b)?;
        self.combine(a, &b.values, b.scale, b.level, b.degree, -1.0)
    }

    fn add_plain(&self, ct: &SimCiphertext, pt: &SimPlaintext) -> Result<SimCiphertext> {
        self.combine(ct, &pt.values, pt.scale, pt.level, 1, 1.0)
    }

    fn sub_plain(&self, ct: &SimCiphertext, pt: &SimPlaintext) -> Result<SimCiphertext> {
        self.combine(ct, &pt.values, pt.scale, pt.level, 1, -1.0)
    }

    fn add_const(&self, ct: &SimCiphertext, c: Complex64) -> Result<SimCiphertext> {
        let c = Complex64::new(
            (c.re * ct.scale).round() / ct.scale,
            (c.im * ct.scale).round() / ct.scale,
        );
        let mut out = ct.clone();
        for v in out.values.iter_mut() {
            *v += c;
        }
        Ok(out)
    }

    fn mul(&self, a: &SimCiphertext, b: &SimCiphertext) -> Result<SimCiphertext> {
        self.check_pair(a, b)?;
        if a.degree > 1 || b.degree > 1 {
            return Err(CkksError::DegreeTooHigh(a.degree.max(b.degree)));
        }
        Ok(SimCiphertext {
            key_id: a.key_id,
            values: a.values.iter().zip(b.values.iter()).map(|(x, y)| *x * *y).collect(),
            level: a.level.min(b.level),
            scale: a.scale * b.scale,
            degree: 2,
        })
    }

    fn relinearize(&self, ct: &SimCiphertext, keys: &SimEvaluationKeys) -> Result<SimCiphertext> {
        if ct.key_id != keys.key_id {
            return Err(CkksError::MissingRelinearizationKey);
        }
        let mut out = ct.clone();
        out.degree = 1;
        Ok(out)
    }

    fn mul_plain(&self, ct: &SimCiphertext, pt: &SimPlaintext) -> Result<SimCiphertext> {
        Ok(SimCiphertext {
            key_id: ct.key_id,
            values: ct.values.iter().zip(pt.values.iter()).map(|(x, y)| *x * *y).collect(),
            level: ct.level.min(pt.level),
            scale: ct.scale * pt.scale,
            degree: ct.degree,
        })
    }

    fn mul_const(&self, ct: &SimCiphertext, c: Complex64, const_scale: f64) -> Result<SimCiphertext> {
        let c = Complex64::new(
            (c.re * const_scale).round() / const_scale,
            (c.im * const_scale).round() / const_scale,
        );
        let mut out = ct.clone();
        for v in out.values.iter_mut() {
            *v *= c;
        }
        out.scale *= const_scale;
        Ok(out)
    }

    fn mul_by_i(&self, ct: &SimCiphertext) -> SimCiphertext {
        let mut out = ct.clone();
        for v in out.values.iter_mut() {
            *v *= Complex64::i();
        }
        out
    }

    fn rescale(&self, ct: &SimCiphertext) -> Result<SimCiphertext> {
        if ct.level == 0 {
            return Err(CkksError::LevelExhausted {
                op: "rescale",
                level: 0,
            });
        }
        let mut out = ct.clone();
        out.scale /= self.params.q(ct.level);
        out.level -= 1;
        Self::quantize(&mut out.values, out.scale);
        Ok(out)
    }

    fn drop_level(&self, ct: &SimCiphertext, levels: usize) -> Result<SimCiphertext> {
        if levels > ct.level {
            return Err(CkksError::LevelExhausted {
                op: "drop",
                level: ct.level,
            });
        }
        let mut out = ct.clone();
        out.level -= levels;
        Ok(out)
    }

    fn rotate(&self, ct: &SimCiphertext, k: i64, keys: &SimEvaluationKeys) -> Result<SimCiphertext> {
        self.check_keys(ct, keys)?;
        let k_norm = self.params.normalize_rotation(k);
        if k_norm == 0 {
            return Ok(ct.clone());
        }
        if !keys.rotations.contains(&k_norm) {
            return Err(CkksError::MissingRotationKey(k));
        }
        let mut out = ct.clone();
        out.values.rotate_left(k_norm);
        Ok(out)
    }

    fn conjugate(&self, ct: &SimCiphertext, keys: &SimEvaluationKeys) -> Result<SimCiphertext> {
        self.check_keys(ct, keys).map_err(|e| match e {
            CkksError::KeyMismatch => CkksError::MissingConjugationKey,
            other => other,
        })?;
        let mut out = ct.clone();
        for v in out.values.iter_mut() {
            *v = v.conj();
        }
        Ok(out)
    }

    fn ciphertext_to_bytes(&self, ct: &SimCiphertext) -> Result<Vec<u8>> {
        Ok(bincode::serialize(ct)?)
    }

    fn ciphertext_from_bytes(&self, bytes: &[u8]) -> Result<SimCiphertext> {
        let ct: SimCiphertext = bincode::deserialize(bytes)?;
        if ct.values.len() != self.params.slots() || ct.level > self.params.max_level() {
            return Err(CkksError::Serialization(format!(
                "ciphertext shape ({} slots, level {}) does not match parameters",
                ct.values.len(),
                ct.level
            )));
        }
        Ok(ct)
    }
}

/// Standard normal sample via Box-Muller.
pub(crate) fn gaussian(rng: &mut dyn RngCore) -> f64 {
    let u1: f64 = rng.gen_range(1e-15_f64..1.0_f64);
    let u2: f64 = rng.gen_range(0.0_f64..std::f64::consts::TAU);
    (-2.0 * u1.ln()).sqrt() * u2.cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::DEFAULT_SCALE;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn setup() -> (SimulatedCkks, SimSecretKey, SimPublicKey, SimEvaluationKeys) {
        let params = CkksParameters::new(6, 4, 4, DEFAULT_SCALE).unwrap();
        let scheme = SimulatedCkks::new(params);
        let mut rng = test_rng();
        let sk = scheme.gen_secret_key(&mut rng);
        let pk = scheme.gen_public_key(&sk, &mut rng);
        let evk = scheme.gen_evaluation_keys(&sk, &[1, -2], &mut rng).unwrap();
        (scheme, sk, pk, evk)
    }

    fn encrypt(scheme: &SimulatedCkks, pk: &SimPublicKey, v: &[f64]) -> SimCiphertext {
        let vals: Vec<Complex64> = v.iter().map(|&x| Complex64::new(x, 0.0)).collect();
        let pt = scheme.encode(&vals, 3, DEFAULT_SCALE).unwrap();
        scheme.encrypt(&pt, pk, &mut test_rng()).unwrap()
    }

    #[test]
    fn rotation_requires_key() {
        let (scheme, _, pk, evk) = setup();
        let ct = encrypt(&scheme, &pk, &[1.0, 2.0, 3.0]);
        let r = scheme.rotate(&ct, 1, &evk).unwrap();
        assert_eq!(r.values[0].re, 2.0);
        let back = scheme.rotate(&ct, -2, &evk).unwrap();
        assert_eq!(back.values[2].re, 1.0);
        assert_eq!(scheme.rotate(&ct, 3, &evk), Err(CkksError::MissingRotationKey(3)));
    }

    #[test]
    fn rescale_at_level_zero_fails() {
        let (scheme, _, pk, _) = setup();
        let ct = encrypt(&scheme, &pk, &[1.0]);
        let low = scheme.drop_level(&ct, 3).unwrap();
        assert!(matches!(
            scheme.rescale(&low),
            Err(CkksError::LevelExhausted { .. })
        ));
    }

    #[test]
    fn degree_two_must_be_relinearized() {
        let (scheme, _, pk, evk) = setup();
        let ct = encrypt(&scheme, &pk, &[2.0]);
        let sq = scheme.mul(&ct, &ct).unwrap();
        assert_eq!(scheme.rotate(&sq, 1, &evk), Err(CkksError::DegreeTooHigh(2)));
        let lin = scheme.relinearize(&sq, &evk).unwrap();
        let r = scheme.rescale(&lin).unwrap();
        assert_eq!(r.level, 2);
        assert!((r.values[0].re - 4.0).abs() < 1e-9);
    }

    #[test]
    fn scale_mismatch_detected() {
        let (scheme, _, pk, _) = setup();
        let a = encrypt(&scheme, &pk, &[1.0]);
        let b = scheme.mul_const(&a, Complex64::new(1.0, 0.0), 2.0).unwrap();
        assert!(matches!(scheme.add(&a, &b), Err(CkksError::ScaleMismatch { .. })));
    }

    #[test]
    fn foreign_key_is_rejected() {
        let (scheme, _, pk, _) = setup();
        let mut rng = StdRng::seed_from_u64(7);
        let other_sk = scheme.gen_secret_key(&mut rng);
        let ct = encrypt(&scheme, &pk, &[1.0]);
        assert_eq!(scheme.decrypt(&ct, &other_sk), Err(CkksError::KeyMismatch));
    }

    #[test]
    fn aggregate_key_decrypts_under_aggregate_public_key() {
        let params = CkksParameters::new(6, 4, 2, DEFAULT_SCALE).unwrap();
        let scheme = SimulatedCkks::new(params);
        let mut rng = test_rng();
        let shares: Vec<_> = (0..3).map(|_| scheme.gen_secret_key(&mut rng)).collect();
        let sk = scheme.aggregate_secret_keys(&shares).unwrap();
        let pk = scheme.gen_public_key(&sk, &mut rng);
        let pt = scheme.encode(&[Complex64::new(0.5, 0.0)], 1, DEFAULT_SCALE).unwrap();
        let ct = scheme.encrypt(&pt, &pk, &mut rng).unwrap();
        assert!(scheme.decrypt(&ct, &sk).is_ok());
        assert!(scheme.decrypt(&ct, &shares[0]).is_err());
    }

    #[test]
    fn noise_stays_small() {
        let params = CkksParameters::new(12, 11, 2, DEFAULT_SCALE).unwrap();
        let scheme = SimulatedCkks::with_encryption_noise(params);
        let mut rng = test_rng();
        let sk = scheme.gen_secret_key(&mut rng);
        let pk = scheme.gen_public_key(&sk, &mut rng);
        let pt = scheme.encode(&[Complex64::new(1.0, 0.0); 16], 1, DEFAULT_SCALE).unwrap();
        let ct = scheme.encrypt(&pt, &pk, &mut rng).unwrap();
        let dec = scheme.decode(&scheme.decrypt(&ct, &sk).unwrap());
        for v in &dec[..16] {
            assert!((v.re - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn bytes_roundtrip() {
        let (scheme, _, pk, _) = setup();
        let ct = encrypt(&scheme, &pk, &[1.5, -2.5]);
        let bytes = scheme.ciphertext_to_bytes(&ct).unwrap();
        assert_eq!(scheme.ciphertext_from_bytes(&bytes).unwrap(), ct);
        assert!(scheme.ciphertext_from_bytes(&bytes[..10]).is_err());
    }
}
