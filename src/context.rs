//! Scheme, public key and evaluation keys bundled for one training run.

use cellcnn_ckks::{CkksParameters, CkksScheme, Complex64, Evaluator};
use log::info;
use rand::RngCore;

use crate::error::Result;
use crate::layout::Layout;

/// Read-only key material shared by every operation of a party. The secret
/// key is never stored here.
pub struct CryptoContext<S: CkksScheme> {
    scheme: S,
    public_key: S::PublicKey,
    eval_keys: S::EvaluationKeys,
}

impl<S: CkksScheme> CryptoContext<S> {
    pub fn new(scheme: S, public_key: S::PublicKey, eval_keys: S::EvaluationKeys) -> Self {
        Self {
            scheme,
            public_key,
            eval_keys,
        }
    }

    /// Single-key setup: a fresh secret key, its public key and every
    /// rotation the layout's circuits use.
    pub fn generate(scheme: S, layout: &Layout, rng: &mut dyn RngCore) -> Result<(Self, S::SecretKey)> {
        let sk = scheme.gen_secret_key(rng);
        let ctx = Self::from_secret(scheme, &sk, layout, rng)?;
        Ok((ctx, sk))
    }

    /// Public and evaluation keys for an existing (possibly aggregated)
    /// secret key.
    pub fn from_secret(
        scheme: S,
        sk: &S::SecretKey,
        layout: &Layout,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let rotations = layout.rotation_indices();
        let public_key = scheme.gen_public_key(sk, rng);
        let eval_keys = scheme.gen_evaluation_keys(sk, &rotations, rng)?;
        info!(
            "generated keys: {} rotations, {} levels, {} slots",
            rotations.len(),
            scheme.params().max_level() + 1,
            scheme.params().slots()
        );
        Ok(Self::new(scheme, public_key, eval_keys))
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    pub fn public_key(&self) -> &S::PublicKey {
        &self.public_key
    }

    pub fn params(&self) -> &CkksParameters {
        self.scheme.params()
    }

    pub fn max_level(&self) -> usize {
        self.params().max_level()
    }

    pub fn default_scale(&self) -> f64 {
        self.params().default_scale
    }

    pub fn evaluator(&self) -> Evaluator<'_, S> {
        Evaluator::new(&self.scheme, &self.eval_keys)
    }

    pub fn encode(&self, values: &[Complex64], level: usize, scale: f64) -> Result<S::Plaintext> {
        Ok(self.scheme.encode(values, level, scale)?)
    }

    /// Plaintext whose scale equals the prime dropped at `level`, so a
    /// product with it followed by a rescale keeps the ciphertext's scale.
    pub fn encode_for_product(&self, values: &[Complex64], level: usize) -> Result<S::Plaintext> {
        self.params().check_level(level)?;
        self.encode(values, level, self.params().q(level))
    }

    /// Encrypt at `level` with the default scale.
    pub fn encrypt(&self, values: &[Complex64], level: usize, rng: &mut dyn RngCore) -> Result<S::Ciphertext> {
        let pt = self.encode(values, level, self.default_scale())?;
        Ok(self.scheme.encrypt(&pt, &self.public_key, rng)?)
    }

    pub fn decrypt(&self, ct: &S::Ciphertext, sk: &S::SecretKey) -> Result<Vec<Complex64>> {
        let pt = self.scheme.decrypt(ct, sk)?;
        Ok(self.scheme.decode(&pt))
    }

    /// Real parts of the decrypted slots.
    pub fn decrypt_real(&self, ct: &S::Ciphertext, sk: &S::SecretKey) -> Result<Vec<f64>> {
        Ok(self.decrypt(ct, sk)?.iter().map(|v| v.re).collect())
    }

    pub fn ciphertext_to_bytes(&self, ct: &S::Ciphertext) -> Result<Vec<u8>> {
        Ok(self.scheme.ciphertext_to_bytes(ct)?)
    }

    pub fn ciphertext_from_bytes(&self, bytes: &[u8]) -> Result<S::Ciphertext> {
        Ok(self.scheme.ciphertext_from_bytes(bytes)?)
    }
}

/// Level at which each stage of the training and prediction circuits
/// operates, counted down from the maximum level `L` a refresh restores.
///
/// Backward: σ and σ′ at `L−2`, the error at `L−3`, the raw gradient
/// products at `L−4` and both updates at `L−5`. The weights live at `L−5`
/// as well, so the forward pass produces P at `L−6` and U at `L−7`, and the
/// prediction scores land at `L−9`, never below level 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelPlan {
    pub max: usize,
}

/// Levels below the maximum the deepest path (prediction) consumes.
pub const PREDICTION_DEPTH: usize = 9;

/// Primes left under the prediction scores. At level 0 a single prime of the
/// size of the scale cannot hold a σ output near 0.5 without wrapping.
pub const PREDICTION_HEADROOM: usize = 1;

impl LevelPlan {
    pub fn new(max: usize) -> Result<Self> {
        if max < PREDICTION_DEPTH + PREDICTION_HEADROOM {
            return Err(cellcnn_ckks::CkksError::LevelExhausted {
                op: "plan",
                level: max,
            }
            .into());
        }
        Ok(Self { max })
    }

    pub fn error(&self) -> usize {
        self.max - 3
    }

    /// Level of the raw gradient products and of the class masks that
    /// slice them.
    pub fn gradient(&self) -> usize {
        self.max - 4
    }

    pub fn weights(&self) -> usize {
        self.max - 5
    }

    pub fn pooled(&self) -> usize {
        self.max - 6
    }

    pub fn dense(&self) -> usize {
        self.max - 7
    }

    pub fn prediction(&self) -> usize {
        self.max - PREDICTION_DEPTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellcnn_ckks::{Leveled, SimulatedCkks, DEFAULT_SCALE};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn plan_offsets() {
        let plan = LevelPlan::new(11).unwrap();
        assert_eq!(plan.weights(), 6);
        assert_eq!(plan.dense(), 4);
        assert_eq!(plan.prediction(), 2);
        assert_eq!(LevelPlan::new(10).unwrap().prediction(), 1);
        assert!(LevelPlan::new(9).is_err());
        assert!(LevelPlan::new(8).is_err());
    }

    #[test]
    fn product_plaintext_preserves_scale() {
        let params = CkksParameters::new(8, 7, 4, DEFAULT_SCALE).unwrap();
        let layout = Layout::from_dims(2, 4, 2, 2);
        let (ctx, sk) = CryptoContext::generate(SimulatedCkks::new(params), &layout, &mut test_rng()).unwrap();
        let ct = ctx.encrypt(&[Complex64::new(1.5, 0.0)], 3, &mut test_rng()).unwrap();
        let pt = ctx.encode_for_product(&[Complex64::new(2.0, 0.0)], 3).unwrap();
        let eval = ctx.evaluator();
        let out = eval.rescale(&eval.mul_plain(&ct, &pt).unwrap()).unwrap();
        assert_eq!(out.level(), 2);
        assert!((out.scale() / DEFAULT_SCALE - 1.0).abs() < 1e-12);
        assert!((ctx.decrypt_real(&out, &sk).unwrap()[0] - 3.0).abs() < 1e-9);
    }
}
