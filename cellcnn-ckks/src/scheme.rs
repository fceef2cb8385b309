//! The narrow CKKS interface the CellCNN engine is written against.
//!
//! A backend supplies key generation, encoding, encryption and the basic
//! leveled operations. Composite routines (inner sums, replication,
//! polynomial evaluation, scale alignment) live on [`crate::Evaluator`] and
//! only use what this trait exposes, so every backend gets them for free.

use std::collections::HashMap;

use num_complex::Complex64;
use rand::RngCore;

use crate::error::Result;
use crate::params::CkksParameters;

/// Level and scale bookkeeping shared by plaintexts and ciphertexts.
pub trait Leveled {
    fn level(&self) -> usize;
    fn scale(&self) -> f64;
}

pub trait CkksScheme: Send + Sync {
    type Plaintext: Clone + Leveled + Send + Sync;
    type Ciphertext: Clone + Leveled + Send + Sync;
    type SecretKey: Clone + Send + Sync;
    type PublicKey: Clone + Send + Sync;
    type EvaluationKeys: Send + Sync;

    fn params(&self) -> &CkksParameters;

    // ── Keys ────────────────────────────────────────────────────────────

    fn gen_secret_key(&self, rng: &mut dyn RngCore) -> Self::SecretKey;

    /// Combine additive secret-key shares into the shared key of a
    /// collective setup.
    fn aggregate_secret_keys(&self, shares: &[Self::SecretKey]) -> Result<Self::SecretKey>;

    fn gen_public_key(&self, sk: &Self::SecretKey, rng: &mut dyn RngCore) -> Self::PublicKey;

    /// Relinearization, conjugation and one rotation key per entry of
    /// `rotations` (left rotations, negative values rotate right).
    fn gen_evaluation_keys(
        &self,
        sk: &Self::SecretKey,
        rotations: &[i64],
        rng: &mut dyn RngCore,
    ) -> Result<Self::EvaluationKeys>;

    // ── Encoding and encryption ─────────────────────────────────────────

    fn encode(&self, values: &[Complex64], level: usize, scale: f64) -> Result<Self::Plaintext>;

    fn decode(&self, pt: &Self::Plaintext) -> Vec<Complex64>;

    fn encrypt(
        &self,
        pt: &Self::Plaintext,
        pk: &Self::PublicKey,
        rng: &mut dyn RngCore,
    ) -> Result<Self::Ciphertext>;

    fn decrypt(&self, ct: &Self::Ciphertext, sk: &Self::SecretKey) -> Result<Self::Plaintext>;

    // ── Arithmetic ──────────────────────────────────────────────────────

    fn add(&self, a: &Self::Ciphertext, b: &Self::Ciphertext) -> Result<Self::Ciphertext>;

    fn sub(&self, a: &Self::Ciphertext, b: &Self::Ciphertext) -> Result<Self::Ciphertext>;

    fn add_plain(&self, ct: &Self::Ciphertext, pt: &Self::Plaintext) -> Result<Self::Ciphertext>;

    fn sub_plain(&self, ct: &Self::Ciphertext, pt: &Self::Plaintext) -> Result<Self::Ciphertext>;

    /// Add a constant to every slot at the ciphertext's own scale.
    fn add_const(&self, ct: &Self::Ciphertext, c: Complex64) -> Result<Self::Ciphertext>;

    /// Tensor product; the result has degree 2 until relinearized.
    fn mul(&self, a: &Self::Ciphertext, b: &Self::Ciphertext) -> Result<Self::Ciphertext>;

    fn relinearize(
        &self,
        ct: &Self::Ciphertext,
        keys: &Self::EvaluationKeys,
    ) -> Result<Self::Ciphertext>;

    fn mul_plain(&self, ct: &Self::Ciphertext, pt: &Self::Plaintext) -> Result<Self::Ciphertext>;

    /// Multiply by `round(c · const_scale)`; the scale grows by `const_scale`.
    fn mul_const(
        &self,
        ct: &Self::Ciphertext,
        c: Complex64,
        const_scale: f64,
    ) -> Result<Self::Ciphertext>;

    /// Exact multiplication by the imaginary unit.
    fn mul_by_i(&self, ct: &Self::Ciphertext) -> Self::Ciphertext;

    fn rescale(&self, ct: &Self::Ciphertext) -> Result<Self::Ciphertext>;

    /// Lower the level by `levels` without touching the scale.
    fn drop_level(&self, ct: &Self::Ciphertext, levels: usize) -> Result<Self::Ciphertext>;

    fn rotate(
        &self,
        ct: &Self::Ciphertext,
        k: i64,
        keys: &Self::EvaluationKeys,
    ) -> Result<Self::Ciphertext>;

    /// Rotate one ciphertext by several amounts. Backends that can share the
    /// key-switching decomposition across rotations override this.
    fn rotate_hoisted(
        &self,
        ct: &Self::Ciphertext,
        ks: &[i64],
        keys: &Self::EvaluationKeys,
    ) -> Result<HashMap<i64, Self::Ciphertext>> {
        ks.iter()
            .map(|&k| Ok((k, self.rotate(ct, k, keys)?)))
            .collect()
    }

    fn conjugate(
        &self,
        ct: &Self::Ciphertext,
        keys: &Self::EvaluationKeys,
    ) -> Result<Self::Ciphertext>;

    // ── Serialization ───────────────────────────────────────────────────

    fn ciphertext_to_bytes(&self, ct: &Self::Ciphertext) -> Result<Vec<u8>>;

    fn ciphertext_from_bytes(&self, bytes: &[u8]) -> Result<Self::Ciphertext>;
}
