//! Class scores without the backward pass.

use std::sync::Arc;

use cellcnn_ckks::{CkksScheme, Leveled};

use crate::dataset::argmax;
use crate::encoding::{encode_left, scores_from_slots};
use crate::error::{CnnError, Result};
use crate::forward::{conv_encrypted, dense_encrypted, forward_plain, mul_left_encrypted};
use crate::matrix::Matrix;
use crate::model::CellCnn;

/// A pooled query batch, diagonal-packed and encrypted for the
/// ciphertext × ciphertext convolution.
#[derive(Clone)]
pub struct EncryptedQuery<C> {
    pub diagonals: Vec<C>,
}

impl<S: CkksScheme> CellCnn<S> {
    /// `σ(X·C·W)` on the cleartext weights.
    pub fn predict_plain(&self, x: &Matrix) -> Result<Matrix> {
        let state = self.plain_state().ok_or(CnnError::MissingState("cleartext weights"))?;
        let fwd = forward_plain(x, &state.c, &state.w)?;
        let act = self.config().activation;
        Ok(fwd.u.map_real(|v| act.eval(v)))
    }

    /// Encrypted class scores for a cleartext query batch.
    pub fn predict_ciphertext(&self, x: &Matrix) -> Result<S::Ciphertext> {
        let state = self.encrypted_state().ok_or(CnnError::MissingState("encrypted weights"))?;
        let layout = self.layout();
        let ctx = self.context();
        let eval = ctx.evaluator();
        let level = state.c.level();
        let diagonals = encode_left(x, layout.filters, 1.0)?
            .iter()
            .map(|v| ctx.encode_for_product(v, level))
            .collect::<Result<Vec<_>>>()?;
        let p = conv_encrypted(&eval, layout, &diagonals, &state.c)?;
        let fwd = dense_encrypted(&eval, layout, &p, &state.w)?;
        let coeffs = self.config().activation.halved_input_coefficients();
        self.activate_scores(&fwd.u, &coeffs)
    }

    /// Decrypted `batch × classes` scores.
    pub fn predict(&self, x: &Matrix, sk: &S::SecretKey) -> Result<Matrix> {
        let ct = self.predict_ciphertext(x)?;
        self.decrypt_scores(&ct, sk)
    }

    /// Diagonal-pack `x` (scaled by ½) and encrypt each diagonal at the
    /// weights level.
    pub fn encrypt_for_prediction(&mut self, x: &Matrix) -> Result<EncryptedQuery<S::Ciphertext>> {
        let layout = *self.layout();
        let level = self.plan().weights();
        let ctx = Arc::clone(self.context());
        let diagonals = encode_left(x, layout.filters, 0.5)?
            .iter()
            .map(|v| ctx.encrypt(v, level, self.rng()))
            .collect::<Result<Vec<_>>>()?;
        Ok(EncryptedQuery { diagonals })
    }

    /// Encrypted class scores for an encrypted query.
    pub fn predict_encrypted_query(&self, query: &EncryptedQuery<S::Ciphertext>) -> Result<S::Ciphertext> {
        let state = self.encrypted_state().ok_or(CnnError::MissingState("encrypted weights"))?;
        let layout = self.layout();
        let eval = self.context().evaluator();
        let p = mul_left_encrypted(&eval, &query.diagonals, &state.c, layout.features, layout.filters)?;
        let fwd = dense_encrypted(&eval, layout, &p, &state.w)?;
        let coeffs = self.config().activation.coefficients();
        self.activate_scores(&fwd.u, &coeffs)
    }

    pub fn decrypt_scores(&self, ct: &S::Ciphertext, sk: &S::SecretKey) -> Result<Matrix> {
        let values = self.context().decrypt_real(ct, sk)?;
        scores_from_slots(&values, self.layout())
    }

    /// Polynomial of `U + conj(U) = 2·Re(U)`. A cleartext query leaves the
    /// sum doubled and is read through `σ(y/2)`; an encrypted query was
    /// already halved when packed.
    fn activate_scores(&self, u: &S::Ciphertext, coeffs: &[f64]) -> Result<S::Ciphertext> {
        let ctx = self.context();
        let eval = ctx.evaluator();
        let y = eval.add(u, &eval.conjugate(u)?)?;
        Ok(eval.evaluate_polynomial(&y, coeffs, ctx.default_scale())?)
    }
}

/// Most likely class per row.
pub fn classify(scores: &Matrix) -> Vec<usize> {
    (0..scores.rows)
        .map(|i| argmax(scores.row(i).iter().map(|v| v.re)))
        .collect()
}

/// Fraction of rows whose predicted class differs from the one-hot label.
pub fn error_rate(scores: &Matrix, labels: &Matrix) -> Result<f64> {
    if scores.shape() != labels.shape() {
        return Err(CnnError::ShapeMismatch {
            op: "error_rate",
            left: scores.shape(),
            right: labels.shape(),
        });
    }
    if scores.rows == 0 {
        return Ok(0.0);
    }
    let wrong = classify(scores)
        .iter()
        .zip(classify(labels))
        .filter(|(p, l)| **p != *l)
        .count();
    Ok(wrong as f64 / scores.rows as f64)
}
