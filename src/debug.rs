//! Decrypt-and-inspect helpers for precision tracking.

use cellcnn_ckks::CkksScheme;
use log::debug;

use crate::backward::{EncryptedGradient, PlainGradient};
use crate::context::CryptoContext;
use crate::encoding::{conv_weights_from_slots, dense_weights_from_slots};
use crate::error::{CnnError, Result};
use crate::layout::Layout;
use crate::matrix::Matrix;
use crate::model::CellCnn;

/// Decrypt the first `rows · cols` slots of `ct` as a row-major matrix and
/// log it.
pub fn decrypt_print<S: CkksScheme>(
    ctx: &CryptoContext<S>,
    ct: &S::Ciphertext,
    sk: &S::SecretKey,
    label: &str,
    rows: usize,
    cols: usize,
) -> Result<Matrix> {
    let values = ctx.decrypt(ct, sk)?;
    let n = rows * cols;
    let head = values.get(..n).ok_or(CnnError::ShapeMismatch {
        op: "decrypt_print",
        left: (values.len(), 1),
        right: (n, 1),
    })?;
    let m = Matrix::from_complex(rows, cols, head.to_vec())?;
    for i in 0..rows {
        let row: Vec<String> = m.row(i).iter().map(|v| format!("{:+.6}", v.re)).collect();
        debug!("{}[{}] {}", label, i, row.join(" "));
    }
    Ok(m)
}

/// Absolute error between a cleartext reference and decrypted values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl PrecisionStats {
    pub fn compare(reference: &[f64], got: &[f64]) -> Result<Self> {
        if reference.len() != got.len() || reference.is_empty() {
            return Err(CnnError::ShapeMismatch {
                op: "precision",
                left: (reference.len(), 1),
                right: (got.len(), 1),
            });
        }
        let errs: Vec<f64> = reference.iter().zip(got).map(|(a, b)| (a - b).abs()).collect();
        Ok(Self {
            min: errs.iter().copied().fold(f64::INFINITY, f64::min),
            max: errs.iter().copied().fold(0.0, f64::max),
            mean: errs.iter().sum::<f64>() / errs.len() as f64,
        })
    }

    /// `log2(1 / mean)`, capped for exact matches.
    pub fn bits(&self) -> f64 {
        if self.mean == 0.0 {
            return 64.0;
        }
        -self.mean.log2()
    }
}

impl std::fmt::Display for PrecisionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "min {:.3e} max {:.3e} mean {:.3e} ({:.1} bits)",
            self.min,
            self.max,
            self.mean,
            self.bits()
        )
    }
}

/// Decrypt an encrypted update into matrix form.
pub fn decrypt_gradient<S: CkksScheme>(
    ctx: &CryptoContext<S>,
    g: &EncryptedGradient<S::Ciphertext>,
    sk: &S::SecretKey,
    layout: &Layout,
) -> Result<PlainGradient> {
    Ok(PlainGradient {
        dc: conv_weights_from_slots(&ctx.decrypt_real(&g.dc, sk)?, layout)?,
        dw: dense_weights_from_slots(&ctx.decrypt_real(&g.dw, sk)?, layout)?,
    })
}

impl<S: CkksScheme> CellCnn<S> {
    /// Decrypted encrypted weights `(C, W)`.
    pub fn decrypt_weights(&self, sk: &S::SecretKey) -> Result<(Matrix, Matrix)> {
        let e = self.encrypted_state().ok_or(CnnError::MissingState("encrypted weights"))?;
        let ctx = self.context();
        Ok((
            conv_weights_from_slots(&ctx.decrypt_real(&e.c, sk)?, self.layout())?,
            dense_weights_from_slots(&ctx.decrypt_real(&e.w, sk)?, self.layout())?,
        ))
    }

    /// Encrypted convolution weights against the cleartext ones.
    pub fn ctc_precision(&self, sk: &S::SecretKey) -> Result<PrecisionStats> {
        let plain = self.plain_state().ok_or(CnnError::MissingState("cleartext weights"))?;
        let (c, _) = self.decrypt_weights(sk)?;
        let stats = PrecisionStats::compare(&plain.c.real_values(), &c.real_values())?;
        debug!("ctC precision: {}", stats);
        Ok(stats)
    }

    /// Encrypted dense weights against the cleartext ones.
    pub fn ctw_precision(&self, sk: &S::SecretKey) -> Result<PrecisionStats> {
        let plain = self.plain_state().ok_or(CnnError::MissingState("cleartext weights"))?;
        let (_, w) = self.decrypt_weights(sk)?;
        let stats = PrecisionStats::compare(&plain.w.real_values(), &w.real_values())?;
        debug!("ctW precision: {}", stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_over_errors() {
        let s = PrecisionStats::compare(&[1.0, 2.0, 3.0], &[1.0, 2.5, 2.75]).unwrap();
        assert_eq!(s.min, 0.0);
        assert_eq!(s.max, 0.5);
        assert!((s.mean - 0.25).abs() < 1e-12);
        assert!((s.bits() - 2.0).abs() < 1e-12);
        assert!(PrecisionStats::compare(&[1.0], &[]).is_err());
    }
}
