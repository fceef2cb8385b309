//! Repacking before a refresh and the refresh itself.
//!
//! [`repack`] bundles `[U | P | W | ΔW_prev | ΔC_prev]` into one ciphertext.
//! A [`Refresher`] brings that ciphertext back to the maximum level with its
//! slots re-laid into the training layout, which also folds in the learning
//! rate on P and the momentum on both previous updates.

use cellcnn_ckks::{scales_match, CkksScheme, Complex64, Evaluator, Leveled};
use log::debug;
use rand::RngCore;

use crate::config::CnnConfig;
use crate::context::CryptoContext;
use crate::error::{CnnError, Result};
use crate::forward::EncryptedForward;
use crate::layout::Layout;

/// Restores a repacked ciphertext to the maximum level in the training
/// layout.
pub trait Refresher<S: CkksScheme> {
    fn refresh(
        &self,
        ctx: &CryptoContext<S>,
        ct: &S::Ciphertext,
        layout: &Layout,
        rng: &mut dyn RngCore,
    ) -> Result<S::Ciphertext>;
}

/// Decrypt with the collective key, re-lay the slots and re-encrypt under
/// the collective public key. Stands in for the interactive
/// decrypt-share/re-encrypt round of the federation.
pub struct CollectiveRefresh<S: CkksScheme> {
    secret: S::SecretKey,
    lr_factor: f64,
    momentum: f64,
}

impl<S: CkksScheme> CollectiveRefresh<S> {
    pub fn new(secret: S::SecretKey, config: &CnnConfig) -> Self {
        Self {
            secret,
            lr_factor: config.learning_rate / config.n_parties as f64,
            momentum: config.momentum,
        }
    }
}

impl<S: CkksScheme> Refresher<S> for CollectiveRefresh<S> {
    fn refresh(
        &self,
        ctx: &CryptoContext<S>,
        ct: &S::Ciphertext,
        layout: &Layout,
        rng: &mut dyn RngCore,
    ) -> Result<S::Ciphertext> {
        let repacked = ctx.decrypt_real(ct, &self.secret)?;
        let slots = training_layout(&repacked, layout, self.lr_factor, self.momentum)?;
        let values: Vec<Complex64> = slots.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        let out = ctx.encrypt(&values, ctx.max_level(), rng)?;
        debug!("refreshed level {} -> {}", ct.level(), out.level());
        Ok(out)
    }
}

/// Map repacked slot values (real parts) to the training layout.
pub fn training_layout(v: &[f64], layout: &Layout, lr_factor: f64, momentum: f64) -> Result<Vec<f64>> {
    if v.len() < layout.repack_slots() {
        return Err(CnnError::ShapeMismatch {
            op: "training_layout",
            left: (v.len(), 1),
            right: (layout.repack_slots(), 1),
        });
    }
    let l = layout;
    let (bd, bf, d, k, f) = (l.bd(), l.bf(), l.d, l.k, l.filters);
    let mut out = vec![0.0; l.training_slots()];

    for b in 0..l.batch {
        for c in 0..l.classes {
            let u = v[l.u_slot(b, c)];
            let start = l.train_u() + b * d + c * f;
            out[start..start + f].fill(u);
        }
    }
    for c in 0..l.classes {
        for j in 0..k {
            out[l.train_u_classes() + c * k + j] = v[c * bf + ((j / f) * f) % bf];
        }
    }
    for b in 0..l.batch {
        for c in 0..l.classes {
            for j in 0..f {
                out[l.train_p() + b * d + c * f + j] = v[l.repack_p() + b * f + j] * lr_factor;
            }
        }
    }
    for c in 0..l.classes {
        for j in 0..k {
            out[l.train_w() + c * k + j] = v[l.repack_w() + c * bf + j % f];
        }
    }
    for i in 0..bd {
        out[l.train_dw_prev() + i] = v[l.repack_dw_prev() + i] * momentum;
    }
    for i in 0..k {
        out[l.train_dc_prev() + i] = v[l.repack_dc_prev() + i] * momentum;
    }
    Ok(out)
}

/// `U + rot(P, −BD) + rot(W, −2BD) + rot(ΔW_prev, −3BD) + rot(ΔC_prev, −4BD)`.
/// Absent previous updates count as zero. Terms whose scale drifted from U's
/// are aligned first.
pub fn repack<S: CkksScheme>(
    eval: &Evaluator<'_, S>,
    layout: &Layout,
    fwd: &EncryptedForward<S::Ciphertext>,
    ct_w: &S::Ciphertext,
    dw_prev: Option<&S::Ciphertext>,
    dc_prev: Option<&S::Ciphertext>,
) -> Result<S::Ciphertext> {
    let target = fwd.u.scale();
    let blocks = [
        (Some(&fwd.p), layout.repack_p()),
        (Some(ct_w), layout.repack_w()),
        (dw_prev, layout.repack_dw_prev()),
        (dc_prev, layout.repack_dc_prev()),
    ];
    let mut acc = fwd.u.clone();
    for (ct, offset) in blocks {
        let Some(ct) = ct else { continue };
        let mut term = eval.rotate(ct, -(offset as i64))?;
        if !scales_match(term.scale(), target) {
            term = eval.align_scale(&term, target)?;
        }
        acc = eval.add(&acc, &term)?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_layout_regions() {
        let l = Layout::from_dims(2, 4, 2, 2);
        let mut v = vec![0.0; l.used_slots()];
        // U[b, c] = 10·b + c
        for b in 0..2 {
            for c in 0..2 {
                v[l.u_slot(b, c)] = (10 * b + c) as f64;
            }
        }
        // P[b, f] = b + 0.1·f
        for b in 0..2 {
            for f in 0..2 {
                v[l.repack_p() + b * 2 + f] = b as f64 + 0.1 * f as f64;
            }
        }
        // W[f, c] = f + 0.5·c, tiled over the batch
        for c in 0..2 {
            for b in 0..2 {
                for f in 0..2 {
                    v[l.repack_w() + c * l.bf() + b * 2 + f] = f as f64 + 0.5 * c as f64;
                }
            }
        }
        v[l.repack_dw_prev() + 3] = 4.0;
        v[l.repack_dc_prev() + 9] = 2.0;

        let out = training_layout(&v, &l, 0.5, 0.9).unwrap();
        assert_eq!(out.len(), 74);
        // sample 1, class 1, both filters
        assert_eq!(&out[6..8], &[11.0, 11.0]);
        // class-major U: class 1, slot 4 belongs to sample 0
        assert_eq!(out[l.train_u_classes() + 10 + 4], 1.0);
        assert_eq!(out[l.train_u_classes() + 10 + 2], 11.0);
        // P scaled by the learning-rate factor, repeated per class
        assert_eq!(out[l.train_p() + 4 + 2 + 1], (1.0 + 0.1) * 0.5);
        // W class 1 over the conv footprint, filter = j mod filters
        assert_eq!(out[l.train_w() + 10 + 7], 1.5);
        assert!((out[l.train_dw_prev() + 3] - 3.6).abs() < 1e-12);
        assert!((out[l.train_dc_prev() + 9] - 1.8).abs() < 1e-12);

        assert!(training_layout(&v[..40], &l, 0.5, 0.9).is_err());
    }
}
