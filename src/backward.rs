//! Gradients of the convolution and dense weights.
//!
//! The encrypted pass starts from the refreshed ciphertext in the training
//! layout (see [`crate::layout`]). One product of the rotated ciphertext with
//! the output error yields both `P·E₁` per sample (for ΔW) and the
//! class-major `W·E₁` terms (for the error passed back to the convolution).

use cellcnn_ckks::{CkksScheme, Evaluator, Leveled};

use crate::activation::{Activation, ActivationPair};
use crate::context::{CryptoContext, LevelPlan};
use crate::encoding::{encode_left, label_slots, range_mask};
use crate::error::{CnnError, Result};
use crate::forward::{mul_left_plain, PlainForward};
use crate::layout::Layout;
use crate::matrix::Matrix;

/// Update of both weight matrices, already scaled by the learning rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PlainGradient {
    pub dc: Matrix,
    pub dw: Matrix,
}

impl PlainGradient {
    pub fn zeros(layout: &Layout) -> Self {
        Self {
            dc: Matrix::zeros(layout.features, layout.filters),
            dw: Matrix::zeros(layout.filters, layout.classes),
        }
    }

    pub fn add(&self, other: &PlainGradient) -> Result<PlainGradient> {
        Ok(Self {
            dc: self.dc.add(&other.dc)?,
            dw: self.dw.add(&other.dw)?,
        })
    }

    /// `self + momentum · prev`.
    pub fn with_momentum(&self, prev: &PlainGradient, momentum: f64) -> Result<PlainGradient> {
        Ok(Self {
            dc: self.dc.add(&prev.dc.scale(momentum))?,
            dw: self.dw.add(&prev.dw.scale(momentum))?,
        })
    }
}

/// Encrypted update: `dc` in the convolution-weight layout, `dw` in the
/// dense-weight layout, so both subtract directly from the weights.
#[derive(Clone)]
pub struct EncryptedGradient<C> {
    pub dc: C,
    pub dw: C,
}

impl<C: Leveled> EncryptedGradient<C> {
    pub fn add<S>(&self, eval: &Evaluator<'_, S>, other: &Self) -> Result<Self>
    where
        S: CkksScheme<Ciphertext = C>,
    {
        Ok(Self {
            dc: eval.add(&self.dc, &other.dc)?,
            dw: eval.add(&self.dw, &other.dw)?,
        })
    }
}

/// `½ Σ (σ(U) − Y)²`.
pub fn squared_error(u: &Matrix, y: &Matrix, activation: Activation) -> Result<f64> {
    let diff = u.map_real(|v| activation.eval(v)).sub(y)?;
    Ok(0.5 * diff.values.iter().map(|v| v.norm_sqr()).sum::<f64>())
}

/// Cleartext backward pass. `lr_factor` is `learning_rate / n_parties`.
pub fn backward_plain(
    x: &Matrix,
    y: &Matrix,
    fwd: &PlainForward,
    w: &Matrix,
    activation: Activation,
    lr_factor: f64,
) -> Result<PlainGradient> {
    let sigma = fwd.u.map_real(|v| activation.eval(v));
    let sigma_prime = fwd.u.map_real(|v| activation.derivative(v));
    let e1 = sigma.sub(y)?.hadamard(&sigma_prime)?;
    let e0 = e1.matmul(&w.transpose())?;
    let dw = fwd.p.transpose().matmul(&e1)?.scale(lr_factor);
    let dc = x.transpose().matmul(&e0)?.scale(lr_factor);
    Ok(PlainGradient { dc, dw })
}

/// Mask plaintexts, encoded once per model.
pub struct Masks<P> {
    /// `[c·filters, (c+1)·filters)` for each class, at the gradient level.
    pub classes: Vec<P>,
    /// `[0, batch·D)` at the maximum level.
    pub dw_prev: P,
    /// `[0, K)` at the maximum level.
    pub dc_prev: P,
}

impl<P> Masks<P> {
    pub fn build<S>(ctx: &CryptoContext<S>, layout: &Layout, plan: &LevelPlan) -> Result<Self>
    where
        S: CkksScheme<Plaintext = P>,
    {
        let f = layout.filters;
        let classes = (0..layout.classes)
            .map(|c| ctx.encode_for_product(&range_mask(c * f, (c + 1) * f), plan.gradient()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            classes,
            dw_prev: ctx.encode_for_product(&range_mask(0, layout.bd()), plan.max)?,
            dc_prev: ctx.encode_for_product(&range_mask(0, layout.k), plan.max)?,
        })
    }
}

/// Everything the encrypted backward pass reads besides the ciphertext.
pub struct BackwardInputs<'a, P> {
    pub layout: &'a Layout,
    pub masks: &'a Masks<P>,
    pub activation: Activation,
    /// Pooled batch, `batch × features`.
    pub x: &'a Matrix,
    /// One-hot labels, `batch × classes`.
    pub y: &'a Matrix,
    /// `learning_rate / n_parties`.
    pub lr_factor: f64,
    /// Add the momentum-scaled previous updates carried in the refreshed
    /// ciphertext.
    pub with_momentum: bool,
}

/// Encrypted backward pass on a refreshed ciphertext at the maximum level.
pub fn backward_encrypted<S: CkksScheme>(
    ctx: &CryptoContext<S>,
    boot: &S::Ciphertext,
    input: &BackwardInputs<'_, S::Plaintext>,
) -> Result<EncryptedGradient<S::Ciphertext>> {
    let eval = ctx.evaluator();
    let l = input.layout;

    // E₁ = (σ(U) − Y) ⊙ σ′(U) over both U regions
    let pair = ActivationPair::evaluate(&eval, boot, input.activation, ctx.default_scale())?;
    let y = ctx.encode(&label_slots(input.y, l)?, pair.value.level(), pair.value.scale())?;
    let diff = eval.sub_plain(&pair.value, &y)?;
    let e1 = eval.rescale(&eval.mul_relin(&diff, &pair.derivative)?)?;

    // P·E₁ on [0, BD), W·E₁ class-major on [BD, BD + classes·K)
    let aligned = eval.rotate(boot, (l.bd() + l.ck()) as i64)?;
    let prod = eval.rescale(&eval.mul_relin(&aligned, &e1)?)?;

    let dw = eval.inner_sum(&prod, l.d as i64, l.batch)?;
    let e0 = eval.inner_sum(&eval.rotate(&prod, l.bd() as i64)?, l.k as i64, l.classes)?;

    // ΔC = Xᵀ·E₀; the conjugate-add doubles the real part
    let xt = encode_left(&input.x.transpose(), l.filters, input.lr_factor * 0.5)?
        .iter()
        .map(|v| ctx.encode_for_product(v, e0.level()))
        .collect::<Result<Vec<_>>>()?;
    let dc = mul_left_plain(&eval, &xt, &e0, l.batch, l.filters)?;
    let dc = eval.add(&dc, &eval.conjugate(&dc)?)?;
    let mut dc = eval.replicate(&dc, l.conv_weights() as i64, l.conv_tiles())?;

    // ΔW: move each class slice to its tile, then fill the batch
    let mut tiles: Option<S::Ciphertext> = None;
    for (c, mask) in input.masks.classes.iter().enumerate() {
        let slice = eval.rescale(&eval.mul_plain(&dw, mask)?)?;
        let slice = eval.rotate(&slice, -((c * (l.batch - 1) * l.filters) as i64))?;
        tiles = Some(match tiles {
            Some(acc) => eval.add(&acc, &slice)?,
            None => slice,
        });
    }
    let tiles = tiles.ok_or(CnnError::MissingState("class masks"))?;
    let mut dw = eval.replicate(&tiles, l.filters as i64, l.batch)?;

    if input.with_momentum {
        let prev_dw = eval.rotate(boot, l.train_dw_prev() as i64)?;
        let prev_dw = eval.rescale(&eval.mul_plain(&prev_dw, &input.masks.dw_prev)?)?;
        let prev_dc = eval.rotate(boot, l.train_dc_prev() as i64)?;
        let prev_dc = eval.rescale(&eval.mul_plain(&prev_dc, &input.masks.dc_prev)?)?;
        dw = eval.add(&dw, &prev_dw)?;
        dc = eval.add(&dc, &prev_dc)?;
    }

    Ok(EncryptedGradient { dc, dw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::forward_plain;

    #[test]
    fn plain_gradient_matches_finite_difference() {
        let x = Matrix::from_rows(&[vec![0.2, -0.1, 0.4, 0.3], vec![0.5, 0.1, -0.2, 0.0]]).unwrap();
        let y = Matrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let c = Matrix::from_rows(&[vec![0.3, -0.2], vec![0.1, 0.4], vec![-0.5, 0.2], vec![0.6, 0.1]]).unwrap();
        let w = Matrix::from_rows(&[vec![0.7, -0.3], vec![-0.4, 0.9]]).unwrap();
        let act = Activation::Narrow;

        let fwd = forward_plain(&x, &c, &w).unwrap();
        let g = backward_plain(&x, &y, &fwd, &w, act, 1.0).unwrap();

        let loss = |c: &Matrix, w: &Matrix| {
            let f = forward_plain(&x, c, w).unwrap();
            squared_error(&f.u, &y, act).unwrap()
        };
        let h = 1e-6;
        for i in 0..4 {
            for j in 0..2 {
                let mut cp = c.clone();
                cp.set(i, j, cp.get(i, j) + h);
                let mut cm = c.clone();
                cm.set(i, j, cm.get(i, j) - h);
                let fd = (loss(&cp, &w) - loss(&cm, &w)) / (2.0 * h);
                assert!((fd - g.dc.re(i, j)).abs() < 1e-6, "dc[{},{}]", i, j);
            }
        }
        for i in 0..2 {
            for j in 0..2 {
                let mut wp = w.clone();
                wp.set(i, j, wp.get(i, j) + h);
                let mut wm = w.clone();
                wm.set(i, j, wm.get(i, j) - h);
                let fd = (loss(&c, &wp) - loss(&c, &wm)) / (2.0 * h);
                assert!((fd - g.dw.re(i, j)).abs() < 1e-6, "dw[{},{}]", i, j);
            }
        }
    }

    #[test]
    fn momentum_adds_scaled_previous() {
        let layout = Layout::from_dims(2, 4, 2, 2);
        let mut prev = PlainGradient::zeros(&layout);
        prev.dw = Matrix::from_real(2, 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let g = PlainGradient::zeros(&layout).with_momentum(&prev, 0.5).unwrap();
        assert_eq!(g.dw.real_values(), vec![0.5, 1.0, 1.5, 2.0]);
        assert_eq!(g.dc, Matrix::zeros(4, 2));
    }
}
