//! Convolution, mean pooling and dense layer, in the clear and encrypted.

use cellcnn_ckks::{CkksScheme, Evaluator};

use crate::error::{CnnError, Result};
use crate::layout::Layout;
use crate::matrix::Matrix;

/// Cleartext forward state kept for the backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PlainForward {
    /// Pooled convolution output, `batch × filters`.
    pub p: Matrix,
    /// Dense pre-activation, `batch × classes`.
    pub u: Matrix,
}

/// `P = X·C`, `U = P·W` on pre-pooled rows.
pub fn forward_plain(x: &Matrix, c: &Matrix, w: &Matrix) -> Result<PlainForward> {
    let p = x.matmul(c)?;
    let u = p.matmul(w)?;
    Ok(PlainForward { p, u })
}

/// Encrypted forward state: P replicated over classes and U in the
/// dense-output layout (`U[b, c]` at [`Layout::u_slot`]).
#[derive(Clone)]
pub struct EncryptedForward<C> {
    pub p: C,
    pub u: C,
}

/// Product of a diagonal-packed plaintext left operand with a right operand
/// held row-major (and cyclically repeated) in `right`, whose rows are
/// `right_cols` slots wide. `left` holds the `right_rows / 2` diagonals
/// from [`crate::encoding::encode_left`]. The real part of the result is the
/// product; the imaginary part is discarded by the caller.
pub fn mul_left_plain<S: CkksScheme>(
    eval: &Evaluator<'_, S>,
    left: &[S::Plaintext],
    right: &S::Ciphertext,
    right_rows: usize,
    right_cols: usize,
) -> Result<S::Ciphertext> {
    diagonal_mul_sum(eval, left.len(), right, right_rows, right_cols, |ct, k| {
        Ok(eval.mul_plain(ct, &left[k])?)
    })
}

/// Same product with an encrypted left operand (one ciphertext per
/// diagonal). Each term is relinearized before summing.
pub fn mul_left_encrypted<S: CkksScheme>(
    eval: &Evaluator<'_, S>,
    left: &[S::Ciphertext],
    right: &S::Ciphertext,
    right_rows: usize,
    right_cols: usize,
) -> Result<S::Ciphertext> {
    diagonal_mul_sum(eval, left.len(), right, right_rows, right_cols, |ct, k| {
        Ok(eval.mul_relin(ct, &left[k])?)
    })
}

fn diagonal_mul_sum<S, F>(
    eval: &Evaluator<'_, S>,
    diagonals: usize,
    right: &S::Ciphertext,
    right_rows: usize,
    right_cols: usize,
    mul: F,
) -> Result<S::Ciphertext>
where
    S: CkksScheme,
    F: Fn(&S::Ciphertext, usize) -> Result<S::Ciphertext>,
{
    if diagonals == 0 || diagonals != right_rows / 2 {
        return Err(CnnError::ShapeMismatch {
            op: "mul_left",
            left: (diagonals, 2),
            right: (right_rows, right_cols),
        });
    }
    // pair row r with row r+1 in the imaginary part
    let shifted = eval.rotate(&eval.mul_by_i(right), right_cols as i64)?;
    let packed = eval.add(right, &shifted)?;

    let steps: Vec<i64> = (1..diagonals).map(|k| (2 * right_cols * k) as i64).collect();
    let rotated = eval.rotate_hoisted(&packed, &steps)?;

    let mut acc = mul(&packed, 0)?;
    for (k, step) in steps.iter().enumerate() {
        let term = rotated
            .get(step)
            .ok_or(CnnError::MissingState("hoisted rotation"))?;
        acc = eval.add(&acc, &mul(term, k + 1)?)?;
    }
    Ok(eval.rescale(&acc)?)
}

/// Encrypted convolution and pooling: `ctP = X·C`, valid on the first
/// `batch · filters` slots.
pub fn conv_encrypted<S: CkksScheme>(
    eval: &Evaluator<'_, S>,
    layout: &Layout,
    x_diagonals: &[S::Plaintext],
    ct_c: &S::Ciphertext,
) -> Result<S::Ciphertext> {
    mul_left_plain(eval, x_diagonals, ct_c, layout.features, layout.filters)
}

/// Replicate P over the classes, multiply by the tiled dense weights and sum
/// over the filters of each sample.
pub fn dense_encrypted<S: CkksScheme>(
    eval: &Evaluator<'_, S>,
    layout: &Layout,
    ct_p: &S::Ciphertext,
    ct_w: &S::Ciphertext,
) -> Result<EncryptedForward<S::Ciphertext>> {
    let p = eval.replicate(ct_p, layout.bf() as i64, layout.classes)?;
    let prod = eval.rescale(&eval.mul_relin(&p, ct_w)?)?;
    let u = eval.inner_sum(&prod, 1, layout.filters)?;
    Ok(EncryptedForward { p, u })
}

pub fn forward_encrypted<S: CkksScheme>(
    eval: &Evaluator<'_, S>,
    layout: &Layout,
    x_diagonals: &[S::Plaintext],
    ct_c: &S::Ciphertext,
    ct_w: &S::Ciphertext,
) -> Result<EncryptedForward<S::Ciphertext>> {
    let p = conv_encrypted(eval, layout, x_diagonals, ct_c)?;
    dense_encrypted(eval, layout, &p, ct_w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CryptoContext;
    use crate::encoding::{conv_weight_slots, dense_weight_slots, encode_left, scores_from_slots};
    use cellcnn_ckks::{CkksParameters, Complex64, Leveled, SimulatedCkks, DEFAULT_SCALE};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn setup(layout: &Layout) -> (CryptoContext<SimulatedCkks>, cellcnn_ckks::simulated::SimSecretKey) {
        let params = CkksParameters::new(8, 7, 5, DEFAULT_SCALE).unwrap();
        CryptoContext::generate(SimulatedCkks::new(params), layout, &mut test_rng()).unwrap()
    }

    #[test]
    fn plain_forward_shapes() {
        let x = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let c = Matrix::from_rows(&[vec![1.0, 0.0, 1.0], vec![0.0, 1.0, 1.0]]).unwrap();
        let w = Matrix::from_rows(&[vec![1.0], vec![1.0], vec![-1.0]]).unwrap();
        let fwd = forward_plain(&x, &c, &w).unwrap();
        assert_eq!(fwd.p.shape(), (2, 3));
        assert_eq!(fwd.u.real_values(), vec![0.0, 0.0]);
        assert!(forward_plain(&x, &w, &c).is_err());
    }

    #[test]
    fn encrypted_convolution_matches_product() {
        let layout = Layout::from_dims(2, 4, 2, 2);
        let (ctx, sk) = setup(&layout);
        let eval = ctx.evaluator();
        let x = Matrix::from_rows(&[vec![0.0, 0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6, 0.7]]).unwrap();
        let c = Matrix::from_rows(&[vec![0.5, -0.1], vec![0.2, 0.3], vec![-0.4, 0.6], vec![0.1, 0.05]]).unwrap();

        let ct_c = ctx.encrypt(&conv_weight_slots(&c, &layout).unwrap(), 3, &mut test_rng()).unwrap();
        let pts: Vec<_> = encode_left(&x, layout.filters, 1.0)
            .unwrap()
            .iter()
            .map(|v| ctx.encode_for_product(v, 3).unwrap())
            .collect();
        let ct_p = conv_encrypted(&eval, &layout, &pts, &ct_c).unwrap();
        assert_eq!(ct_p.level(), 2);

        let got = ctx.decrypt_real(&ct_p, &sk).unwrap();
        let want = x.matmul(&c).unwrap().real_values();
        for (i, w) in want.iter().enumerate() {
            assert!((got[i] - w).abs() < 1e-8, "slot {}: {} vs {}", i, got[i], w);
        }
    }

    #[test]
    fn encrypted_dense_matches_product() {
        let layout = Layout::from_dims(2, 4, 2, 2);
        let (ctx, sk) = setup(&layout);
        let eval = ctx.evaluator();
        let p = Matrix::from_rows(&[vec![0.3, -0.2], vec![0.1, 0.4]]).unwrap();
        let w = Matrix::from_rows(&[vec![1.0, -0.5], vec![0.25, 2.0]]).unwrap();

        let p_slots: Vec<Complex64> = p.values.clone();
        let ct_p = ctx.encrypt(&p_slots, 3, &mut test_rng()).unwrap();
        let ct_w = ctx.encrypt(&dense_weight_slots(&w, &layout).unwrap(), 3, &mut test_rng()).unwrap();
        let fwd = dense_encrypted(&eval, &layout, &ct_p, &ct_w).unwrap();

        let got = scores_from_slots(&ctx.decrypt_real(&fwd.u, &sk).unwrap(), &layout).unwrap();
        let want = p.matmul(&w).unwrap();
        assert!(got.max_abs_diff(&want).unwrap() < 1e-8);
    }

    #[test]
    fn diagonal_count_must_match_rows() {
        let layout = Layout::from_dims(2, 4, 2, 2);
        let (ctx, _) = setup(&layout);
        let eval = ctx.evaluator();
        let ct = ctx.encrypt(&[Complex64::new(1.0, 0.0)], 3, &mut test_rng()).unwrap();
        let pt = ctx.encode_for_product(&[Complex64::new(1.0, 0.0)], 3).unwrap();
        assert!(matches!(
            mul_left_plain(&eval, &[pt], &ct, 4, 2),
            Err(CnnError::ShapeMismatch { .. })
        ));
    }
}
