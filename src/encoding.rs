//! Slot vectors for operands, labels and masks, plus the inverse maps that
//! read weights and scores back out of decrypted slots.

use num_complex::Complex64;

use crate::error::{CnnError, Result};
use crate::layout::Layout;
use crate::matrix::Matrix;

const ZERO: Complex64 = Complex64 { re: 0.0, im: 0.0 };

/// Diagonal packing of a left operand `L` (`R × C`, `C` even) for the
/// plaintext × ciphertext product. Returns `C/2` slot vectors; vector `i`
/// holds, in the `block`-wide group of row `j`,
/// `(L[j, (2i+j) mod C] − i·L[j, (2i+j+1) mod C]) · scaling`.
pub fn encode_left(l: &Matrix, block: usize, scaling: f64) -> Result<Vec<Vec<Complex64>>> {
    if l.cols % 2 != 0 {
        return Err(CnnError::ShapeMismatch {
            op: "encode_left",
            left: l.shape(),
            right: (l.cols, 2),
        });
    }
    let c = l.cols;
    let out = (0..c / 2)
        .map(|i| {
            let mut slots = vec![ZERO; l.rows * block];
            for j in 0..l.rows {
                let v = Complex64::new(l.re(j, (2 * i + j) % c), -l.re(j, (2 * i + j + 1) % c)) * scaling;
                slots[j * block..(j + 1) * block].fill(v);
            }
            slots
        })
        .collect();
    Ok(out)
}

/// Convolution weights (`features × filters`) repeated cyclically over `K`.
pub fn conv_weight_slots(c: &Matrix, layout: &Layout) -> Result<Vec<Complex64>> {
    check_shape(c, (layout.features, layout.filters), "conv_weight_slots")?;
    let n = layout.conv_weights();
    Ok((0..layout.k).map(|i| Complex64::new(c.values[i % n].re, 0.0)).collect())
}

/// Dense weights transposed, row-encoded and tiled over the batch:
/// slot `c·batch·filters + b·filters + f` holds `W[f, c]`.
pub fn dense_weight_slots(w: &Matrix, layout: &Layout) -> Result<Vec<Complex64>> {
    check_shape(w, (layout.filters, layout.classes), "dense_weight_slots")?;
    let mut slots = vec![ZERO; layout.bd()];
    for c in 0..layout.classes {
        for b in 0..layout.batch {
            for f in 0..layout.filters {
                slots[c * layout.bf() + b * layout.filters + f] = Complex64::new(w.re(f, c), 0.0);
            }
        }
    }
    Ok(slots)
}

/// Labels aligned with both U regions of the training layout.
pub fn label_slots(y: &Matrix, layout: &Layout) -> Result<Vec<Complex64>> {
    check_shape(y, (layout.batch, layout.classes), "label_slots")?;
    let mut slots = vec![ZERO; layout.bd() + layout.ck()];
    for b in 0..layout.batch {
        for c in 0..layout.classes {
            let start = b * layout.d + c * layout.filters;
            slots[start..start + layout.filters].fill(Complex64::new(y.re(b, c), 0.0));
        }
    }
    for c in 0..layout.classes {
        for j in 0..layout.k {
            let b = (j / layout.filters) % layout.batch;
            slots[layout.train_u_classes() + c * layout.k + j] = Complex64::new(y.re(b, c), 0.0);
        }
    }
    Ok(slots)
}

/// Ones on `[start, end)`.
pub fn range_mask(start: usize, end: usize) -> Vec<Complex64> {
    let mut slots = vec![ZERO; end];
    slots[start..end].fill(Complex64::new(1.0, 0.0));
    slots
}

/// Read `features × filters` convolution weights from decrypted slots.
pub fn conv_weights_from_slots(values: &[f64], layout: &Layout) -> Result<Matrix> {
    let n = layout.conv_weights();
    let v = values.get(..n).ok_or(CnnError::ShapeMismatch {
        op: "conv_weights_from_slots",
        left: (values.len(), 1),
        right: (n, 1),
    })?;
    Matrix::from_real(layout.features, layout.filters, v)
}

/// Read `filters × classes` dense weights from decrypted slots.
pub fn dense_weights_from_slots(values: &[f64], layout: &Layout) -> Result<Matrix> {
    check_len(values, layout.bd(), "dense_weights_from_slots")?;
    let mut w = Matrix::zeros(layout.filters, layout.classes);
    for f in 0..layout.filters {
        for c in 0..layout.classes {
            w.set(f, c, Complex64::new(values[c * layout.bf() + f], 0.0));
        }
    }
    Ok(w)
}

/// `batch × classes` scores from the dense-layer output slots.
pub fn scores_from_slots(values: &[f64], layout: &Layout) -> Result<Matrix> {
    check_len(values, layout.bd(), "scores_from_slots")?;
    let mut m = Matrix::zeros(layout.batch, layout.classes);
    for b in 0..layout.batch {
        for c in 0..layout.classes {
            m.set(b, c, Complex64::new(values[layout.u_slot(b, c)], 0.0));
        }
    }
    Ok(m)
}

fn check_shape(m: &Matrix, expected: (usize, usize), op: &'static str) -> Result<()> {
    if m.shape() != expected {
        return Err(CnnError::ShapeMismatch {
            op,
            left: m.shape(),
            right: expected,
        });
    }
    Ok(())
}

fn check_len(values: &[f64], needed: usize, op: &'static str) -> Result<()> {
    if values.len() < needed {
        return Err(CnnError::ShapeMismatch {
            op,
            left: (values.len(), 1),
            right: (needed, 1),
        });
    }
    Ok(())
}
