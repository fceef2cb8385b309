//! Composite homomorphic routines on top of a [`CkksScheme`].
//!
//! The evaluator borrows the scheme and its evaluation keys for the duration
//! of a computation. It forwards the basic operations and adds log-time inner
//! sums, replication, low-degree polynomial evaluation and scale alignment.

use std::collections::HashMap;

use num_complex::Complex64;

use crate::error::{CkksError, Result};
use crate::params::CkksParameters;
use crate::rotation::{fold_plan, FoldStep};
use crate::scheme::{CkksScheme, Leveled};

pub struct Evaluator<'a, S: CkksScheme> {
    scheme: &'a S,
    keys: &'a S::EvaluationKeys,
}

impl<'a, S: CkksScheme> Clone for Evaluator<'a, S> {
    fn clone(&self) -> Self {
        Self {
            scheme: self.scheme,
            keys: self.keys,
        }
    }
}

impl<'a, S: CkksScheme> Evaluator<'a, S> {
    pub fn new(scheme: &'a S, keys: &'a S::EvaluationKeys) -> Self {
        Self { scheme, keys }
    }

    pub fn scheme(&self) -> &'a S {
        self.scheme
    }

    pub fn params(&self) -> &'a CkksParameters {
        self.scheme.params()
    }

    // ── Forwarded primitives ────────────────────────────────────────────

    pub fn add(&self, a: &S::Ciphertext, b: &S::Ciphertext) -> Result<S::Ciphertext> {
        self.scheme.add(a, b)
    }

    pub fn sub(&self, a: &S::Ciphertext, b: &S::Ciphertext) -> Result<S::Ciphertext> {
        self.scheme.sub(a, b)
    }

    pub fn add_plain(&self, ct: &S::Ciphertext, pt: &S::Plaintext) -> Result<S::Ciphertext> {
        self.scheme.add_plain(ct, pt)
    }

    pub fn sub_plain(&self, ct: &S::Ciphertext, pt: &S::Plaintext) -> Result<S::Ciphertext> {
        self.scheme.sub_plain(ct, pt)
    }

    pub fn add_const(&self, ct: &S::Ciphertext, c: f64) -> Result<S::Ciphertext> {
        self.scheme.add_const(ct, Complex64::new(c, 0.0))
    }

    pub fn mul(&self, a: &S::Ciphertext, b: &S::Ciphertext) -> Result<S::Ciphertext> {
        self.scheme.mul(a, b)
    }

    pub fn relinearize(&self, ct: &S::Ciphertext) -> Result<S::Ciphertext> {
        self.scheme.relinearize(ct, self.keys)
    }

    pub fn mul_relin(&self, a: &S::Ciphertext, b: &S::Ciphertext) -> Result<S::Ciphertext> {
        let prod = self.scheme.mul(a, b)?;
        self.scheme.relinearize(&prod, self.keys)
    }

    pub fn mul_plain(&self, ct: &S::Ciphertext, pt: &S::Plaintext) -> Result<S::Ciphertext> {
        self.scheme.mul_plain(ct, pt)
    }

    pub fn mul_const(&self, ct: &S::Ciphertext, c: f64, const_scale: f64) -> Result<S::Ciphertext> {
        self.scheme.mul_const(ct, Complex64::new(c, 0.0), const_scale)
    }

    pub fn mul_by_i(&self, ct: &S::Ciphertext) -> S::Ciphertext {
        self.scheme.mul_by_i(ct)
    }

    pub fn rescale(&self, ct: &S::Ciphertext) -> Result<S::Ciphertext> {
        self.scheme.rescale(ct)
    }

    /// Lower `ct` to `level` (no-op when it already sits there).
    pub fn drop_to_level(&self, ct: &S::Ciphertext, level: usize) -> Result<S::Ciphertext> {
        match ct.level().checked_sub(level) {
            Some(0) => Ok(ct.clone()),
            Some(diff) => self.scheme.drop_level(ct, diff),
            None => Err(CkksError::LevelExhausted {
                op: "raise",
                level: ct.level(),
            }),
        }
    }

    pub fn rotate(&self, ct: &S::Ciphertext, k: i64) -> Result<S::Ciphertext> {
        if k == 0 {
            return Ok(ct.clone());
        }
        self.scheme.rotate(ct, k, self.keys)
    }

    pub fn rotate_hoisted(&self, ct: &S::Ciphertext, ks: &[i64]) -> Result<HashMap<i64, S::Ciphertext>> {
        self.scheme.rotate_hoisted(ct, ks, self.keys)
    }

    pub fn conjugate(&self, ct: &S::Ciphertext) -> Result<S::Ciphertext> {
        self.scheme.conjugate(ct, self.keys)
    }

    // ── Composite routines ──────────────────────────────────────────────

    /// `out[s] = Σ_{t<n} ct[s + t·batch]` in O(log n) rotations.
    pub fn inner_sum(&self, ct: &S::Ciphertext, batch: i64, n: usize) -> Result<S::Ciphertext> {
        let mut acc = ct.clone();
        let mut out: Option<S::Ciphertext> = None;
        for step in fold_plan(n) {
            match step {
                FoldStep::Accumulate { offset } => {
                    let term = self.rotate(&acc, offset as i64 * batch)?;
                    out = Some(match out {
                        Some(o) => self.add(&o, &term)?,
                        None => term,
                    });
                }
                FoldStep::Double { shift } => {
                    let rotated = self.rotate(&acc, shift as i64 * batch)?;
                    acc = self.add(&acc, &rotated)?;
                }
            }
        }
        Ok(out.unwrap_or(acc))
    }

    /// Tile the first `batch` slots `n` times: the dual of [`Self::inner_sum`].
    pub fn replicate(&self, ct: &S::Ciphertext, batch: i64, n: usize) -> Result<S::Ciphertext> {
        self.inner_sum(ct, -batch, n)
    }

    /// Bring `ct` to exactly `target` scale with one mul-by-constant and a
    /// rescale. Consumes one level.
    pub fn align_scale(&self, ct: &S::Ciphertext, target: f64) -> Result<S::Ciphertext> {
        let level = ct.level();
        if level == 0 {
            return Err(CkksError::LevelExhausted { op: "align", level });
        }
        let const_scale = target * self.params().q(level) / ct.scale();
        let scaled = self.mul_const(ct, 1.0, const_scale)?;
        self.rescale(&scaled)
    }

    /// Evaluate `Σ coeffs[k] x^k` (degree ≤ 3) slot-wise. Uses
    /// `⌈log2(deg + 1)⌉` levels and returns a ciphertext at `target_scale`.
    pub fn evaluate_polynomial(
        &self,
        x: &S::Ciphertext,
        coeffs: &[f64],
        target_scale: f64,
    ) -> Result<S::Ciphertext> {
        let degree = coeffs.iter().rposition(|&c| c != 0.0).unwrap_or(0);
        if degree > 3 {
            return Err(CkksError::PolynomialDegree(degree));
        }
        let depth = if degree <= 1 { 1 } else { 2 };
        let level = x.level();
        if level < depth {
            return Err(CkksError::LevelExhausted { op: "evaluate", level });
        }
        let coeff = |k: usize| coeffs.get(k).copied().unwrap_or(0.0);

        if degree <= 1 {
            let cs = target_scale * self.params().q(level) / x.scale();
            let lin = self.mul_const(x, coeff(1), cs)?;
            let lin = self.add_const_nonzero(&lin, coeff(0))?;
            return self.rescale(&lin);
        }

        let x2 = self.square(x)?;
        self.evaluate_polynomial_with_square(x, &x2, coeffs, target_scale)
    }

    /// Degree 2 or 3 evaluation reusing a square computed by the caller.
    /// `x2` must be `square(x)`, one level below `x`.
    pub fn evaluate_polynomial_with_square(
        &self,
        x: &S::Ciphertext,
        x2: &S::Ciphertext,
        coeffs: &[f64],
        target_scale: f64,
    ) -> Result<S::Ciphertext> {
        let degree = coeffs.iter().rposition(|&c| c != 0.0).unwrap_or(0);
        if degree > 3 {
            return Err(CkksError::PolynomialDegree(degree));
        }
        let level = x.level();
        if level < 2 || x2.level() + 1 != level {
            return Err(CkksError::LevelExhausted { op: "evaluate", level });
        }
        let coeff = |k: usize| coeffs.get(k).copied().unwrap_or(0.0);
        let prod_scale = target_scale * self.params().q(level - 1);

        let high = if degree == 3 {
            // inner = c3·x + c2 at a scale that makes x²·inner land on prod_scale
            let inner_scale = prod_scale / x2.scale();
            let cs = inner_scale * self.params().q(level) / x.scale();
            let inner = self.mul_const(x, coeff(3), cs)?;
            let inner = self.add_const_nonzero(&inner, coeff(2))?;
            let inner = self.rescale(&inner)?;
            self.mul_relin(x2, &inner)?
        } else {
            self.mul_const(x2, coeff(2), prod_scale / x2.scale())?
        };

        let x_low = self.drop_to_level(x, level - 1)?;
        let lin = self.mul_const(&x_low, coeff(1), high.scale() / x.scale())?;
        let sum = self.add(&high, &lin)?;
        let sum = self.add_const_nonzero(&sum, coeff(0))?;
        self.rescale(&sum)
    }

    /// `rescale(relin(x · x))`.
    pub fn square(&self, x: &S::Ciphertext) -> Result<S::Ciphertext> {
        let sq = self.mul_relin(x, x)?;
        self.rescale(&sq)
    }

    fn add_const_nonzero(&self, ct: &S::Ciphertext, c: f64) -> Result<S::Ciphertext> {
        if c == 0.0 {
            Ok(ct.clone())
        } else {
            self.add_const(ct, c)
        }
    }
}
