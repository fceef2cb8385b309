//! Residue Number System (RNS) polynomial representation.
//!
//! A polynomial in Z_Q[X]/(X^N+1), Q = q_0 ⋯ q_k, is stored as one residue
//! vector per active prime. Every per-prime operation is independent, so the
//! heavier ones (NTT products, rescaling) fan out across primes with rayon.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::ntt::{mod_inv, reduce_i128, NttContext};
use crate::error::{CkksError, Result};

/// Ring dimension plus NTT tables for every prime of the chain.
#[derive(Clone, Debug)]
pub struct RnsContext {
    pub n: usize,
    pub moduli: Vec<i64>,
    pub ntt: Vec<NttContext>,
}

impl RnsContext {
    pub fn new(n: usize, moduli: &[i64]) -> Result<Self> {
        let ntt = moduli
            .iter()
            .map(|&q| {
                NttContext::new(q, n).ok_or_else(|| {
                    CkksError::UnsupportedParameters(format!(
                        "no NTT tables for q={} and N={}",
                        q, n
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            n,
            moduli: moduli.to_vec(),
            ntt,
        })
    }
}

/// A polynomial in RNS form. `residues[i][j]` is coefficient j mod prime i,
/// stored in [0, q_i).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RnsPoly {
    pub residues: Vec<Vec<i64>>,
}

impl RnsPoly {
    pub fn zero(n: usize, num_primes: usize) -> Self {
        Self {
            residues: vec![vec![0i64; n]; num_primes],
        }
    }

    /// Reduce signed coefficients modulo each of the first `num_primes` primes.
    pub fn from_i128(coeffs: &[i128], ctx: &RnsContext, num_primes: usize) -> Self {
        let residues = ctx.moduli[..num_primes]
            .iter()
            .map(|&q| {
                let mut res = vec![0i64; ctx.n];
                for (r, &c) in res.iter_mut().zip(coeffs.iter()) {
                    *r = reduce_i128(c, q);
                }
                res
            })
            .collect();
        Self { residues }
    }

    pub fn from_small(coeffs: &[i64], ctx: &RnsContext, num_primes: usize) -> Self {
        let wide: Vec<i128> = coeffs.iter().map(|&c| c as i128).collect();
        Self::from_i128(&wide, ctx, num_primes)
    }

    pub fn num_primes(&self) -> usize {
        self.residues.len()
    }

    pub fn add(&self, other: &RnsPoly, ctx: &RnsContext) -> RnsPoly {
        self.zip_with(other, ctx, |a, b, q| {
            let s = a + b;
            if s >= q {
                s - q
            } else {
                s
            }
        })
    }

    pub fn sub(&self, other: &RnsPoly, ctx: &RnsContext) -> RnsPoly {
        self.zip_with(other, ctx, |a, b, q| {
            let d = a - b;
            if d < 0 {
                d + q
            } else {
                d
            }
        })
    }

    pub fn neg(&self, ctx: &RnsContext) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(ctx.moduli.iter())
            .map(|(res, &q)| res.iter().map(|&a| if a == 0 { 0 } else { q - a }).collect())
            .collect();
        RnsPoly { residues }
    }

    /// Multiply every coefficient by an integer constant.
    pub fn scalar_mul(&self, scalar: i128, ctx: &RnsContext) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(ctx.moduli.iter())
            .map(|(res, &q)| {
                let s = reduce_i128(scalar, q) as i128;
                res.iter()
                    .map(|&a| (a as i128 * s % q as i128) as i64)
                    .collect()
            })
            .collect();
        RnsPoly { residues }
    }

    /// Negacyclic product via per-prime NTT.
    pub fn mul(&self, other: &RnsPoly, ctx: &RnsContext) -> RnsPoly {
        let k = self.num_primes().min(other.num_primes());
        let residues = (0..k)
            .into_par_iter()
            .map(|i| ctx.ntt[i].mul(&self.residues[i], &other.residues[i]))
            .collect();
        RnsPoly { residues }
    }

    /// Convert every residue vector to the NTT domain.
    pub fn to_ntt(&self, ctx: &RnsContext) -> RnsPoly {
        let residues = self
            .residues
            .par_iter()
            .enumerate()
            .map(|(i, r)| ctx.ntt[i].forward(r))
            .collect();
        RnsPoly { residues }
    }

    pub fn from_ntt(&self, ctx: &RnsContext) -> RnsPoly {
        let residues = self
            .residues
            .par_iter()
            .enumerate()
            .map(|(i, r)| ctx.ntt[i].inverse(r))
            .collect();
        RnsPoly { residues }
    }

    /// `acc += a ⊙ b` slot-wise, all three in the NTT domain.
    pub fn mul_acc_ntt(acc: &mut RnsPoly, a: &RnsPoly, b: &RnsPoly, ctx: &RnsContext) {
        acc.residues
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, out)| {
                let q = ctx.moduli[i] as i128;
                for ((o, &x), &y) in out.iter_mut().zip(a.residues[i].iter()).zip(b.residues[i].iter()) {
                    *o = ((*o as i128 + x as i128 * y as i128) % q) as i64;
                }
            });
    }

    /// Multiply by the monomial X^k (0 ≤ k < 2N).
    pub fn mul_monomial(&self, k: usize, ctx: &RnsContext) -> RnsPoly {
        let n = ctx.n;
        let residues = self
            .residues
            .iter()
            .zip(ctx.moduli.iter())
            .map(|(res, &q)| {
                let mut out = vec![0i64; n];
                for (j, &a) in res.iter().enumerate() {
                    let idx = (j + k) % (2 * n);
                    if idx < n {
                        out[idx] = a;
                    } else {
                        out[idx - n] = if a == 0 { 0 } else { q - a };
                    }
                }
                out
            })
            .collect();
        RnsPoly { residues }
    }

    /// Apply the Galois automorphism X → X^g (g odd, < 2N).
    pub fn apply_automorphism(&self, g: usize, ctx: &RnsContext) -> RnsPoly {
        let n = ctx.n;
        let two_n = 2 * n;
        let residues = self
            .residues
            .iter()
            .zip(ctx.moduli.iter())
            .map(|(res, &q)| {
                let mut out = vec![0i64; n];
                for (j, &a) in res.iter().enumerate() {
                    let idx = (g * j) % two_n;
                    if idx < n {
                        out[idx] = a;
                    } else {
                        // X^N = -1
                        out[idx - n] = if a == 0 { 0 } else { q - a };
                    }
                }
                out
            })
            .collect();
        RnsPoly { residues }
    }

    /// Keep only the first `num_primes` residues.
    pub fn truncate(&self, num_primes: usize) -> RnsPoly {
        RnsPoly {
            residues: self.residues[..num_primes].to_vec(),
        }
    }

    /// The first `num_primes` residues followed by the last one.
    pub fn with_last(&self, num_primes: usize) -> RnsPoly {
        let mut residues = self.residues[..num_primes].to_vec();
        if let Some(last) = self.residues.last() {
            residues.push(last.clone());
        }
        RnsPoly { residues }
    }

    /// Divide by the last active prime with rounding and drop it.
    pub fn drop_last_prime(&self, ctx: &RnsContext) -> RnsPoly {
        let last = self.num_primes() - 1;
        let q_last = ctx.moduli[last];
        let half = q_last / 2;
        let top = &self.residues[last];
        let residues = (0..last)
            .into_par_iter()
            .map(|i| {
                let q_i = ctx.moduli[i] as i128;
                let inv = mod_inv(q_last % ctx.moduli[i], ctx.moduli[i]) as i128;
                self.residues[i]
                    .iter()
                    .zip(top.iter())
                    .map(|(&a, &r)| {
                        // Centered remainder gives round-to-nearest division.
                        let r = (if r > half { r - q_last } else { r }) as i128;
                        let diff = ((a as i128 - r) % q_i + q_i) % q_i;
                        (diff * inv % q_i) as i64
                    })
                    .collect()
            })
            .collect();
        RnsPoly { residues }
    }

    /// Centered coefficients as f64, via Garner mixed-radix reconstruction.
    pub fn to_f64_coeffs(&self, ctx: &RnsContext) -> Vec<f64> {
        let k = self.num_primes();
        let primes = &ctx.moduli[..k];
        let inverses = garner_inverses(primes);
        (0..ctx.n)
            .map(|j| {
                let residues: Vec<i64> = self.residues.iter().map(|r| r[j]).collect();
                garner_centered_f64(&residues, primes, &inverses)
            })
            .collect()
    }

    fn zip_with(&self, other: &RnsPoly, ctx: &RnsContext, f: impl Fn(i64, i64, i64) -> i64) -> RnsPoly {
        let k = self.num_primes().min(other.num_primes());
        let residues = (0..k)
            .map(|i| {
                let q = ctx.moduli[i];
                self.residues[i]
                    .iter()
                    .zip(other.residues[i].iter())
                    .map(|(&a, &b)| f(a, b, q))
                    .collect()
            })
            .collect();
        RnsPoly { residues }
    }
}

/// `inv[i][j] = q_j^{-1} mod q_i` for j < i.
fn garner_inverses(primes: &[i64]) -> Vec<Vec<i64>> {
    primes
        .iter()
        .enumerate()
        .map(|(i, &qi)| primes[..i].iter().map(|&qj| mod_inv(qj % qi, qi)).collect())
        .collect()
}

/// Mixed-radix digits of x in [0, Q).
fn garner_digits(residues: &[i64], primes: &[i64], inverses: &[Vec<i64>]) -> Vec<i64> {
    let mut digits: Vec<i64> = Vec::with_capacity(primes.len());
    for i in 0..primes.len() {
        let qi = primes[i] as i128;
        // x_i = (r_i - (d_0 + d_1 q_0 + ...)) / (q_0 ⋯ q_{i-1}) mod q_i
        let mut t = residues[i] as i128;
        for j in 0..i {
            t = ((t - digits[j] as i128) % qi + qi) % qi;
            t = t * inverses[i][j] as i128 % qi;
        }
        digits.push(t as i64);
    }
    digits
}

fn garner_centered_f64(residues: &[i64], primes: &[i64], inverses: &[Vec<i64>]) -> f64 {
    let digits = garner_digits(residues, primes, inverses);
    let top = primes.len() - 1;
    let negative = digits[top] > primes[top] / 2;
    if !negative {
        return digits_to_f64(&digits, primes);
    }
    let negated: Vec<i64> = residues
        .iter()
        .zip(primes.iter())
        .map(|(&r, &q)| if r == 0 { 0 } else { q - r })
        .collect();
    -digits_to_f64(&garner_digits(&negated, primes, inverses), primes)
}

fn digits_to_f64(digits: &[i64], primes: &[i64]) -> f64 {
    let mut value = 0.0f64;
    let mut radix = 1.0f64;
    for (d, q) in digits.iter().zip(primes.iter()) {
        value += *d as f64 * radix;
        radix *= *q as f64;
    }
    value
}
