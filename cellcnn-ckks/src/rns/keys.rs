//! Key material for the lattice backend: sampling, key generation and
//! hybrid key switching.
//!
//! Key switching works modulo `Q·P`, where `P` is a special prime outside
//! the chain. A switching key from s' to s holds, for every chain prime i, an
//! encryption of `P · e_i · s'` where `e_i` is 1 modulo q_i and 0 modulo every
//! other prime. A ciphertext component is split into its residues, each
//! lifted to `Q_l·P`, multiplied with the key and the sum divided by `P`, so
//! the key noise shrinks by a factor of `P` before it reaches the result.
//! The key does not depend on the level: keys generated over the whole chain
//! stay valid at every level after dropping their extra chain residues.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use super::ntt::NttContext;
use super::poly::{RnsContext, RnsPoly};
use crate::error::{CkksError, Result};
use crate::params::SIGMA;

// ── Sampling ────────────────────────────────────────────────────────────

/// Uniform polynomial over the first `num_primes` primes.
pub fn sample_uniform(ctx: &RnsContext, num_primes: usize, rng: &mut dyn RngCore) -> RnsPoly {
    let residues = ctx.moduli[..num_primes]
        .iter()
        .map(|&q| (0..ctx.n).map(|_| rng.gen_range(0..q)).collect())
        .collect();
    RnsPoly { residues }
}

/// Ternary coefficients, P(0) = 1/2, P(±1) = 1/4.
pub fn sample_ternary(n: usize, rng: &mut dyn RngCore) -> Vec<i64> {
    (0..n)
        .map(|_| match rng.gen_range(0u8..4) {
            0 => -1,
            1 => 1,
            _ => 0,
        })
        .collect()
}

/// Discrete Gaussian coefficients with σ = 3.2, Box-Muller with 6σ tail cut.
pub fn sample_gaussian(n: usize, rng: &mut dyn RngCore) -> Vec<i64> {
    let tail_bound = (SIGMA * 6.0).ceil() as i64;
    let mut coeffs = Vec::with_capacity(n);
    while coeffs.len() < n {
        let u1: f64 = rng.gen_range(1e-15_f64..1.0_f64);
        let u2: f64 = rng.gen_range(0.0_f64..std::f64::consts::TAU);
        let r = (-2.0 * u1.ln()).sqrt() * SIGMA;
        for z in [r * u2.cos(), r * u2.sin()] {
            let s = z.round() as i64;
            if s.abs() <= tail_bound && coeffs.len() < n {
                coeffs.push(s);
            }
        }
    }
    coeffs
}

// ── Switching keys ──────────────────────────────────────────────────────

/// Chain primes extended with the special prime, one context per level.
#[derive(Clone, Debug)]
pub struct KeySwitchContext {
    special: i64,
    /// `levels[l]` covers chain primes `0..=l` followed by the special prime.
    levels: Vec<RnsContext>,
}

impl KeySwitchContext {
    pub fn new(chain: &RnsContext, special: i64) -> Result<Self> {
        if chain.moduli.contains(&special) {
            return Err(CkksError::UnsupportedParameters(format!(
                "special prime {} is part of the chain",
                special
            )));
        }
        let special_ntt = NttContext::new(special, chain.n).ok_or_else(|| {
            CkksError::UnsupportedParameters(format!(
                "no NTT tables for special prime {} and N={}",
                special, chain.n
            ))
        })?;
        let levels = (1..=chain.moduli.len())
            .map(|k| {
                let mut moduli = chain.moduli[..k].to_vec();
                moduli.push(special);
                let mut ntt = chain.ntt[..k].to_vec();
                ntt.push(special_ntt.clone());
                RnsContext {
                    n: chain.n,
                    moduli,
                    ntt,
                }
            })
            .collect();
        Ok(Self { special, levels })
    }

    pub fn special(&self) -> i64 {
        self.special
    }

    /// Context over the first `num_primes` chain primes and the special prime.
    pub fn at(&self, num_primes: usize) -> &RnsContext {
        &self.levels[num_primes - 1]
    }

    fn full(&self) -> &RnsContext {
        &self.levels[self.levels.len() - 1]
    }

    /// Lift a chain polynomial whose coefficients are below `q_0 / 2` in
    /// magnitude, such as a secret key, to the extended basis.
    pub fn lift_small(&self, p: &RnsPoly) -> RnsPoly {
        let ext = self.full();
        let q0 = ext.moduli[0];
        let coeffs: Vec<i64> = p.residues[0].iter().map(|&r| center(r, q0)).collect();
        RnsPoly::from_small(&coeffs, ext, ext.moduli.len())
    }
}

fn center(r: i64, q: i64) -> i64 {
    if r > q / 2 {
        r - q
    } else {
        r
    }
}

/// `digits[i] = (b, a)` in the NTT domain over every chain prime followed by
/// the special prime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwitchingKey {
    pub digits: Vec<(RnsPoly, RnsPoly)>,
}

impl SwitchingKey {
    /// Key switching `s_from` to `s`, both given over the extended basis
    /// (see [`KeySwitchContext::lift_small`]).
    pub fn generate(ks: &KeySwitchContext, s: &RnsPoly, s_from: &RnsPoly, rng: &mut dyn RngCore) -> Self {
        let ext = ks.full();
        let k = ext.moduli.len() - 1;
        let s_ntt = s.to_ntt(ext);
        let mut digits = Vec::with_capacity(k);
        for i in 0..k {
            let a = sample_uniform(ext, k + 1, rng);
            let e = RnsPoly::from_small(&sample_gaussian(ext.n, rng), ext, k + 1);
            let a_ntt = a.to_ntt(ext);
            let mut a_s = RnsPoly::zero(ext.n, k + 1);
            RnsPoly::mul_acc_ntt(&mut a_s, &a_ntt, &s_ntt, ext);
            let mut b = e.sub(&a_s.from_ntt(ext), ext);

            // gadget term: P · s_from at chain prime i only
            let q = ext.moduli[i] as i128;
            let p_mod = (ks.special() as i128) % q;
            for (out, &x) in b.residues[i].iter_mut().zip(s_from.residues[i].iter()) {
                *out = ((*out as i128 + x as i128 * p_mod) % q) as i64;
            }
            digits.push((b.to_ntt(ext), a_ntt));
        }
        Self { digits }
    }

    /// Centered residues of `c` (coefficient form, primes 0..=level), each
    /// lifted to the chain primes of `c` plus the special prime.
    pub fn decompose(c: &RnsPoly, ks: &KeySwitchContext) -> Vec<RnsPoly> {
        let k = c.num_primes();
        let ext = ks.at(k);
        c.residues
            .iter()
            .zip(ext.moduli.iter())
            .map(|(r, &q)| {
                let small: Vec<i64> = r.iter().map(|&v| center(v, q)).collect();
                RnsPoly::from_small(&small, ext, k + 1)
            })
            .collect()
    }

    /// Apply the key to decomposed digits and divide by the special prime.
    /// Returns `(ks0, ks1)` over the chain primes with `ks0 + ks1·s ≈ c·s_from`.
    pub fn apply(&self, digits: &[RnsPoly], ks: &KeySwitchContext) -> (RnsPoly, RnsPoly) {
        let k = digits.len();
        let ext = ks.at(k);
        let mut acc0 = RnsPoly::zero(ext.n, k + 1);
        let mut acc1 = RnsPoly::zero(ext.n, k + 1);
        for (digit, (b, a)) in digits.iter().zip(self.digits.iter()) {
            let digit_ntt = digit.to_ntt(ext);
            RnsPoly::mul_acc_ntt(&mut acc0, &digit_ntt, &b.with_last(k), ext);
            RnsPoly::mul_acc_ntt(&mut acc1, &digit_ntt, &a.with_last(k), ext);
        }
        (
            acc0.from_ntt(ext).drop_last_prime(ext),
            acc1.from_ntt(ext).drop_last_prime(ext),
        )
    }

    pub fn switch(&self, c: &RnsPoly, ks: &KeySwitchContext) -> (RnsPoly, RnsPoly) {
        self.apply(&Self::decompose(c, ks), ks)
    }
}
