//! Number Theoretic Transform over the negacyclic ring Z_q[X]/(X^N + 1).
//!
//! Each chain prime q satisfies q ≡ 1 (mod 8192), so a primitive 2N-th root
//! of unity exists for every power-of-two N up to 4096. The tables below hold
//! one primitive 8192-th root per prime; smaller rings use a power of it.

/// NTT-friendly primes for the modulus chain, ~36 bits each.
///
/// Each prime q satisfies:
/// - q ≡ 1 (mod 8192)
/// - q * q fits in i128 for multiplication without overflow
pub const NTT_PRIMES: [i64; 20] = [
    68719403009,
    68719230977,
    68719206401,
    68719190017,
    68719157249,
    68718764033,
    68718428161,
    68718346241,
    68718305281,
    68717928449,
    68717740033,
    68717682689,
    68717592577,
    68717363201,
    68717223937,
    68717142017,
    68717076481,
    68717068289,
    68716781569,
    68716707841,
];

/// Primitive 8192-th roots of unity ψ for each prime in [`NTT_PRIMES`].
const NTT_ROOTS: [i64; 20] = [
    5546991020,
    41019061109,
    41978190371,
    60726334289,
    36981953102,
    1937762328,
    22370218154,
    6173043660,
    67995098886,
    59422617459,
    54640452894,
    52499569528,
    36661170687,
    63942896849,
    12605105312,
    27475774088,
    37399532359,
    45270410758,
    20421207940,
    18573596375,
];

/// Prime reserved for hybrid key switching; never part of a modulus chain.
pub const SPECIAL_PRIME: i64 = NTT_PRIMES[NTT_PRIMES.len() - 1];

/// Primes available to a modulus chain.
pub const CHAIN_PRIMES: usize = NTT_PRIMES.len() - 1;

/// Largest ring dimension the root table supports.
pub const MAX_RING_DIM: usize = 4096;

/// Modular exponentiation with i128 intermediates.
pub fn mod_pow(base: i64, mut exp: u64, modulus: i64) -> i64 {
    let m = modulus as i128;
    let mut result: i128 = 1;
    let mut b = ((base as i128 % m) + m) % m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result * b % m;
        }
        exp >>= 1;
        b = b * b % m;
    }
    result as i64
}

/// Modular inverse via Fermat's little theorem (p prime, a ≢ 0).
pub fn mod_inv(a: i64, p: i64) -> i64 {
    mod_pow(a, (p - 2) as u64, p)
}

/// Reduce any i128 into [0, q).
#[inline]
pub fn reduce_i128(v: i128, q: i64) -> i64 {
    let q = q as i128;
    (((v % q) + q) % q) as i64
}

/// Primitive 2n-th root of unity modulo a chain prime, or `None` if `q` is
/// not in the chain or `n` exceeds [`MAX_RING_DIM`].
pub fn primitive_root(q: i64, n: usize) -> Option<i64> {
    if !n.is_power_of_two() || n > MAX_RING_DIM {
        return None;
    }
    let idx = NTT_PRIMES.iter().position(|&p| p == q)?;
    Some(mod_pow(NTT_ROOTS[idx], (MAX_RING_DIM / n) as u64, q))
}

/// Precomputed NTT tables for one prime and one ring dimension.
#[derive(Clone, Debug)]
pub struct NttContext {
    pub q: i64,
    pub n: usize,
    psi_powers: Vec<i64>,
    psi_inv_powers: Vec<i64>,
    /// Primitive len-th roots for each butterfly stage (len = 2, 4, ..., n).
    stage_roots: Vec<i64>,
    stage_roots_inv: Vec<i64>,
    n_inv: i64,
}

impl NttContext {
    /// Returns `None` when `q` is not a chain prime or `n` is unsupported.
    pub fn new(q: i64, n: usize) -> Option<Self> {
        let psi = primitive_root(q, n)?;
        let psi_inv = mod_inv(psi, q);
        let mut stage_roots = Vec::new();
        let mut stage_roots_inv = Vec::new();
        let mut len = 2;
        while len <= n {
            stage_roots.push(mod_pow(psi, (2 * n / len) as u64, q));
            stage_roots_inv.push(mod_pow(psi_inv, (2 * n / len) as u64, q));
            len <<= 1;
        }
        Some(Self {
            q,
            n,
            psi_powers: powers(psi, q, n),
            psi_inv_powers: powers(psi_inv, q, n),
            stage_roots,
            stage_roots_inv,
            n_inv: mod_inv(n as i64, q),
        })
    }

    /// Forward negacyclic NTT: twist by ψ^i, then cyclic Cooley-Tukey.
    /// Input residues must already be in [0, q).
    pub fn forward(&self, a: &[i64]) -> Vec<i64> {
        debug_assert_eq!(a.len(), self.n);
        let q128 = self.q as i128;
        let mut data: Vec<i64> = a
            .iter()
            .zip(self.psi_powers.iter())
            .map(|(&c, &pw)| (c as i128 * pw as i128 % q128) as i64)
            .collect();
        self.butterflies(&mut data, &self.stage_roots);
        data
    }

    /// Inverse negacyclic NTT, recovering coefficients in [0, q).
    pub fn inverse(&self, a: &[i64]) -> Vec<i64> {
        debug_assert_eq!(a.len(), self.n);
        let q128 = self.q as i128;
        let mut data = a.to_vec();
        self.butterflies(&mut data, &self.stage_roots_inv);
        for (v, &pw) in data.iter_mut().zip(self.psi_inv_powers.iter()) {
            let scaled = *v as i128 * self.n_inv as i128 % q128;
            *v = (scaled * pw as i128 % q128) as i64;
        }
        data
    }

    /// Negacyclic product of two residue vectors.
    pub fn mul(&self, a: &[i64], b: &[i64]) -> Vec<i64> {
        let a_ntt = self.forward(a);
        let b_ntt = self.forward(b);
        let q128 = self.q as i128;
        let c_ntt: Vec<i64> = a_ntt
            .iter()
            .zip(b_ntt.iter())
            .map(|(&x, &y)| (x as i128 * y as i128 % q128) as i64)
            .collect();
        self.inverse(&c_ntt)
    }

    /// Reduce a residue to the centered range (-q/2, q/2].
    pub fn center(&self, v: i64) -> i64 {
        let half = self.q / 2;
        if v > half {
            v - self.q
        } else {
            v
        }
    }

    fn butterflies(&self, data: &mut [i64], roots: &[i64]) {
        let n = self.n;
        let q128 = self.q as i128;
        bit_reverse_permutation(data);
        let mut len = 2;
        let mut stage = 0;
        while len <= n {
            let half = len / 2;
            let w = roots[stage] as i128;
            let mut j = 0;
            while j < n {
                let mut wk: i128 = 1;
                for k in 0..half {
                    let u = data[j + k] as i128;
                    let v = (data[j + k + half] as i128 * wk) % q128;
                    data[j + k] = ((u + v) % q128) as i64;
                    data[j + k + half] = ((u - v + q128) % q128) as i64;
                    wk = wk * w % q128;
                }
                j += len;
            }
            len <<= 1;
            stage += 1;
        }
    }
}

fn powers(root: i64, q: i64, n: usize) -> Vec<i64> {
    let q128 = q as i128;
    let mut out = vec![0i64; n];
    out[0] = 1;
    for i in 1..n {
        out[i] = (out[i - 1] as i128 * root as i128 % q128) as i64;
    }
    out
}

fn bit_reverse_permutation(data: &mut [i64]) {
    let n = data.len();
    let bits = n.trailing_zeros();
    for i in 0..n {
        let j = (i as u32).reverse_bits().checked_shr(32 - bits).unwrap_or(0) as usize;
        if i < j {
            data.swap(i, j);
        }
    }
}
