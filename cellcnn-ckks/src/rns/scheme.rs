//! Lattice CKKS over an RNS modulus chain.

use std::collections::HashMap;

use log::debug;
use num_complex::Complex64;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::encoding::{SlotEncoder, GALOIS_GEN};
use super::keys::{sample_gaussian, sample_ternary, sample_uniform, KeySwitchContext, SwitchingKey};
use super::ntt::{MAX_RING_DIM, SPECIAL_PRIME};
use super::poly::{RnsContext, RnsPoly};
use crate::error::{CkksError, Result};
use crate::params::{scales_match, CkksParameters};
use crate::scheme::{CkksScheme, Leveled};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RnsPlaintext {
    pub poly: RnsPoly,
    pub level: usize,
    pub scale: f64,
}

/// `c0 + c1·s (+ c2·s²)`. `c2` is present only between a tensor product and
/// its relinearization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RnsCiphertext {
    pub c0: RnsPoly,
    pub c1: RnsPoly,
    pub c2: Option<RnsPoly>,
    pub level: usize,
    pub scale: f64,
}

impl Leveled for RnsPlaintext {
    fn level(&self) -> usize {
        self.level
    }
    fn scale(&self) -> f64 {
        self.scale
    }
}

impl Leveled for RnsCiphertext {
    fn level(&self) -> usize {
        self.level
    }
    fn scale(&self) -> f64 {
        self.scale
    }
}

impl RnsCiphertext {
    fn degree(&self) -> usize {
        if self.c2.is_some() {
            2
        } else {
            1
        }
    }

    fn truncate(&self, level: usize) -> RnsCiphertext {
        let k = level + 1;
        RnsCiphertext {
            c0: self.c0.truncate(k),
            c1: self.c1.truncate(k),
            c2: self.c2.as_ref().map(|c| c.truncate(k)),
            level,
            scale: self.scale,
        }
    }
}

/// Secret key (or an additive share of one) over every chain prime.
#[derive(Clone, Debug)]
pub struct RnsSecretKey {
    pub poly: RnsPoly,
}

#[derive(Clone, Debug)]
pub struct RnsPublicKey {
    pub b: RnsPoly,
    pub a: RnsPoly,
}

pub struct RnsEvaluationKeys {
    pub relin: SwitchingKey,
    pub conjugation: SwitchingKey,
    /// Keyed by rotation normalized into [0, slots).
    pub rotations: HashMap<usize, SwitchingKey>,
}

/// Lattice backend. Supports N ≤ 4096 with a fully packed slot vector.
pub struct RnsCkks {
    params: CkksParameters,
    ctx: RnsContext,
    switching: KeySwitchContext,
    encoder: SlotEncoder,
}

impl RnsCkks {
    pub fn new(params: CkksParameters) -> Result<Self> {
        let n = params.n();
        if n > MAX_RING_DIM {
            return Err(CkksError::UnsupportedParameters(format!(
                "ring dimension {} exceeds {}",
                n, MAX_RING_DIM
            )));
        }
        if params.log_slots + 1 != params.log_n {
            return Err(CkksError::UnsupportedParameters(
                "lattice backend requires log_slots = log_n - 1".into(),
            ));
        }
        let ctx = RnsContext::new(n, &params.moduli)?;
        let switching = KeySwitchContext::new(&ctx, SPECIAL_PRIME)?;
        Ok(Self {
            encoder: SlotEncoder::new(n),
            params,
            ctx,
            switching,
        })
    }

    pub fn context(&self) -> &RnsContext {
        &self.ctx
    }

    fn galois_element(&self, k: usize) -> usize {
        let two_n = 2 * self.ctx.n;
        let mut g = 1usize;
        for _ in 0..k {
            g = g * GALOIS_GEN % two_n;
        }
        g
    }

    /// `s` over the extended basis.
    fn switching_key_for(&self, s: &RnsPoly, galois: usize, rng: &mut dyn RngCore) -> SwitchingKey {
        let ext = self.switching.at(self.ctx.moduli.len());
        let s_auto = s.apply_automorphism(galois, ext);
        SwitchingKey::generate(&self.switching, s, &s_auto, rng)
    }

    /// Encode a constant as `round(re·scale) + round(im·scale)·X^{N/2}`.
    fn constant_poly(&self, c: Complex64, scale: f64, num_primes: usize) -> RnsPoly {
        let mut coeffs = vec![0i128; self.ctx.n];
        coeffs[0] = (c.re * scale).round() as i128;
        coeffs[self.ctx.n / 2] = (c.im * scale).round() as i128;
        RnsPoly::from_i128(&coeffs, &self.ctx, num_primes)
    }

    fn check_degree_one(ct: &RnsCiphertext) -> Result<()> {
        match ct.degree() {
            1 => Ok(()),
            d => Err(CkksError::DegreeTooHigh(d)),
        }
    }

    fn add_parts(
        &self,
        a: &RnsCiphertext,
        b: &RnsCiphertext,
        subtract: bool,
    ) -> Result<RnsCiphertext> {
        if !scales_match(a.scale, b.scale) {
            return Err(CkksError::ScaleMismatch {
                left: a.scale,
                right: b.scale,
            });
        }
        let level = a.level.min(b.level);
        let (a, b) = (a.truncate(level), b.truncate(level));
        let op = |x: &RnsPoly, y: &RnsPoly| {
            if subtract {
                x.sub(y, &self.ctx)
            } else {
                x.add(y, &self.ctx)
            }
        };
        let c2 = match (&a.c2, &b.c2) {
            (Some(x), Some(y)) => Some(op(x, y)),
            (Some(x), None) => Some(x.clone()),
            (None, Some(y)) => Some(if subtract { y.neg(&self.ctx) } else { y.clone() }),
            (None, None) => None,
        };
        Ok(RnsCiphertext {
            c0: op(&a.c0, &b.c0),
            c1: op(&a.c1, &b.c1),
            c2,
            level,
            scale: a.scale,
        })
    }

    fn key_switch_rotate(
        &self,
        ct: &RnsCiphertext,
        galois: usize,
        digits: &[RnsPoly],
        key: &SwitchingKey,
    ) -> RnsCiphertext {
        let ext = self.switching.at(digits.len());
        let rotated_digits: Vec<RnsPoly> = digits
            .iter()
            .map(|d| d.apply_automorphism(galois, ext))
            .collect();
        let (ks0, ks1) = key.apply(&rotated_digits, &self.switching);
        RnsCiphertext {
            c0: ct.c0.apply_automorphism(galois, &self.ctx).add(&ks0, &self.ctx),
            c1: ks1,
            c2: None,
            level: ct.level,
            scale: ct.scale,
        }
    }
}

impl CkksScheme for RnsCkks {
    type Plaintext = RnsPlaintext;
    type Ciphertext = RnsCiphertext;
    type SecretKey = RnsSecretKey;
    type PublicKey = RnsPublicKey;
    type EvaluationKeys = RnsEvaluationKeys;

    fn params(&self) -> &CkksParameters {
        &self.params
    }

    fn gen_secret_key(&self, rng: &mut dyn RngCore) -> RnsSecretKey {
        let coeffs = sample_ternary(self.ctx.n, rng);
        RnsSecretKey {
            poly: RnsPoly::from_small(&coeffs, &self.ctx, self.ctx.moduli.len()),
        }
    }

    fn aggregate_secret_keys(&self, shares: &[RnsSecretKey]) -> Result<RnsSecretKey> {
        let (first, rest) = shares
            .split_first()
            .ok_or_else(|| CkksError::UnsupportedParameters("no key shares".into()))?;
        let poly = rest
            .iter()
            .fold(first.poly.clone(), |acc, s| acc.add(&s.poly, &self.ctx));
        Ok(RnsSecretKey { poly })
    }

    fn gen_public_key(&self, sk: &RnsSecretKey, rng: &mut dyn RngCore) -> RnsPublicKey {
        let k = self.ctx.moduli.len();
        let a = sample_uniform(&self.ctx, k, rng);
        let e = RnsPoly::from_small(&sample_gaussian(self.ctx.n, rng), &self.ctx, k);
        // b = -(a·s + e)
        let b = a.mul(&sk.poly, &self.ctx).add(&e, &self.ctx).neg(&self.ctx);
        let pk = RnsPublicKey { b, a };
        debug!("public key {}", key_fingerprint(&pk));
        pk
    }

    fn gen_evaluation_keys(
        &self,
        sk: &RnsSecretKey,
        rotations: &[i64],
        rng: &mut dyn RngCore,
    ) -> Result<RnsEvaluationKeys> {
        let s = self.switching.lift_small(&sk.poly);
        let s2 = s.mul(&s, self.switching.at(self.ctx.moduli.len()));
        let relin = SwitchingKey::generate(&self.switching, &s, &s2, rng);
        let conjugation = self.switching_key_for(&s, 2 * self.ctx.n - 1, rng);
        let mut keys = HashMap::new();
        for &k in rotations {
            let k_norm = self.params.normalize_rotation(k);
            if k_norm == 0 || keys.contains_key(&k_norm) {
                continue;
            }
            let g = self.galois_element(k_norm);
            keys.insert(k_norm, self.switching_key_for(&s, g, rng));
        }
        debug!("generated {} rotation keys", keys.len());
        Ok(RnsEvaluationKeys {
            relin,
            conjugation,
            rotations: keys,
        })
    }

    fn encode(&self, values: &[Complex64], level: usize, scale: f64) -> Result<RnsPlaintext> {
        self.params.check_level(level)?;
        let slots = self.params.slots();
        if values.len() > slots {
            return Err(CkksError::TooManyValues {
                count: values.len(),
                slots,
            });
        }
        let coeffs = self.encoder.encode(values, scale);
        Ok(RnsPlaintext {
            poly: RnsPoly::from_i128(&coeffs, &self.ctx, level + 1),
            level,
            scale,
        })
    }

    fn decode(&self, pt: &RnsPlaintext) -> Vec<Complex64> {
        let coeffs = pt.poly.to_f64_coeffs(&self.ctx);
        self.encoder.decode(&coeffs, pt.scale)
    }

    fn encrypt(
        &self,
        pt: &RnsPlaintext,
        pk: &RnsPublicKey,
        rng: &mut dyn RngCore,
    ) -> Result<RnsCiphertext> {
        let k = pt.level + 1;
        let u = RnsPoly::from_small(&sample_ternary(self.ctx.n, rng), &self.ctx, k);
        let e1 = RnsPoly::from_small(&sample_gaussian(self.ctx.n, rng), &self.ctx, k);
        let e2 = RnsPoly::from_small(&sample_gaussian(self.ctx.n, rng), &self.ctx, k);
        let c0 = pk.b.truncate(k).mul(&u, &self.ctx).add(&e1, &self.ctx).add(&pt.poly, &self.ctx);
        let c1 = pk.a.truncate(k).mul(&u, &self.ctx).add(&e2, &self.ctx);
        Ok(RnsCiphertext {
            c0,
            c1,
            c2: None,
            level: pt.level,
            scale: pt.scale,
        })
    }

    fn decrypt(&self, ct: &RnsCiphertext, sk: &RnsSecretKey) -> Result<RnsPlaintext> {
        let k = ct.level + 1;
        let s = sk.poly.truncate(k);
        let mut m = ct.c0.add(&ct.c1.mul(&s, &self.ctx), &self.ctx);
        if let Some(c2) = &ct.c2 {
            let s2 = s.mul(&s, &self.ctx);
            m = m.add(&c2.mul(&s2, &self.ctx), &self.ctx);
        }
        Ok(RnsPlaintext {
            poly: m,
            level: ct.level,
            scale: ct.scale,
        })
    }

    fn add(&self, a: &RnsCiphertext, b: &RnsCiphertext) -> Result<RnsCiphertext> {
        self.add_parts(a, b, false)
    }

    fn sub(&self, a: &RnsCiphertext, b: &RnsCiphertext) -> Result<RnsCiphertext> {
        self.add_parts(a, b, true)
    }

    fn add_plain(&self, ct: &RnsCiphertext, pt: &RnsPlaintext) -> Result<RnsCiphertext> {
        if !scales_match(ct.scale, pt.scale) {
            return Err(CkksError::ScaleMismatch {
                left: ct.scale,
                right: pt.scale,
            });
        }
        let level = ct.level.min(pt.level);
        let mut out = ct.truncate(level);
        out.c0 = out.c0.add(&pt.poly.truncate(level + 1), &self.ctx);
        Ok(out)
    }

    fn sub_plain(&self, ct: &RnsCiphertext, pt: &RnsPlaintext) -> Result<RnsCiphertext> {
        if !scales_match(ct.scale, pt.scale) {
            return Err(CkksError::ScaleMismatch {
                left: ct.scale,
                right: pt.scale,
            });
        }
        let level = ct.level.min(pt.level);
        let mut out = ct.truncate(level);
        out.c0 = out.c0.sub(&pt.poly.truncate(level + 1), &self.ctx);
        Ok(out)
    }

    fn add_const(&self, ct: &RnsCiphertext, c: Complex64) -> Result<RnsCiphertext> {
        let mut out = ct.clone();
        let constant = self.constant_poly(c, ct.scale, ct.level + 1);
        out.c0 = out.c0.add(&constant, &self.ctx);
        Ok(out)
    }

    fn mul(&self, a: &RnsCiphertext, b: &RnsCiphertext) -> Result<RnsCiphertext> {
        Self::check_degree_one(a)?;
        Self::check_degree_one(b)?;
        let level = a.level.min(b.level);
        let (a, b) = (a.truncate(level), b.truncate(level));
        let d0 = a.c0.mul(&b.c0, &self.ctx);
        let d1 = a.c0.mul(&b.c1, &self.ctx).add(&a.c1.mul(&b.c0, &self.ctx), &self.ctx);
        let d2 = a.c1.mul(&b.c1, &self.ctx);
        Ok(RnsCiphertext {
            c0: d0,
            c1: d1,
            c2: Some(d2),
            level,
            scale: a.scale * b.scale,
        })
    }

    fn relinearize(&self, ct: &RnsCiphertext, keys: &RnsEvaluationKeys) -> Result<RnsCiphertext> {
        let Some(c2) = &ct.c2 else {
            return Ok(ct.clone());
        };
        let (ks0, ks1) = keys.relin.switch(c2, &self.switching);
        Ok(RnsCiphertext {
            c0: ct.c0.add(&ks0, &self.ctx),
            c1: ct.c1.add(&ks1, &self.ctx),
            c2: None,
            level: ct.level,
            scale: ct.scale,
        })
    }

    fn mul_plain(&self, ct: &RnsCiphertext, pt: &RnsPlaintext) -> Result<RnsCiphertext> {
        let level = ct.level.min(pt.level);
        let ct = ct.truncate(level);
        let m = pt.poly.truncate(level + 1);
        Ok(RnsCiphertext {
            c0: ct.c0.mul(&m, &self.ctx),
            c1: ct.c1.mul(&m, &self.ctx),
            c2: ct.c2.as_ref().map(|c| c.mul(&m, &self.ctx)),
            level,
            scale: ct.scale * pt.scale,
        })
    }

    fn mul_const(&self, ct: &RnsCiphertext, c: Complex64, const_scale: f64) -> Result<RnsCiphertext> {
        let re = (c.re * const_scale).round() as i128;
        let im = (c.im * const_scale).round() as i128;
        let half = self.ctx.n / 2;
        let apply = |p: &RnsPoly| {
            let mut out = p.scalar_mul(re, &self.ctx);
            if im != 0 {
                let shifted = p.mul_monomial(half, &self.ctx).scalar_mul(im, &self.ctx);
                out = out.add(&shifted, &self.ctx);
            }
            out
        };
        Ok(RnsCiphertext {
            c0: apply(&ct.c0),
            c1: apply(&ct.c1),
            c2: ct.c2.as_ref().map(apply),
            level: ct.level,
            scale: ct.scale * const_scale,
        })
    }

    fn mul_by_i(&self, ct: &RnsCiphertext) -> RnsCiphertext {
        let half = self.ctx.n / 2;
        RnsCiphertext {
            c0: ct.c0.mul_monomial(half, &self.ctx),
            c1: ct.c1.mul_monomial(half, &self.ctx),
            c2: ct.c2.as_ref().map(|c| c.mul_monomial(half, &self.ctx)),
            level: ct.level,
            scale: ct.scale,
        }
    }

    fn rescale(&self, ct: &RnsCiphertext) -> Result<RnsCiphertext> {
        if ct.level == 0 {
            return Err(CkksError::LevelExhausted {
                op: "rescale",
                level: 0,
            });
        }
        Ok(RnsCiphertext {
            c0: ct.c0.drop_last_prime(&self.ctx),
            c1: ct.c1.drop_last_prime(&self.ctx),
            c2: ct.c2.as_ref().map(|c| c.drop_last_prime(&self.ctx)),
            level: ct.level - 1,
            scale: ct.scale / self.params.q(ct.level),
        })
    }

    fn drop_level(&self, ct: &RnsCiphertext, levels: usize) -> Result<RnsCiphertext> {
        if levels > ct.level {
            return Err(CkksError::LevelExhausted {
                op: "drop",
                level: ct.level,
            });
        }
        Ok(ct.truncate(ct.level - levels))
    }

    fn rotate(&self, ct: &RnsCiphertext, k: i64, keys: &RnsEvaluationKeys) -> Result<RnsCiphertext> {
        Self::check_degree_one(ct)?;
        let k_norm = self.params.normalize_rotation(k);
        if k_norm == 0 {
            return Ok(ct.clone());
        }
        let key = keys
            .rotations
            .get(&k_norm)
            .ok_or(CkksError::MissingRotationKey(k))?;
        let g = self.galois_element(k_norm);
        let c1_auto = ct.c1.apply_automorphism(g, &self.ctx);
        let (ks0, ks1) = key.switch(&c1_auto, &self.switching);
        Ok(RnsCiphertext {
            c0: ct.c0.apply_automorphism(g, &self.ctx).add(&ks0, &self.ctx),
            c1: ks1,
            c2: None,
            level: ct.level,
            scale: ct.scale,
        })
    }

    /// Decomposes `c1` once and reuses the digits for every rotation.
    fn rotate_hoisted(
        &self,
        ct: &RnsCiphertext,
        ks: &[i64],
        keys: &RnsEvaluationKeys,
    ) -> Result<HashMap<i64, RnsCiphertext>> {
        Self::check_degree_one(ct)?;
        let mut out = HashMap::with_capacity(ks.len());
        let mut digits: Option<Vec<RnsPoly>> = None;
        for &k in ks {
            let k_norm = self.params.normalize_rotation(k);
            if k_norm == 0 {
                out.insert(k, ct.clone());
                continue;
            }
            let key = keys
                .rotations
                .get(&k_norm)
                .ok_or(CkksError::MissingRotationKey(k))?;
            let digits = digits.get_or_insert_with(|| SwitchingKey::decompose(&ct.c1, &self.switching));
            let g = self.galois_element(k_norm);
            out.insert(k, self.key_switch_rotate(ct, g, &digits[..], key));
        }
        Ok(out)
    }

    fn conjugate(&self, ct: &RnsCiphertext, keys: &RnsEvaluationKeys) -> Result<RnsCiphertext> {
        Self::check_degree_one(ct)?;
        let g = 2 * self.ctx.n - 1;
        let c1_auto = ct.c1.apply_automorphism(g, &self.ctx);
        let (ks0, ks1) = keys.conjugation.switch(&c1_auto, &self.switching);
        Ok(RnsCiphertext {
            c0: ct.c0.apply_automorphism(g, &self.ctx).add(&ks0, &self.ctx),
            c1: ks1,
            c2: None,
            level: ct.level,
            scale: ct.scale,
        })
    }

    fn ciphertext_to_bytes(&self, ct: &RnsCiphertext) -> Result<Vec<u8>> {
        Ok(bincode::serialize(ct)?)
    }

    fn ciphertext_from_bytes(&self, bytes: &[u8]) -> Result<RnsCiphertext> {
        let ct: RnsCiphertext = bincode::deserialize(bytes)?;
        let k = ct.level + 1;
        let well_formed = ct.level <= self.params.max_level()
            && [Some(&ct.c0), Some(&ct.c1), ct.c2.as_ref()]
                .into_iter()
                .flatten()
                .all(|p| {
                    p.num_primes() == k
                        && p.residues.iter().zip(self.ctx.moduli.iter()).all(|(r, &q)| {
                            r.len() == self.ctx.n && r.iter().all(|&v| (0..q).contains(&v))
                        })
                });
        if !well_formed {
            return Err(CkksError::Serialization("malformed ciphertext".into()));
        }
        Ok(ct)
    }
}

/// Short hex fingerprint of a public key, for logs.
pub fn key_fingerprint(pk: &RnsPublicKey) -> String {
    let mut hasher = Sha256::new();
    for r in &pk.b.residues[0] {
        hasher.update(r.to_le_bytes());
    }
    hex::encode(&hasher.finalize()[..8])
}
