//! Slot packing via the canonical embedding.
//!
//! N/2 complex values are placed at Galois-aligned FFT positions together
//! with their conjugates, so the resulting polynomial has real coefficients
//! and X → X^5 rotates slots left by one.
//!
//! # Encoding pipeline
//!
//! 1. Place slot i at FFT position (5^i − 1)/2 and its conjugate at N − 1 − pos
//! 2. Inverse FFT → twisted coefficients
//! 3. Untwist by ψ^{-j}
//! 4. Scale and round
//!
//! Decoding runs the pipeline backwards.

use std::f64::consts::PI;

use num_complex::Complex64;

/// Galois generator: 5 has order N/2 in (Z/2N)*.
pub const GALOIS_GEN: usize = 5;

#[derive(Clone, Debug)]
pub struct SlotEncoder {
    n: usize,
    slot_to_fft: Vec<usize>,
    twist: Vec<Complex64>,
}

impl SlotEncoder {
    pub fn new(n: usize) -> Self {
        let slots = n / 2;
        let two_n = 2 * n;
        let mut slot_to_fft = Vec::with_capacity(slots);
        let mut root = 1usize;
        for _ in 0..slots {
            slot_to_fft.push((root - 1) / 2);
            root = root * GALOIS_GEN % two_n;
        }
        let psi_angle = PI / n as f64;
        let twist = (0..n)
            .map(|j| Complex64::from_polar(1.0, j as f64 * psi_angle))
            .collect();
        Self {
            n,
            slot_to_fft,
            twist,
        }
    }

    pub fn slots(&self) -> usize {
        self.n / 2
    }

    /// Encode up to N/2 complex values into scaled integer coefficients.
    /// Coefficients are returned as i128 because scales above 2^63 occur
    /// for intermediate constants.
    pub fn encode(&self, values: &[Complex64], scale: f64) -> Vec<i128> {
        let n = self.n;
        let mut z = vec![Complex64::new(0.0, 0.0); n];
        for (i, v) in values.iter().enumerate().take(self.slots()) {
            let pos = self.slot_to_fft[i];
            z[pos] = *v;
            z[n - 1 - pos] = v.conj();
        }
        ifft(&mut z);
        z.iter()
            .zip(self.twist.iter())
            .map(|(c, t)| ((*c * t.conj()).re * scale).round() as i128)
            .collect()
    }

    /// Decode centered coefficients at `scale`.
    pub fn decode(&self, coeffs: &[f64], scale: f64) -> Vec<Complex64> {
        let mut b: Vec<Complex64> = coeffs
            .iter()
            .zip(self.twist.iter())
            .map(|(&c, t)| *t * (c / scale))
            .collect();
        b.resize(self.n, Complex64::new(0.0, 0.0));
        fft(&mut b);
        self.slot_to_fft.iter().map(|&pos| b[pos]).collect()
    }
}

/// In-place radix-2 FFT: Z_k = Σ_j X_j · e^{2πijk/N}.
fn fft(a: &mut [Complex64]) {
    let n = a.len();
    if n <= 1 {
        return;
    }
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j ^= bit;
        if i < j {
            a.swap(i, j);
        }
    }
    let mut len = 2;
    while len <= n {
        let half = len / 2;
        let w_base = Complex64::from_polar(1.0, 2.0 * PI / len as f64);
        let mut start = 0;
        while start < n {
            let mut w = Complex64::new(1.0, 0.0);
            for k in 0..half {
                let u = a[start + k];
                let t = a[start + k + half] * w;
                a[start + k] = u + t;
                a[start + k + half] = u - t;
                w *= w_base;
            }
            start += len;
        }
        len <<= 1;
    }
}

fn ifft(a: &mut [Complex64]) {
    let inv_n = 1.0 / a.len() as f64;
    for x in a.iter_mut() {
        *x = x.conj();
    }
    fft(a);
    for x in a.iter_mut() {
        *x = x.conj() * inv_n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fft_ifft_roundtrip() {
        let mut data: Vec<Complex64> = (0..64)
            .map(|i| Complex64::new((i as f64 * 0.1).sin(), -(i as f64) * 0.5))
            .collect();
        let original = data.clone();
        fft(&mut data);
        ifft(&mut data);
        for (a, b) in data.iter().zip(original.iter()) {
            assert!((*a - *b).norm() < 1e-10);
        }
    }

    #[test]
    fn encode_decode_complex_slots() {
        let enc = SlotEncoder::new(64);
        let values: Vec<Complex64> = (0..32)
            .map(|i| Complex64::new(i as f64 * 0.25 - 3.0, 1.0 - i as f64 * 0.125))
            .collect();
        let scale = (1u64 << 30) as f64;
        let coeffs: Vec<f64> = enc.encode(&values, scale).into_iter().map(|c| c as f64).collect();
        let back = enc.decode(&coeffs, scale);
        for (i, (a, b)) in back.iter().zip(values.iter()).enumerate() {
            assert!((*a - *b).norm() < 1e-6, "slot {}: {} vs {}", i, a, b);
        }
    }

    #[test]
    fn galois_positions_are_distinct() {
        let enc = SlotEncoder::new(128);
        let mut seen = vec![false; 128];
        for &p in &enc.slot_to_fft {
            assert!(!seen[p] && !seen[127 - p]);
            seen[p] = true;
            seen[127 - p] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
