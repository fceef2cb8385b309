//! Dense complex matrix used for cleartext reference math and for carrying
//! weights and gradients on the wire.
//!
//! Wire format: `varint(rows) ‖ varint(cols) ‖ byte(real_flag) ‖ rows·cols ×
//! (f64 re ‖ f64 im)`, little-endian.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{CnnError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    /// Imaginary parts are known to be zero.
    pub real: bool,
    /// Row-major, `rows · cols` entries.
    pub values: Vec<Complex64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            real: true,
            values: vec![Complex64::new(0.0, 0.0); rows * cols],
        }
    }

    pub fn from_real(rows: usize, cols: usize, values: &[f64]) -> Result<Self> {
        if values.len() != rows * cols {
            return Err(CnnError::ShapeMismatch {
                op: "from_real",
                left: (rows, cols),
                right: (values.len(), 1),
            });
        }
        Ok(Self {
            rows,
            cols,
            real: true,
            values: values.iter().map(|&v| Complex64::new(v, 0.0)).collect(),
        })
    }

    pub fn from_complex(rows: usize, cols: usize, values: Vec<Complex64>) -> Result<Self> {
        if values.len() != rows * cols {
            return Err(CnnError::ShapeMismatch {
                op: "from_complex",
                left: (rows, cols),
                right: (values.len(), 1),
            });
        }
        let real = values.iter().all(|v| v.im == 0.0);
        Ok(Self {
            rows,
            cols,
            real,
            values,
        })
    }

    /// Build from nested rows; every row must have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map_or(0, |r| r.len());
        if let Some((i, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != cols) {
            return Err(CnnError::ShapeMismatch {
                op: "from_rows",
                left: (rows.len(), cols),
                right: (i, r.len()),
            });
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Self::from_real(rows.len(), cols, &flat)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, i: usize, j: usize) -> Complex64 {
        self.values[i * self.cols + j]
    }

    pub fn re(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.cols + j].re
    }

    pub fn set(&mut self, i: usize, j: usize, v: Complex64) {
        if v.im != 0.0 {
            self.real = false;
        }
        self.values[i * self.cols + j] = v;
    }

    pub fn row(&self, i: usize) -> &[Complex64] {
        &self.values[i * self.cols..(i + 1) * self.cols]
    }

    pub fn set_row(&mut self, i: usize, row: &[Complex64]) -> Result<()> {
        if row.len() != self.cols || i >= self.rows {
            return Err(CnnError::ShapeMismatch {
                op: "set_row",
                left: self.shape(),
                right: (i, row.len()),
            });
        }
        if row.iter().any(|v| v.im != 0.0) {
            self.real = false;
        }
        self.values[i * self.cols..(i + 1) * self.cols].copy_from_slice(row);
        Ok(())
    }

    /// Real parts in row-major order.
    pub fn real_values(&self) -> Vec<f64> {
        self.values.iter().map(|v| v.re).collect()
    }

    fn same_shape(&self, other: &Matrix, op: &'static str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(CnnError::ShapeMismatch {
                op,
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    fn zip_with(&self, other: &Matrix, op: &'static str, f: impl Fn(Complex64, Complex64) -> Complex64) -> Result<Matrix> {
        self.same_shape(other, op)?;
        Ok(Matrix {
            rows: self.rows,
            cols: self.cols,
            real: self.real && other.real,
            values: self
                .values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| f(*a, *b))
                .collect(),
        })
    }

    pub fn add(&self, other: &Matrix) -> Result<Matrix> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    pub fn sub(&self, other: &Matrix) -> Result<Matrix> {
        self.zip_with(other, "sub", |a, b| a - b)
    }

    /// Element-wise product.
    pub fn hadamard(&self, other: &Matrix) -> Result<Matrix> {
        self.zip_with(other, "hadamard", |a, b| a * b)
    }

    pub fn add_assign(&mut self, other: &Matrix) -> Result<()> {
        self.same_shape(other, "add_assign")?;
        for (a, b) in self.values.iter_mut().zip(other.values.iter()) {
            *a += *b;
        }
        self.real &= other.real;
        Ok(())
    }

    pub fn matmul(&self, other: &Matrix) -> Result<Matrix> {
        if self.cols != other.rows {
            return Err(CnnError::ShapeMismatch {
                op: "matmul",
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = Matrix::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a = self.values[i * self.cols + k];
                if a == Complex64::new(0.0, 0.0) {
                    continue;
                }
                for j in 0..other.cols {
                    out.values[i * other.cols + j] += a * other.values[k * other.cols + j];
                }
            }
        }
        out.real = self.real && other.real;
        Ok(out)
    }

    pub fn scale(&self, factor: f64) -> Matrix {
        self.map(|v| v * factor)
    }

    /// Apply `f` to every entry.
    pub fn map(&self, f: impl Fn(Complex64) -> Complex64) -> Matrix {
        let values: Vec<Complex64> = self.values.iter().map(|&v| f(v)).collect();
        let real = values.iter().all(|v| v.im == 0.0);
        Matrix {
            rows: self.rows,
            cols: self.cols,
            real,
            values,
        }
    }

    /// Apply a real function to the real parts.
    pub fn map_real(&self, f: impl Fn(f64) -> f64) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            real: true,
            values: self.values.iter().map(|v| Complex64::new(f(v.re), 0.0)).collect(),
        }
    }

    /// `rows × 1` vector of row sums.
    pub fn sum_rows(&self) -> Matrix {
        let mut out = Matrix::zeros(self.rows, 1);
        for i in 0..self.rows {
            out.values[i] = self.row(i).iter().sum();
        }
        out.real = self.real;
        out
    }

    /// `1 × cols` vector of column sums.
    pub fn sum_columns(&self) -> Matrix {
        let mut out = Matrix::zeros(1, self.cols);
        for i in 0..self.rows {
            for (acc, v) in out.values.iter_mut().zip(self.row(i)) {
                *acc += *v;
            }
        }
        out.real = self.real;
        out
    }

    pub fn transpose(&self) -> Matrix {
        let mut out = Matrix::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                out.values[j * self.rows + i] = self.values[i * self.cols + j];
            }
        }
        out.real = self.real;
        out
    }

    /// Cyclic shift of the row order: row `i` of the result is row `i + k`.
    pub fn rotate_rows(&self, k: isize) -> Matrix {
        self.remap(|i, j| ((i as isize + k).rem_euclid(self.rows as isize) as usize, j))
    }

    /// Cyclic shift of the column order: column `j` of the result is column `j + k`.
    pub fn rotate_cols(&self, k: isize) -> Matrix {
        self.remap(|i, j| (i, (j as isize + k).rem_euclid(self.cols as isize) as usize))
    }

    /// Row `i` is rotated left by `i`.
    pub fn permute_rows(&self) -> Matrix {
        self.remap(|i, j| (i, (i + j) % self.cols))
    }

    /// Column `j` is rotated up by `j`.
    pub fn permute_cols(&self) -> Matrix {
        self.remap(|i, j| ((i + j) % self.rows, j))
    }

    fn remap(&self, source: impl Fn(usize, usize) -> (usize, usize)) -> Matrix {
        let mut out = self.clone();
        for i in 0..self.rows {
            for j in 0..self.cols {
                let (si, sj) = source(i, j);
                out.values[i * self.cols + j] = self.values[si * self.cols + sj];
            }
        }
        out
    }

    /// Largest absolute difference between matching entries.
    pub fn max_abs_diff(&self, other: &Matrix) -> Result<f64> {
        self.same_shape(other, "max_abs_diff")?;
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .fold(0.0, |m, (a, b)| m.max((a - b).norm())))
    }

    // ── Wire format ─────────────────────────────────────────────────────

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(11 + 16 * self.values.len());
        put_uvarint(&mut buf, self.rows as u64);
        put_uvarint(&mut buf, self.cols as u64);
        buf.push(self.real as u8);
        for v in &self.values {
            buf.extend_from_slice(&v.re.to_le_bytes());
            buf.extend_from_slice(&v.im.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Matrix> {
        let mut pos = 0;
        let rows = get_uvarint(data, &mut pos)? as usize;
        let cols = get_uvarint(data, &mut pos)? as usize;
        let flag = *data
            .get(pos)
            .ok_or_else(|| CnnError::Serialization("matrix truncated before real flag".into()))?;
        pos += 1;
        if flag > 1 {
            return Err(CnnError::Serialization(format!("bad real flag {}", flag)));
        }
        let count = rows
            .checked_mul(cols)
            .filter(|n| n.checked_mul(16).is_some_and(|b| b == data.len() - pos))
            .ok_or_else(|| {
                CnnError::Serialization(format!(
                    "{}x{} matrix does not match {} payload bytes",
                    rows,
                    cols,
                    data.len() - pos
                ))
            })?;
        let values = data[pos..]
            .chunks_exact(16)
            .take(count)
            .map(|c| {
                let mut re = [0u8; 8];
                let mut im = [0u8; 8];
                re.copy_from_slice(&c[..8]);
                im.copy_from_slice(&c[8..]);
                Complex64::new(f64::from_le_bytes(re), f64::from_le_bytes(im))
            })
            .collect();
        Ok(Matrix {
            rows,
            cols,
            real: flag == 1,
            values,
        })
    }
}

/// Unsigned LEB128.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub fn get_uvarint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| CnnError::Serialization("truncated varint".into()))?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CnnError::Serialization("varint overflows u64".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn test_rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn random(rows: usize, cols: usize, rng: &mut StdRng) -> Matrix {
        let v: Vec<f64> = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Matrix::from_real(rows, cols, &v).unwrap()
    }

    #[test]
    fn shape_checks() {
        let a = Matrix::zeros(2, 3);
        let b = Matrix::zeros(2, 2);
        assert!(matches!(a.add(&b), Err(CnnError::ShapeMismatch { op: "add", .. })));
        assert!(matches!(a.matmul(&a), Err(CnnError::ShapeMismatch { op: "matmul", .. })));
        assert!(b.matmul(&a).is_ok());
        assert!(Matrix::from_real(2, 2, &[1.0]).is_err());
    }

    #[test]
    fn ragged_rows_rejected() {
        // same total length as a 2×2 matrix
        let ragged = Matrix::from_rows(&[vec![1.0], vec![2.0, 3.0, 4.0]]);
        assert!(matches!(
            ragged,
            Err(CnnError::ShapeMismatch { op: "from_rows", left: (2, 1), right: (1, 3) })
        ));
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(m.re(1, 0), 3.0);
    }

    #[test]
    fn transpose_is_involution() {
        let mut rng = test_rng();
        let m = random(3, 5, &mut rng);
        assert_eq!(m.transpose().transpose(), m);
        assert_eq!(m.transpose().re(4, 2), m.re(2, 4));
    }

    #[test]
    fn matmul_associates() {
        let mut rng = test_rng();
        let a = random(3, 4, &mut rng);
        let b = random(4, 2, &mut rng);
        let c = random(2, 5, &mut rng);
        let left = a.matmul(&b).unwrap().matmul(&c).unwrap();
        let right = a.matmul(&b.matmul(&c).unwrap()).unwrap();
        assert!(left.max_abs_diff(&right).unwrap() < 1e-12);
    }

    #[test]
    fn sums_and_rotations() {
        let m = Matrix::from_rows(&[vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]]).unwrap();
        assert_eq!(m.sum_rows().real_values(), vec![3.0, 12.0]);
        assert_eq!(m.sum_columns().real_values(), vec![3.0, 5.0, 7.0]);
        assert_eq!(m.rotate_rows(1).real_values(), vec![3.0, 4.0, 5.0, 0.0, 1.0, 2.0]);
        assert_eq!(m.rotate_cols(-1).real_values(), vec![2.0, 0.0, 1.0, 5.0, 3.0, 4.0]);
        assert_eq!(m.permute_rows().real_values(), vec![0.0, 1.0, 2.0, 4.0, 5.0, 3.0]);
        assert_eq!(m.permute_cols().real_values(), vec![0.0, 4.0, 2.0, 3.0, 1.0, 5.0]);
    }

    #[test]
    fn set_row_tracks_realness() {
        let mut m = Matrix::zeros(2, 2);
        m.set_row(1, &[Complex64::new(1.0, 0.0), Complex64::new(0.0, 2.0)]).unwrap();
        assert!(!m.real);
        assert!(m.set_row(2, &[Complex64::new(0.0, 0.0); 2]).is_err());
    }

    #[test]
    fn wire_roundtrip_is_bitwise() {
        let mut rng = test_rng();
        let mut m = random(130, 3, &mut rng);
        m.set(0, 0, Complex64::new(-0.0, f64::MIN_POSITIVE));
        let bytes = m.to_bytes();
        // 130 needs a two-byte varint
        assert_eq!(&bytes[..4], &[0x82, 0x01, 0x03, 0x00]);
        let back = Matrix::from_bytes(&bytes).unwrap();
        assert_eq!(back.shape(), m.shape());
        assert_eq!(back.real, m.real);
        for (a, b) in back.values.iter().zip(m.values.iter()) {
            assert_eq!(a.re.to_bits(), b.re.to_bits());
            assert_eq!(a.im.to_bits(), b.im.to_bits());
        }
    }

    #[test]
    fn malformed_bytes_rejected() {
        let m = Matrix::from_real(2, 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let bytes = m.to_bytes();
        assert!(Matrix::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(Matrix::from_bytes(&[]).is_err());
        let mut bad_flag = bytes.clone();
        bad_flag[2] = 7;
        assert!(Matrix::from_bytes(&bad_flag).is_err());
    }
}
