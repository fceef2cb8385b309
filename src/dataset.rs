//! Labelled samples and mini-batches.

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::config::CnnConfig;
use crate::error::{CnnError, Result};
use crate::matrix::Matrix;

/// One sample: `cells × features` measurements and a one-hot `1 × classes`
/// label.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub x: Matrix,
    pub y: Matrix,
}

impl Sample {
    /// Mean over cells, `1 × features`.
    pub fn prepool(&self) -> Matrix {
        self.x.sum_columns().scale(1.0 / self.x.rows as f64)
    }

    /// Index of the hot class.
    pub fn label(&self) -> usize {
        argmax(self.y.row(0).iter().map(|v| v.re))
    }
}

/// Pooled inputs and labels of one mini-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `batch × features`.
    pub x: Matrix,
    /// `batch × classes`.
    pub y: Matrix,
}

impl Batch {
    pub fn from_samples(samples: &[&Sample]) -> Result<Self> {
        let first = samples.first().ok_or(CnnError::MissingState("empty batch"))?;
        let mut x = Matrix::zeros(samples.len(), first.x.cols);
        let mut y = Matrix::zeros(samples.len(), first.y.cols);
        for (i, s) in samples.iter().enumerate() {
            x.set_row(i, s.prepool().row(0))?;
            y.set_row(i, s.y.row(0))?;
        }
        Ok(Self { x, y })
    }

    /// Gather `indices` from `data`.
    pub fn gather(data: &[Sample], indices: &[usize]) -> Result<Self> {
        let picked = indices
            .iter()
            .map(|&i| data.get(i).ok_or(CnnError::MissingState("sample index")))
            .collect::<Result<Vec<_>>>()?;
        Self::from_samples(&picked)
    }
}

pub fn one_hot(class: usize, classes: usize) -> Matrix {
    let mut y = Matrix::zeros(1, classes);
    y.values[class].re = 1.0;
    y
}

pub(crate) fn argmax(values: impl Iterator<Item = f64>) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, v) in values.enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

/// Synthetic samples: every marker is Gaussian around zero except marker
/// `class mod features`, which is shifted up by one, so the class is
/// readable from the pooled mean.
pub fn synthetic_dataset<R: Rng + ?Sized>(config: &CnnConfig, rng: &mut R) -> Vec<Sample> {
    (0..config.samples)
        .map(|i| {
            let class = i % config.classes;
            let marker = class % config.features;
            let mut x = Matrix::zeros(config.cells, config.features);
            for cell in 0..config.cells {
                for f in 0..config.features {
                    let shift = if f == marker { 1.0 } else { 0.0 };
                    let z: f64 = StandardNormal.sample(rng);
                    x.values[cell * config.features + f].re = shift + 0.3 * z;
                }
            }
            Sample {
                x,
                y: one_hot(class, config.classes),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn prepool_averages_cells() {
        let s = Sample {
            x: Matrix::from_rows(&[vec![0.0, 1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0, 7.0]]).unwrap(),
            y: one_hot(0, 2),
        };
        assert_eq!(s.prepool().real_values(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(s.label(), 0);
    }

    #[test]
    fn batch_stacks_pooled_rows() {
        let config = CnnConfig {
            cells: 10,
            features: 4,
            samples: 6,
            ..CnnConfig::default()
        };
        let data = synthetic_dataset(&config, &mut test_rng());
        assert_eq!(data.len(), 6);
        assert_eq!(data[3].label(), 1);

        let batch = Batch::gather(&data, &[1, 4]).unwrap();
        assert_eq!(batch.x.shape(), (2, 4));
        assert_eq!(batch.y.real_values(), vec![0.0, 1.0, 1.0, 0.0]);
        assert_eq!(batch.x.row(0), data[1].prepool().row(0));
        assert!(Batch::gather(&data, &[9]).is_err());
    }
}
