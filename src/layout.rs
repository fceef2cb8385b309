//! Slot layouts of the packed ciphertexts.
//!
//! With `D = filters·classes`, `BD = batch·D` and
//! `K = batch·filters + (features/2 − 1)·2·filters + filters`:
//!
//! | repacked (before refresh) | offset |
//! |---|---|
//! | U, sample `b` class `c` at `b·filters + c·batch·filters` | `0` |
//! | P replicated over classes | `BD` |
//! | W in dense-weight form | `2·BD` |
//! | ΔW_prev | `3·BD` |
//! | ΔC_prev | `4·BD` |
//!
//! | training (after refresh) | offset |
//! |---|---|
//! | U per sample, each class repeated `filters` times | `0` |
//! | U class-major over the conv footprint | `BD` |
//! | P · lr / n_parties, per sample, tiled over classes | `BD + classes·K` |
//! | W class-major over the conv footprint | `2·BD + classes·K` |
//! | ΔW_prev · momentum | `2·BD + 2·classes·K` |
//! | ΔC_prev · momentum | `3·BD + 2·classes·K` |

use std::collections::BTreeSet;

use cellcnn_ckks::{rotations_for_inner_sum, rotations_for_replicate};

use crate::config::CnnConfig;

pub fn dense_matrix_size(filters: usize, classes: usize) -> usize {
    filters * classes
}

/// The trailing `filters` slots absorb the shifted half of the complex trick.
pub fn conv_matrix_size(cells: usize, features: usize, filters: usize) -> usize {
    cells * filters + (features / 2 - 1) * 2 * filters + filters
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub batch: usize,
    pub features: usize,
    pub filters: usize,
    pub classes: usize,
    /// Dense block, `filters · classes`.
    pub d: usize,
    /// Convolution block.
    pub k: usize,
}

impl Layout {
    pub fn new(config: &CnnConfig) -> Self {
        Self::from_dims(config.batch_size, config.features, config.filters, config.classes)
    }

    pub fn from_dims(batch: usize, features: usize, filters: usize, classes: usize) -> Self {
        Self {
            batch,
            features,
            filters,
            classes,
            d: dense_matrix_size(filters, classes),
            k: conv_matrix_size(batch, features, filters),
        }
    }

    /// `batch · D`.
    pub fn bd(&self) -> usize {
        self.batch * self.d
    }

    /// `batch · filters`, the valid width of the convolution output.
    pub fn bf(&self) -> usize {
        self.batch * self.filters
    }

    /// `classes · K`.
    pub fn ck(&self) -> usize {
        self.classes * self.k
    }

    /// Convolution weights `features × filters` flattened.
    pub fn conv_weights(&self) -> usize {
        self.features * self.filters
    }

    // ── Repacked layout ─────────────────────────────────────────────────

    pub fn repack_u(&self) -> usize {
        0
    }
    pub fn repack_p(&self) -> usize {
        self.bd()
    }
    pub fn repack_w(&self) -> usize {
        2 * self.bd()
    }
    pub fn repack_dw_prev(&self) -> usize {
        3 * self.bd()
    }
    pub fn repack_dc_prev(&self) -> usize {
        4 * self.bd()
    }

    /// ΔC_prev occupies whole tiles of the convolution weights, which is at
    /// least `K`.
    pub fn repack_slots(&self) -> usize {
        4 * self.bd() + self.conv_tiles() * self.conv_weights()
    }

    /// Slot of `U[b, c]` in the dense-layer output.
    pub fn u_slot(&self, b: usize, c: usize) -> usize {
        b * self.filters + c * self.bf()
    }

    // ── Training layout ─────────────────────────────────────────────────

    pub fn train_u(&self) -> usize {
        0
    }
    pub fn train_u_classes(&self) -> usize {
        self.bd()
    }
    pub fn train_p(&self) -> usize {
        self.bd() + self.ck()
    }
    pub fn train_w(&self) -> usize {
        2 * self.bd() + self.ck()
    }
    pub fn train_dw_prev(&self) -> usize {
        2 * self.bd() + 2 * self.ck()
    }
    pub fn train_dc_prev(&self) -> usize {
        3 * self.bd() + 2 * self.ck()
    }

    pub fn training_slots(&self) -> usize {
        self.train_dc_prev() + self.k
    }

    /// The dense-layer inner sum wraps `filters − 1` slots of garbage around
    /// the top of the vector, so the repacked blocks keep clear of it.
    pub fn used_slots(&self) -> usize {
        (self.repack_slots() + self.filters).max(self.training_slots())
    }

    /// Replication count that covers `K` slots with copies of the
    /// convolution weights.
    pub fn conv_tiles(&self) -> usize {
        self.k.div_ceil(self.conv_weights())
    }

    /// Every rotation the forward, repack, backward, update and prediction
    /// circuits perform.
    pub fn rotation_indices(&self) -> Vec<i64> {
        let f = self.filters as i64;
        let bd = self.bd() as i64;
        let ck = self.ck() as i64;
        let mut set = BTreeSet::new();

        // complex trick and the diagonal mul-sum strides
        set.insert(f);
        for k in 1..self.features / 2 {
            set.insert(2 * f * k as i64);
        }
        for k in 1..self.batch / 2 {
            set.insert(2 * f * k as i64);
        }

        // forward
        set.extend(rotations_for_replicate(self.bf() as i64, self.classes));
        set.extend(rotations_for_inner_sum(1, self.filters));

        // repack
        for m in 1..=4 {
            set.insert(-m * bd);
        }

        // backward
        set.insert(bd + ck);
        set.insert(bd);
        set.extend(rotations_for_inner_sum(self.d as i64, self.batch));
        set.extend(rotations_for_inner_sum(self.k as i64, self.classes));
        set.extend(rotations_for_replicate(self.conv_weights() as i64, self.conv_tiles()));
        for c in 1..self.classes {
            set.insert(-((c * (self.batch - 1) * self.filters) as i64));
        }
        set.extend(rotations_for_replicate(f, self.batch));

        // previous updates
        set.insert(2 * bd + 2 * ck);
        set.insert(3 * bd + 2 * ck);

        set.remove(&0);
        set.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_sizes() {
        assert_eq!(dense_matrix_size(8, 2), 16);
        assert_eq!(conv_matrix_size(16, 38, 8), 16 * 8 + 18 * 16 + 8);
        for (cells, features, filters) in [(2, 4, 2), (10, 6, 4), (200, 38, 8)] {
            assert_eq!(
                conv_matrix_size(cells, features, filters),
                cells * filters + (features / 2 - 1) * 2 * filters + filters
            );
        }
    }

    #[test]
    fn tiny_layout_offsets() {
        let l = Layout::from_dims(2, 4, 2, 2);
        assert_eq!((l.d, l.k, l.bd()), (4, 10, 8));
        assert_eq!(l.repack_slots(), 48);
        assert_eq!(l.train_p(), 28);
        assert_eq!(l.train_w(), 36);
        assert_eq!(l.train_dw_prev(), 56);
        assert_eq!(l.train_dc_prev(), 64);
        assert_eq!(l.training_slots(), 74);
        assert_eq!(l.used_slots(), 74);
        assert_eq!(l.u_slot(1, 1), 6);
        assert_eq!(l.conv_tiles(), 2);
    }

    #[test]
    fn default_layout_fits_ring() {
        let l = Layout::new(&CnnConfig::default());
        assert_eq!(l.k, 424);
        assert!(l.used_slots() <= 1 << 13);
    }

    #[test]
    fn rotation_set_covers_named_offsets() {
        let l = Layout::from_dims(2, 4, 2, 2);
        let rot = l.rotation_indices();
        for needed in [2, 4, -8, -16, -24, -32, 28, 8, 56, 64, -2] {
            assert!(rot.contains(&needed), "missing rotation {}", needed);
        }
        assert!(!rot.contains(&0));
        let mut sorted = rot.clone();
        sorted.dedup();
        assert_eq!(sorted, rot);
    }
}
