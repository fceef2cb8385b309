//! Rotation plans for log-time inner sums and replication.
//!
//! The evaluator and the key-set builder both walk the same plan, so the
//! rotation keys generated for a layout are exactly the ones the algorithms
//! ask for.

use std::collections::BTreeSet;

/// One step of the inner-sum fold, in units of the batch stride.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FoldStep {
    /// `out += rotate(acc, offset)` (no rotation when `offset == 0`).
    Accumulate { offset: usize },
    /// `acc += rotate(acc, shift)`, doubling the window `acc` covers.
    Double { shift: usize },
}

/// Plan for `out[s] = Σ_{t<n} ct[s + t·batch]` using the binary expansion
/// of `n`. Uses at most `2·⌊log2 n⌋` rotations.
pub fn fold_plan(n: usize) -> Vec<FoldStep> {
    let mut steps = Vec::new();
    if n <= 1 {
        return steps;
    }
    let mut offset = 0usize;
    let mut i = 0u32;
    while (n >> i) > 0 {
        if (n >> i) & 1 == 1 {
            steps.push(FoldStep::Accumulate { offset });
            offset += 1 << i;
        }
        if (n >> (i + 1)) > 0 {
            steps.push(FoldStep::Double { shift: 1 << i });
        }
        i += 1;
    }
    steps
}

/// Rotation amounts used by `inner_sum(ct, batch, n)`.
pub fn rotations_for_inner_sum(batch: i64, n: usize) -> Vec<i64> {
    let mut set = BTreeSet::new();
    for step in fold_plan(n) {
        let units = match step {
            FoldStep::Accumulate { offset } => offset,
            FoldStep::Double { shift } => shift,
        };
        if units != 0 {
            set.insert(units as i64 * batch);
        }
    }
    set.into_iter().collect()
}

/// Rotation amounts used by `replicate(ct, batch, n)`.
pub fn rotations_for_replicate(batch: i64, n: usize) -> Vec<i64> {
    rotations_for_inner_sum(-batch, n)
}
