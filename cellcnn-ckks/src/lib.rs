//! Leveled CKKS arithmetic for the CellCNN engine.
//!
//! Two backends implement [`CkksScheme`]:
//!
//! - [`RnsCkks`], a lattice implementation over an RNS chain of ~36-bit NTT
//!   primes for rings up to N = 4096;
//! - [`SimulatedCkks`], which tracks slot values in the clear with the same
//!   level, scale and key bookkeeping, for circuits at production layout
//!   sizes.
//!
//! [`Evaluator`] builds inner sums, replication, low-degree polynomials and
//! scale alignment on top of either.

pub mod error;
pub mod evaluator;
pub mod params;
pub mod rns;
pub mod rotation;
pub mod scheme;
pub mod simulated;

pub use error::{CkksError, Result};
pub use evaluator::Evaluator;
pub use params::{scales_match, CkksParameters, DEFAULT_SCALE, SCALE_TOLERANCE};
pub use rns::RnsCkks;
pub use rotation::{rotations_for_inner_sum, rotations_for_replicate};
pub use scheme::{CkksScheme, Leveled};
pub use simulated::SimulatedCkks;

pub use num_complex::Complex64;
