//! Lattice backend: RNS polynomials, slot encoding, key switching and the
//! [`RnsCkks`] scheme built from them.

pub mod encoding;
pub mod keys;
pub mod ntt;
pub mod poly;
pub mod scheme;

pub use scheme::{
    key_fingerprint, RnsCiphertext, RnsCkks, RnsEvaluationKeys, RnsPlaintext, RnsPublicKey,
    RnsSecretKey,
};
