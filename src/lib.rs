//! CellCNN training and inference under CKKS encryption.
//!
//! One ciphertext holds a whole mini-batch: the forward pass runs
//! convolution, pooling and the dense layer on packed slots, a repack bundles
//! everything the backward pass needs, a refresh restores the level and
//! re-lays the slots, and the backward pass produces both weight updates in
//! the same layouts the weights use.

pub mod activation;
pub mod backward;
pub mod config;
pub mod context;
pub mod dataset;
pub mod debug;
pub mod encoding;
pub mod error;
pub mod forward;
pub mod layout;
pub mod matrix;
pub mod model;
pub mod predict;
pub mod refresh;
pub mod rng;

pub use activation::{Activation, ActivationPair};
pub use backward::{EncryptedGradient, PlainGradient};
pub use config::CnnConfig;
pub use context::{CryptoContext, LevelPlan};
pub use dataset::{synthetic_dataset, Batch, Sample};
pub use debug::PrecisionStats;
pub use error::{CnnError, ConfigError, ErrorKind, Result};
pub use layout::Layout;
pub use matrix::Matrix;
pub use model::CellCnn;
pub use predict::{classify, error_rate, EncryptedQuery};
pub use refresh::{CollectiveRefresh, Refresher};
