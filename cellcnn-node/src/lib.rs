//! Federated CellCNN training over a tree of parties.
//!
//! Parties share one collectively generated CKKS key. Each iteration the
//! root broadcasts the encrypted weights down the tree, every party computes
//! an encrypted update on its own shard, internal nodes add their children's
//! updates to their own, and the root applies the sum.

pub mod config;
pub mod error;
pub mod keys;
pub mod local;
pub mod session;
pub mod transport;
pub mod wire;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use keys::{collective_setup, key_fingerprint};
pub use local::Federation;
pub use session::{Party, PartyState, TrainingReport};
pub use transport::{tree, DoneSignal, Endpoint};
pub use wire::{Frame, FrameError, GradientMsg, IterationMsg, MessageType};
