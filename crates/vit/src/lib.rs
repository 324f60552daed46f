//! # TokenFold ViT
//!
//! A Candle vision transformer whose trunk is driven by
//! [`tokenfold_reduce::ReductionEngine`]. Each [`Block`] splits into the
//! attention half, which yields the weights used to rank tokens, and the
//! MLP half, which runs on the reduced sequence.

pub mod attention;
pub mod block;
pub mod embed;
pub mod heads;
pub mod layers;
pub mod model;

pub use block::Block;
pub use heads::{IfaHead, LatentPool};
pub use model::{TokenFoldVit, VitOutput};
