//! # TokenFold Reduce
//!
//! Adaptive token reduction for sequence-model trunks. At scheduled stages
//! the summary token's attention ranks every candidate token; the best are
//! kept, the rest are fused into a single attention-weighted token.
//!
//! - [`scorer`]: relevance scores from attention weights
//! - [`select`]: stable top-k and the ascending complement
//! - [`fuse`]: weighted fusion of discarded tokens
//! - [`reassemble`]: `[prefix, kept…, fused]`
//! - [`reduction`]: one full reduction step
//! - [`cache`]: per-pass cross-stage cache
//! - [`controller`]: [`ReductionEngine`], which drives a whole trunk

pub mod cache;
pub mod controller;
pub mod fuse;
pub mod reassemble;
pub mod reduction;
pub mod scorer;
pub mod select;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use cache::CrossStageCache;
pub use controller::{ForwardOutput, ReductionEngine, StagePlan, StageReport};
pub use fuse::{fuse_discarded, gather_tokens};
pub use reassemble::{reassemble, selection_trace, FUSED_SLOT};
pub use reduction::{reduce, Reduction};
pub use scorer::relevance_scores;
pub use select::{complement, keep_count, select_tokens, top_k, TokenSelection};
