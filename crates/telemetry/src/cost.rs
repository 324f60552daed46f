//! Analytical cost model for a transformer trunk.
//!
//! Counts multiply-accumulates per image. A stage's attention half runs on
//! the sequence entering it; its MLP half runs on the sequence left after
//! reduction, which is where token reduction saves compute.

use serde::{Deserialize, Serialize};

/// Per-image MAC estimator for one trunk width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Channel width `C`.
    pub embed_dim: usize,
    /// MLP hidden width over `C`.
    pub mlp_ratio: f64,
}

impl CostModel {
    pub fn new(embed_dim: usize, mlp_ratio: f64) -> Self {
        Self {
            embed_dim,
            mlp_ratio,
        }
    }

    fn hidden(&self) -> u64 {
        (self.embed_dim as f64 * self.mlp_ratio) as u64
    }

    /// Attention half over `len` tokens: `4·N·C² + 2·N²·C`.
    pub fn attention_macs(&self, len: usize) -> u64 {
        let (n, c) = (len as u64, self.embed_dim as u64);
        4 * n * c * c + 2 * n * n * c
    }

    /// MLP half over `len` tokens: `2·N·C·hidden`.
    pub fn mlp_macs(&self, len: usize) -> u64 {
        2 * len as u64 * self.embed_dim as u64 * self.hidden()
    }

    /// One stage: attention on `input_len`, MLP on `reduced_len`.
    pub fn stage_macs(&self, input_len: usize, reduced_len: usize) -> u64 {
        self.attention_macs(input_len) + self.mlp_macs(reduced_len)
    }

    /// A stage that keeps every token.
    pub fn dense_stage_macs(&self, len: usize) -> u64 {
        self.stage_macs(len, len)
    }
}

/// MACs as GMACs, for display.
pub fn gmacs(macs: u64) -> f64 {
    macs as f64 / 1e9
}
