//! Top-k selector — partitions candidate tokens into kept and discarded.
//!
//! Selection runs on the host over the `[B, M]` score matrix: per row, a
//! stable descending sort picks the `left` best tokens, and the discarded set
//! is the ascending complement computed from an explicit presence mask.

use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use std::cmp::Ordering;
use tokenfold_core::{Error, Result};

pub use tokenfold_core::keep_count;

/// Kept/discarded partition of the candidate (non-prefix) indices, per batch row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSelection {
    kept: Vec<Vec<u32>>,
    discarded: Vec<Vec<u32>>,
    candidates: usize,
}

impl TokenSelection {
    /// Kept indices per row, by descending score.
    pub fn kept(&self) -> &[Vec<u32>] {
        &self.kept
    }

    /// Discarded indices per row, ascending.
    pub fn discarded(&self) -> &[Vec<u32>] {
        &self.discarded
    }

    /// Number of candidate tokens the partition covers.
    pub fn candidates(&self) -> usize {
        self.candidates
    }

    /// Batch rows covered by the selection.
    pub fn batch(&self) -> usize {
        self.kept.len()
    }

    /// Tokens kept per row.
    pub fn kept_len(&self) -> usize {
        self.kept.first().map_or(0, Vec::len)
    }

    /// Tokens discarded per row.
    pub fn discarded_len(&self) -> usize {
        self.discarded.first().map_or(0, Vec::len)
    }

    /// Kept indices as a `[B, left]` u32 tensor.
    pub fn kept_tensor(&self, device: &Device) -> Result<Tensor> {
        index_tensor(&self.kept, device)
    }

    /// Discarded indices as a `[B, M - left]` u32 tensor.
    pub fn discarded_tensor(&self, device: &Device) -> Result<Tensor> {
        index_tensor(&self.discarded, device)
    }
}

/// Indices of the `k` largest scores, by descending score.
///
/// The sort is stable: equal scores keep their original relative order.
/// NaN compares equal to everything.
pub fn top_k(scores: &[f32], k: usize) -> Vec<u32> {
    let mut order: Vec<u32> = (0..scores.len() as u32).collect();
    order.sort_by(|&a, &b| {
        scores[b as usize]
            .partial_cmp(&scores[a as usize])
            .unwrap_or(Ordering::Equal)
    });
    order.truncate(k);
    order
}

/// Ascending complement of `kept` within `[0, len)`.
pub fn complement(kept: &[u32], len: usize) -> Result<Vec<u32>> {
    let mut present = vec![false; len];
    for &idx in kept {
        let slot = present.get_mut(idx as usize).ok_or_else(|| {
            Error::shape("kept index", format!("< {len}"), idx)
        })?;
        *slot = true;
    }
    Ok(present
        .iter()
        .enumerate()
        .filter(|(_, kept)| !**kept)
        .map(|(idx, _)| idx as u32)
        .collect())
}

/// Partition `scores [B, M]` into the top `left` tokens and the rest.
pub fn select_tokens(scores: &Tensor, left: usize) -> Result<TokenSelection> {
    let (_, candidates) = scores.dims2()?;
    if left == 0 || left > candidates {
        return Err(Error::invalid(format!(
            "cannot keep {left} of {candidates} candidate tokens"
        )));
    }

    let rows = scores.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let mut kept = Vec::with_capacity(rows.len());
    let mut discarded = Vec::with_capacity(rows.len());
    for row in &rows {
        let top = top_k(row, left);
        discarded.push(complement(&top, candidates)?);
        kept.push(top);
    }

    Ok(TokenSelection {
        kept,
        discarded,
        candidates,
    })
}

fn index_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map_or(0, Vec::len);
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}
