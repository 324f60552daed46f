//! Fusion aggregator — collapses the discarded tokens into one.
//!
//! The fused token is the attention-weighted sum of the discarded tokens.
//! Weights are the raw relevance scores, not renormalized, so the token's
//! magnitude tracks the attention mass of everything that was dropped.

use candle_core::Tensor;
use tokenfold_core::{Error, Result};

/// Gather rows of `tokens [B, M, C]` at `indices [B, K]` → `[B, K, C]`.
pub fn gather_tokens(tokens: &Tensor, indices: &Tensor) -> Result<Tensor> {
    let (batch, _, channels) = tokens.dims3()?;
    let (index_batch, k) = indices.dims2()?;
    if index_batch != batch {
        return Err(Error::shape(
            "token gather",
            format!("[{batch}, K]"),
            indices.dims(),
        ));
    }
    let index = indices
        .unsqueeze(2)?
        .broadcast_as((batch, k, channels))?
        .contiguous()?;
    Ok(tokens.contiguous()?.gather(&index, 1)?)
}

/// Fused token `[B, 1, C]` = Σ over `discarded` of `token_i * score_i`.
///
/// `non_prefix` is `[B, M, C]`, `scores` is `[B, M]`, `discarded` is a
/// `[B, D]` u32 index tensor into the candidate range.
pub fn fuse_discarded(non_prefix: &Tensor, scores: &Tensor, discarded: &Tensor) -> Result<Tensor> {
    let (batch, candidates, channels) = non_prefix.dims3()?;
    if scores.dims() != [batch, candidates] {
        return Err(Error::shape(
            "fusion scores",
            format!("[{batch}, {candidates}]"),
            scores.dims(),
        ));
    }

    let (_, dropped) = discarded.dims2()?;
    if dropped == 0 {
        return Ok(Tensor::zeros(
            (batch, 1, channels),
            non_prefix.dtype(),
            non_prefix.device(),
        )?);
    }

    let tokens = gather_tokens(non_prefix, discarded)?;
    let weights = scores
        .contiguous()?
        .gather(&discarded.contiguous()?, 1)?
        .to_dtype(tokens.dtype())?
        .unsqueeze(2)?;
    Ok(tokens.broadcast_mul(&weights)?.sum_keepdim(1)?)
}
