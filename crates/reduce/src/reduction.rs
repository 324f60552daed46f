//! One reduction step: score, select, fuse, reassemble.

use crate::fuse::{fuse_discarded, gather_tokens};
use crate::reassemble::{reassemble, selection_trace};
use crate::scorer::relevance_scores;
use crate::select::{select_tokens, TokenSelection};
use candle_core::Tensor;
use tokenfold_core::{keep_count, validate_keep_rate, Result, FULL_KEEP};

/// Result of [`reduce`].
#[derive(Debug, Clone)]
pub struct Reduction {
    /// `[B, N', C]` sequence for the rest of the stage.
    pub tokens: Tensor,
    /// `N'`: `num_prefix + left + 1` when the reduction fired, `N` otherwise.
    pub len: usize,
    /// Kept/discarded partition, present only when the reduction fired.
    pub selection: Option<TokenSelection>,
}

impl Reduction {
    fn passthrough(tokens: &Tensor, len: usize) -> Self {
        Self {
            tokens: tokens.clone(),
            len,
            selection: None,
        }
    }

    /// Whether tokens were actually dropped and fused.
    pub fn fired(&self) -> bool {
        self.selection.is_some()
    }

    /// Kept indices with the fused-slot sentinel, per row.
    pub fn kept_trace(&self) -> Option<Vec<Vec<i64>>> {
        self.selection.as_ref().map(selection_trace)
    }
}

/// Reduce `tokens [B, N, C]` using the stage's attention weights.
///
/// With `keep_rate == 1.0` the sequence passes through untouched and the
/// attention is never read. Otherwise `left = ceil(keep_rate * (N - P))`
/// candidates survive, in descending relevance order, followed by one token
/// fusing the rest. When `left` covers every candidate nothing is fused.
pub fn reduce(
    tokens: &Tensor,
    attention: &Tensor,
    keep_rate: f64,
    num_prefix: usize,
) -> Result<Reduction> {
    validate_keep_rate(keep_rate)?;
    let (_, len, _) = tokens.dims3()?;
    if keep_rate >= FULL_KEEP {
        return Ok(Reduction::passthrough(tokens, len));
    }

    let candidates = len.saturating_sub(num_prefix);
    let left = keep_count(keep_rate, candidates)?;
    if left == candidates && num_prefix > 0 {
        return Ok(Reduction::passthrough(tokens, len));
    }

    let scores = relevance_scores(tokens, attention, num_prefix)?;
    let selection = select_tokens(&scores, left)?;

    let device = tokens.device();
    let prefix = tokens.narrow(1, 0, num_prefix)?;
    let non_prefix = tokens.narrow(1, num_prefix, candidates)?;
    let kept = gather_tokens(&non_prefix, &selection.kept_tensor(device)?)?;
    let fused = fuse_discarded(&non_prefix, &scores, &selection.discarded_tensor(device)?)?;
    let tokens = reassemble(&prefix, &kept, &fused)?;

    Ok(Reduction {
        tokens,
        len: num_prefix + left + 1,
        selection: Some(selection),
    })
}
