//! Relevance scorer — how much the summary token attends to each token.

use candle_core::Tensor;
use tokenfold_core::{Error, Result};

/// Per-token relevance scores, `[B, N - num_prefix]`.
///
/// Reads the attention row of the first prefix token, restricted to the
/// non-prefix columns, and averages it over heads. `attention` is
/// `[B, H, N, N]`, or `[H, N, N]` when the batch holds a single sequence.
pub fn relevance_scores(tokens: &Tensor, attention: &Tensor, num_prefix: usize) -> Result<Tensor> {
    let (batch, len) = match tokens.dims() {
        &[b, n, _] => (b, n),
        other => return Err(Error::shape("token sequence", "[B, N, C]", other)),
    };

    let attention = match attention.rank() {
        4 => attention.clone(),
        3 if batch == 1 => attention.unsqueeze(0)?,
        _ => {
            return Err(Error::shape(
                "attention weights",
                format!("[{batch}, H, {len}, {len}]"),
                attention.dims(),
            ));
        }
    };

    let (b, heads, rows, cols) = attention.dims4()?;
    if b != batch || rows != len || cols != len || heads == 0 {
        return Err(Error::shape(
            "attention weights",
            format!("[{batch}, H, {len}, {len}]"),
            attention.dims(),
        ));
    }

    if num_prefix == 0 {
        return Err(Error::invalid(
            "relevance scoring needs a summary token at the head of the sequence",
        ));
    }
    if num_prefix >= len {
        return Err(Error::invalid(format!(
            "sequence of {len} tokens has no candidates after {num_prefix} prefix tokens"
        )));
    }

    // [B, H, N, N] -> [B, H, N] (summary query row) -> [B, H, M] -> [B, M]
    let summary_row = attention.narrow(2, 0, 1)?.squeeze(2)?;
    let scores = summary_row.narrow(2, num_prefix, len - num_prefix)?.mean(1)?;
    Ok(scores)
}
