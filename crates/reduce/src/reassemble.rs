//! Sequence reassembler — `[prefix, kept…, fused]`.

use crate::select::TokenSelection;
use candle_core::Tensor;
use tokenfold_core::{Error, Result};

/// Sentinel marking the fused-token slot in a selection trace.
pub const FUSED_SLOT: i64 = -1;

/// Concatenate prefix tokens, kept tokens (selector order) and the fused token.
pub fn reassemble(prefix: &Tensor, kept: &Tensor, fused: &Tensor) -> Result<Tensor> {
    let (batch, _, channels) = prefix.dims3()?;
    for (context, part) in [("kept tokens", kept), ("fused token", fused)] {
        let (b, _, c) = part.dims3()?;
        if b != batch || c != channels {
            return Err(Error::shape(
                context,
                format!("[{batch}, _, {channels}]"),
                part.dims(),
            ));
        }
    }
    Ok(Tensor::cat(&[prefix, kept, fused], 1)?)
}

/// Kept indices per row followed by [`FUSED_SLOT`]; diagnostics only.
pub fn selection_trace(selection: &TokenSelection) -> Vec<Vec<i64>> {
    selection
        .kept()
        .iter()
        .map(|row| {
            row.iter()
                .map(|&idx| i64::from(idx))
                .chain(std::iter::once(FUSED_SLOT))
                .collect()
        })
        .collect()
}
