//! Stage trait — one processing stage of the sequence-model trunk.
//!
//! The reduction engine only needs two things from a stage: a token-mixing
//! half that reports its post-softmax attention weights, and an optional
//! second half applied after reduction. Transformer blocks, test doubles and
//! anything else with that shape plug in here.

use crate::error::Result;
use candle_core::Tensor;

/// Output of a stage's token-mixing half.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Transformed tokens, `[B, N, C]`.
    pub tokens: Tensor,
    /// Post-softmax attention weights, `[B, H, N, N]`.
    pub attention: Tensor,
}

/// A processing stage the reduction engine can drive.
pub trait SequenceStage: Send + Sync {
    /// Token mixing: `tokens [B, N, C]` → transformed tokens and attention.
    fn transform(&self, tokens: &Tensor) -> Result<StageOutput>;

    /// Applied to the (possibly reduced) sequence after `transform`.
    fn refine(&self, tokens: &Tensor) -> Result<Tensor> {
        Ok(tokens.clone())
    }
}

impl<S: SequenceStage + ?Sized> SequenceStage for Box<S> {
    fn transform(&self, tokens: &Tensor) -> Result<StageOutput> {
        (**self).transform(tokens)
    }

    fn refine(&self, tokens: &Tensor) -> Result<Tensor> {
        (**self).refine(tokens)
    }
}

impl<S: SequenceStage + ?Sized> SequenceStage for &S {
    fn transform(&self, tokens: &Tensor) -> Result<StageOutput> {
        (**self).transform(tokens)
    }

    fn refine(&self, tokens: &Tensor) -> Result<Tensor> {
        (**self).refine(tokens)
    }
}
