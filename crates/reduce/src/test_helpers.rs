//! Shared fixtures for unit tests.

use candle_core::{DType, Device, Tensor};
use tokenfold_core::{Result, SequenceStage, StageOutput};

/// `[B, N, C]` tensor holding `0, 1, 2, …` in row-major order.
pub fn ramp_tokens(batch: usize, len: usize, channels: usize, device: &Device) -> Tensor {
    Tensor::arange(0f32, (batch * len * channels) as f32, device)
        .unwrap()
        .reshape((batch, len, channels))
        .unwrap()
}

/// `[B, H, M + 1, M + 1]` attention whose summary row carries `scores` over
/// the candidate columns in every head. All other entries are zero.
pub fn attention_from_scores(scores: &[Vec<f32>], heads: usize, device: &Device) -> Tensor {
    let batch = scores.len();
    let len = scores[0].len() + 1;
    let mut data = vec![0f32; batch * heads * len * len];
    for (b, row) in scores.iter().enumerate() {
        for h in 0..heads {
            let offset = (b * heads + h) * len * len;
            data[offset + 1..offset + len].copy_from_slice(row);
        }
    }
    Tensor::from_vec(data, (batch, heads, len, len), device).unwrap()
}

/// Stage that leaves tokens untouched and attends uniformly.
pub struct UniformStage {
    heads: usize,
}

impl UniformStage {
    pub fn new(heads: usize) -> Self {
        Self { heads }
    }
}

impl SequenceStage for UniformStage {
    fn transform(&self, tokens: &Tensor) -> Result<StageOutput> {
        let (batch, len, _) = tokens.dims3()?;
        let attention =
            (Tensor::ones((batch, self.heads, len, len), DType::F32, tokens.device())? / len as f64)?;
        Ok(StageOutput {
            tokens: tokens.clone(),
            attention,
        })
    }
}
