//! Classifier heads that replace token pooling: the intermediate-feature
//! aggregation (IFA) head over class-token snapshots, and the latent
//! attention pool behind `global_pool = "map"`.

use crate::layers::{Mlp, Norm};
use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, Init, LayerNorm, Linear, VarBuilder};
use tokenfold_core::{Error, IfaHeadConfig, Result, VitConfig};

const BATCH_NORM_EPS: f64 = 1e-5;
const LAYER_NORM_EPS: f64 = 1e-5;

/// Classifier over stacked class-token snapshots `[B, C, K]`.
#[derive(Debug, Clone)]
pub enum IfaHead {
    /// Per-channel grouped convolution across the `K` snapshots, then a
    /// pointwise convolution to the classes.
    Grouped {
        norm_in: BatchNorm,
        mix: Conv1d,
        norm_mid: BatchNorm,
        classify: Conv1d,
    },
    /// One weight per snapshot, then a normalized linear classifier.
    Linear {
        collapse: Linear,
        norm: LayerNorm,
        fc: Linear,
    },
}

impl IfaHead {
    /// Build a head reading `snapshots` stacked snapshots per channel.
    pub fn new(
        cfg: &VitConfig,
        head: &IfaHeadConfig,
        snapshots: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if snapshots == 0 {
            return Err(Error::invalid("the ifa head needs at least one snapshot"));
        }
        let dim = cfg.embed_dim;
        // Indices follow the checkpoint layout of the sequential head.
        let vb = vb.pp("0");
        if head.kernels_per_layer > 0 {
            let width = dim * head.kernels_per_layer;
            let grouped = Conv1dConfig {
                stride: snapshots,
                groups: dim,
                ..Default::default()
            };
            Ok(Self::Grouped {
                norm_in: candle_nn::batch_norm(dim, BATCH_NORM_EPS, vb.pp("0"))?,
                mix: candle_nn::conv1d(dim, width, snapshots, grouped, vb.pp("1"))?,
                norm_mid: candle_nn::batch_norm(width, BATCH_NORM_EPS, vb.pp("2"))?,
                classify: candle_nn::conv1d(
                    width,
                    cfg.num_classes,
                    1,
                    Conv1dConfig::default(),
                    vb.pp("4"),
                )?,
            })
        } else {
            Ok(Self::Linear {
                collapse: candle_nn::linear(snapshots, 1, vb.pp("0"))?,
                norm: candle_nn::layer_norm(dim, LAYER_NORM_EPS, vb.pp("3"))?,
                fc: candle_nn::linear(dim, cfg.num_classes, vb.pp("4"))?,
            })
        }
    }

    /// `snapshots [B, C, K]` → logits `[B, num_classes]`.
    pub fn forward(&self, snapshots: &Tensor) -> Result<Tensor> {
        match self {
            Self::Grouped {
                norm_in,
                mix,
                norm_mid,
                classify,
            } => {
                let xs = norm_in.forward_t(snapshots, false)?;
                let xs = mix.forward(&xs)?;
                let xs = norm_mid.forward_t(&xs, false)?.gelu_erf()?;
                Ok(classify.forward(&xs)?.squeeze(2)?)
            }
            Self::Linear { collapse, norm, fc } => {
                let xs = collapse.forward(snapshots)?.squeeze(2)?.relu()?;
                Ok(fc.forward(&norm.forward(&xs)?)?)
            }
        }
    }
}

/// Attention pooling with a single learned latent query.
#[derive(Debug, Clone)]
pub struct LatentPool {
    latent: Tensor,
    q: Linear,
    kv: Linear,
    proj: Linear,
    norm: Norm,
    mlp: Mlp,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl LatentPool {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let head_dim = cfg.head_dim();
        let latent = vb.get_with_hints(
            (1, 1, dim),
            "latent",
            Init::Randn {
                mean: 0.0,
                stdev: (dim as f64).powf(-0.5),
            },
        )?;
        Ok(Self {
            latent,
            q: candle_nn::linear_b(dim, dim, cfg.qkv_bias, vb.pp("q"))?,
            kv: candle_nn::linear_b(dim, 2 * dim, cfg.qkv_bias, vb.pp("kv"))?,
            proj: candle_nn::linear(dim, dim, vb.pp("proj"))?,
            norm: Norm::new(cfg.norm, dim, cfg.norm_eps, vb.pp("norm"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            num_heads: cfg.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `tokens [B, N, C]` → pooled `[B, C]`.
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (b, n, c) = tokens.dims3()?;
        let (h, d) = (self.num_heads, self.head_dim);

        let latent = self.latent.broadcast_as((b, 1, c))?.contiguous()?;
        let q = self
            .q
            .forward(&latent)?
            .reshape((b, 1, h, d))?
            .transpose(1, 2)?
            .contiguous()?;
        // [B, N, 2C] -> [2, B, H, N, D]
        let kv = self
            .kv
            .forward(tokens)?
            .reshape((b, n, 2, h, d))?
            .permute((2, 0, 3, 1, 4))?;
        let k = kv.get(0)?.contiguous()?;
        let v = kv.get(1)?.contiguous()?;

        let attn = (q * self.scale)?.matmul(&k.t()?.contiguous()?)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&v)?.transpose(1, 2)?.contiguous()?.reshape((b, 1, c))?;
        let out = self.proj.forward(&out)?;

        let out = (&out + self.mlp.forward(&self.norm.forward(&out)?)?)?;
        Ok(out.squeeze(1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn cfg() -> VitConfig {
        VitConfig {
            embed_dim: 16,
            num_heads: 4,
            num_classes: 5,
            ..VitConfig::default()
        }
    }

    fn fresh() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn grouped_head_classifies_snapshots() {
        let (_varmap, vb) = fresh();
        let head = IfaHead::new(&cfg(), &IfaHeadConfig { kernels_per_layer: 2 }, 3, vb).unwrap();
        assert!(matches!(head, IfaHead::Grouped { .. }));
        let snapshots = Tensor::randn(0f32, 1.0, (2, 16, 3), &Device::Cpu).unwrap();
        let logits = head.forward(&snapshots).unwrap();
        assert_eq!(logits.dims(), &[2, 5]);
    }

    #[test]
    fn linear_head_classifies_snapshots() {
        let (_varmap, vb) = fresh();
        let head = IfaHead::new(&cfg(), &IfaHeadConfig { kernels_per_layer: 0 }, 4, vb).unwrap();
        assert!(matches!(head, IfaHead::Linear { .. }));
        let snapshots = Tensor::randn(0f32, 1.0, (3, 16, 4), &Device::Cpu).unwrap();
        assert_eq!(head.forward(&snapshots).unwrap().dims(), &[3, 5]);
    }

    #[test]
    fn snapshot_count_mismatch_fails() {
        let (_varmap, vb) = fresh();
        let head = IfaHead::new(&cfg(), &IfaHeadConfig::default(), 3, vb).unwrap();
        let wrong = Tensor::randn(0f32, 1.0, (1, 16, 2), &Device::Cpu).unwrap();
        assert!(head.forward(&wrong).is_err());
    }

    #[test]
    fn latent_pool_ignores_token_order() {
        let (_varmap, vb) = fresh();
        let pool = LatentPool::new(&cfg(), vb).unwrap();
        let tokens = Tensor::randn(0f32, 1.0, (2, 6, 16), &Device::Cpu).unwrap();
        let reversed = Tensor::cat(
            &(0..6).rev().map(|i| tokens.i((.., i..i + 1, ..)).unwrap()).collect::<Vec<_>>(),
            1,
        )
        .unwrap();

        let a = pool.forward(&tokens).unwrap();
        let b = pool.forward(&reversed).unwrap();
        assert_eq!(a.dims(), &[2, 16]);
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }
}
