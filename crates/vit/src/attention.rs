//! Multi-head self-attention that also returns its attention weights.

use crate::layers::Norm;
use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use tokenfold_core::{Result, VitConfig};

#[derive(Debug, Clone)]
pub struct Attention {
    qkv: Linear,
    proj: Linear,
    q_norm: Option<Norm>,
    k_norm: Option<Norm>,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let head_dim = cfg.head_dim();
        let qkv = candle_nn::linear_b(dim, 3 * dim, cfg.qkv_bias, vb.pp("qkv"))?;
        let proj = candle_nn::linear(dim, dim, vb.pp("proj"))?;
        let (q_norm, k_norm) = if cfg.qk_norm {
            (
                Some(Norm::new(cfg.norm, head_dim, cfg.norm_eps, vb.pp("q_norm"))?),
                Some(Norm::new(cfg.norm, head_dim, cfg.norm_eps, vb.pp("k_norm"))?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            qkv,
            proj,
            q_norm,
            k_norm,
            num_heads: cfg.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `xs [B, N, C]` → (`[B, N, C]`, post-softmax weights `[B, H, N, N]`).
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, n, c) = xs.dims3()?;
        let (h, d) = (self.num_heads, self.head_dim);

        // [B, N, 3C] -> [3, B, H, N, D]
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, h, d))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let q = match &self.q_norm {
            Some(norm) => norm.forward(&q)?,
            None => q,
        };
        let k = match &self.k_norm {
            Some(norm) => norm.forward(&k)?,
            None => k,
        };

        let q = (q * self.scale)?;
        let attn = q.matmul(&k.t()?.contiguous()?)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&v)?;

        let out = out.transpose(1, 2)?.contiguous()?.reshape((b, n, c))?;
        Ok((self.proj.forward(&out)?, attn))
    }
}
