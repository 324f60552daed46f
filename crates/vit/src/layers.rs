//! Building blocks shared by the attention and block modules: norms,
//! activations, MLPs and layer scale.

use candle_core::{Module, Tensor};
use candle_nn::{Init, LayerNorm, Linear, RmsNorm, VarBuilder};
use tokenfold_core::{Activation, MlpKind, NormKind, Result, VitConfig};

/// Normalization layer, resolved from [`NormKind`].
#[derive(Debug, Clone)]
pub enum Norm {
    Layer(LayerNorm),
    Rms(RmsNorm),
}

impl Norm {
    pub fn new(kind: NormKind, dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(match kind {
            NormKind::LayerNorm => Self::Layer(candle_nn::layer_norm(dim, eps, vb)?),
            NormKind::RmsNorm => Self::Rms(candle_nn::rms_norm(dim, eps, vb)?),
        })
    }
}

impl Module for Norm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Layer(norm) => norm.forward(xs),
            Self::Rms(norm) => norm.forward(xs),
        }
    }
}

/// Apply an activation function elementwise.
pub fn activate(act: Activation, xs: &Tensor) -> Result<Tensor> {
    let out = match act {
        Activation::Gelu => xs.gelu_erf()?,
        Activation::GeluTanh => xs.gelu()?,
        Activation::QuickGelu => (xs * candle_nn::ops::sigmoid(&(xs * 1.702)?)?)?,
        Activation::Relu => xs.relu()?,
        Activation::Silu => xs.silu()?,
    };
    Ok(out)
}

/// Feed-forward network of a transformer block.
#[derive(Debug, Clone)]
pub enum Mlp {
    /// `fc2(act(fc1(x)))`
    Standard {
        fc1: Linear,
        fc2: Linear,
        act: Activation,
    },
    /// `fc2(silu(fc1_g(x)) * fc1_x(x))`
    SwiGlu {
        fc1_g: Linear,
        fc1_x: Linear,
        fc2: Linear,
    },
}

impl Mlp {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let hidden = cfg.mlp_hidden();
        Ok(match cfg.mlp {
            MlpKind::Standard => Self::Standard {
                fc1: candle_nn::linear(dim, hidden, vb.pp("fc1"))?,
                fc2: candle_nn::linear(hidden, dim, vb.pp("fc2"))?,
                act: cfg.act,
            },
            MlpKind::SwiGlu => Self::SwiGlu {
                fc1_g: candle_nn::linear(dim, hidden, vb.pp("fc1_g"))?,
                fc1_x: candle_nn::linear(dim, hidden, vb.pp("fc1_x"))?,
                fc2: candle_nn::linear(hidden, dim, vb.pp("fc2"))?,
            },
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Standard { fc1, fc2, act } => {
                let hidden = activate(*act, &fc1.forward(xs)?)?;
                Ok(fc2.forward(&hidden)?)
            }
            Self::SwiGlu { fc1_g, fc1_x, fc2 } => {
                let gate = fc1_g.forward(xs)?.silu()?;
                let hidden = (gate * fc1_x.forward(xs)?)?;
                Ok(fc2.forward(&hidden)?)
            }
        }
    }
}

/// Per-channel residual scaling.
#[derive(Debug, Clone)]
pub struct LayerScale {
    gamma: Tensor,
}

impl LayerScale {
    pub fn new(dim: usize, init_values: f64, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get_with_hints(dim, "gamma", Init::Const(init_values))?;
        Ok(Self { gamma })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.broadcast_mul(&self.gamma)?)
    }
}
