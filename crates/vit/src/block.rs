//! Pre-norm transformer block, split into the two halves the reduction
//! engine drives: attention (which yields the weights used for scoring)
//! and the MLP applied to the reduced sequence.

use crate::attention::Attention;
use crate::layers::{LayerScale, Mlp, Norm};
use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;
use tokenfold_core::{Result, SequenceStage, StageOutput, VitConfig};

#[derive(Debug, Clone)]
pub struct Block {
    norm1: Norm,
    attn: Attention,
    ls1: Option<LayerScale>,
    norm2: Norm,
    mlp: Mlp,
    ls2: Option<LayerScale>,
}

impl Block {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let layer_scale = |name: &str| -> Result<Option<LayerScale>> {
            cfg.init_values
                .map(|init| LayerScale::new(dim, init, vb.pp(name)))
                .transpose()
        };
        Ok(Self {
            norm1: Norm::new(cfg.norm, dim, cfg.norm_eps, vb.pp("norm1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            ls1: layer_scale("ls1")?,
            norm2: Norm::new(cfg.norm, dim, cfg.norm_eps, vb.pp("norm2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            ls2: layer_scale("ls2")?,
        })
    }
}

fn scaled(scale: &Option<LayerScale>, xs: Tensor) -> Result<Tensor> {
    match scale {
        Some(scale) => scale.forward(&xs),
        None => Ok(xs),
    }
}

impl SequenceStage for Block {
    fn transform(&self, tokens: &Tensor) -> Result<StageOutput> {
        let (mixed, attention) = self.attn.forward(&self.norm1.forward(tokens)?)?;
        let tokens = (tokens + scaled(&self.ls1, mixed)?)?;
        Ok(StageOutput { tokens, attention })
    }

    fn refine(&self, tokens: &Tensor) -> Result<Tensor> {
        let hidden = self.mlp.forward(&self.norm2.forward(tokens)?)?;
        Ok((tokens + scaled(&self.ls2, hidden)?)?)
    }
}
