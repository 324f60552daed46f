//! Patch embedding plus prefix, carrier and position embeddings.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder};
use tokenfold_core::{Error, Result, VitConfig};

const POS_EMBED_STD: f64 = 0.02;
const TOKEN_STD: f64 = 1e-6;

/// Non-overlapping patch projection: `[B, C_in, H, W]` → `[B, N_patches, D]`.
#[derive(Debug, Clone)]
pub struct PatchEmbed {
    proj: Conv2d,
    in_chans: usize,
    image_size: usize,
}

impl PatchEmbed {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let proj = candle_nn::conv2d(
            cfg.in_chans,
            cfg.embed_dim,
            cfg.patch_size,
            conv_cfg,
            vb.pp("proj"),
        )?;
        Ok(Self {
            proj,
            in_chans: cfg.in_chans,
            image_size: cfg.image_size,
        })
    }

    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let (_, chans, height, width) = images.dims4()?;
        if chans != self.in_chans || height != self.image_size || width != self.image_size {
            return Err(Error::shape(
                "image batch",
                format!("[B, {}, {}, {}]", self.in_chans, self.image_size, self.image_size),
                images.dims(),
            ));
        }
        // [B, D, g, g] -> [B, D, g*g] -> [B, g*g, D]
        let patches = self.proj.forward(images)?.flatten_from(2)?.transpose(1, 2)?;
        Ok(patches.contiguous()?)
    }
}

/// Class, register and carrier tokens plus the absolute position embedding.
#[derive(Debug, Clone)]
pub struct TokenEmbed {
    cls_token: Option<Tensor>,
    reg_token: Option<Tensor>,
    carriers: Option<Tensor>,
    pos_embed: Tensor,
    no_embed_class: bool,
}

impl TokenEmbed {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let token_init = Init::Randn {
            mean: 0.,
            stdev: TOKEN_STD,
        };
        let cls_token = cfg
            .class_token
            .then(|| vb.get_with_hints((1, 1, dim), "cls_token", token_init))
            .transpose()?;
        let reg_token = (cfg.reg_tokens > 0)
            .then(|| vb.get_with_hints((1, cfg.reg_tokens, dim), "reg_token", token_init))
            .transpose()?;
        let carriers = match &cls_token {
            Some(cls)
                if cfg.carrier_tokens > 0
                    && cfg.init_carriers_from_cls
                    && !vb.contains_tensor("carrier_tokens") =>
            {
                Some(cls.repeat((1, cfg.carrier_tokens, 1))?)
            }
            _ => (cfg.carrier_tokens > 0)
                .then(|| {
                    vb.get_with_hints((1, cfg.carrier_tokens, dim), "carrier_tokens", token_init)
                })
                .transpose()?,
        };
        let pos_embed = vb.get_with_hints(
            (1, cfg.embed_len(), dim),
            "pos_embed",
            Init::Randn {
                mean: 0.,
                stdev: POS_EMBED_STD,
            },
        )?;
        Ok(Self {
            cls_token,
            reg_token,
            carriers,
            pos_embed,
            no_embed_class: cfg.no_embed_class,
        })
    }

    /// `patches [B, N_patches, D]` → `[B, P + N_patches + K, D]`.
    ///
    /// Prefix tokens lead, carrier tokens trail. Without `no_embed_class`
    /// every position is embedded; with it only the patches are.
    pub fn forward(&self, patches: &Tensor) -> Result<Tensor> {
        let (batch, _, dim) = patches.dims3()?;
        let expand = |token: &Tensor| -> Result<Tensor> {
            Ok(token.broadcast_as((batch, token.dim(1)?, dim))?.contiguous()?)
        };

        let patches = if self.no_embed_class {
            patches.broadcast_add(&self.pos_embed)?
        } else {
            patches.clone()
        };

        let mut parts = Vec::with_capacity(4);
        for token in [&self.cls_token, &self.reg_token].into_iter().flatten() {
            parts.push(expand(token)?);
        }
        parts.push(patches);
        if let Some(carriers) = &self.carriers {
            parts.push(expand(carriers)?);
        }
        let tokens = Tensor::cat(&parts, 1)?;

        if self.no_embed_class {
            Ok(tokens)
        } else {
            Ok(tokens.broadcast_add(&self.pos_embed)?)
        }
    }
}
