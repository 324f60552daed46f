//! The full vision transformer: embeddings, a trunk of [`Block`]s driven by
//! the [`ReductionEngine`], final norm, pooling and classifier head.
//!
//! With an IFA head configured, the final norm, pooling and linear head are
//! replaced by a classifier over the class-token snapshots the engine
//! records at every reduction stage and the last stage.

use crate::block::Block;
use crate::embed::{PatchEmbed, TokenEmbed};
use crate::heads::{IfaHead, LatentPool};
use crate::layers::Norm;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder, VarMap};
use std::path::Path;
use tokenfold_core::{
    CacheSettings, Error, GlobalPool, ReductionSettings, Result, VitConfig,
};
use tokenfold_reduce::{ForwardOutput, ReductionEngine};
use tracing::info;

/// Vision transformer with adaptive token reduction.
#[derive(Debug, Clone)]
pub struct TokenFoldVit {
    cfg: VitConfig,
    patch_embed: PatchEmbed,
    tokens: TokenEmbed,
    norm_pre: Option<Norm>,
    blocks: Vec<Block>,
    norm: Option<Norm>,
    fc_norm: Option<Norm>,
    attn_pool: Option<LatentPool>,
    head: Option<Linear>,
    ifa_head: Option<IfaHead>,
    engine: ReductionEngine,
}

/// Output of [`TokenFoldVit::forward`].
#[derive(Debug, Clone)]
pub struct VitOutput {
    /// `[B, num_classes]`, or the pooled features when there is no head.
    pub logits: Tensor,
    /// Pooled features before the head; `[B, C, K]` snapshots with an IFA head.
    pub pooled: Tensor,
    /// Trunk output and per-stage reports.
    pub trunk: ForwardOutput,
}

impl TokenFoldVit {
    /// Build the model from `vb` and an engine configured for this trunk.
    pub fn new(cfg: VitConfig, engine: ReductionEngine, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        check_engine(&cfg, &engine)?;
        let engine = match cfg.ifa_head {
            Some(_) => engine.with_prefix_snapshots(true),
            None => engine,
        };

        let dim = cfg.embed_dim;
        let patch_embed = PatchEmbed::new(&cfg, vb.pp("patch_embed"))?;
        let tokens = TokenEmbed::new(&cfg, vb.clone())?;
        let norm_pre = cfg
            .pre_norm
            .then(|| Norm::new(cfg.norm, dim, cfg.norm_eps, vb.pp("norm_pre")))
            .transpose()?;

        let vb_blocks = vb.pp("blocks");
        let blocks = (0..cfg.depth)
            .map(|i| Block::new(&cfg, vb_blocks.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        if let Some(ifa) = &cfg.ifa_head {
            let snapshots = engine.snapshot_count();
            let ifa_head = IfaHead::new(&cfg, ifa, snapshots, vb.pp("ifa_head"))?;
            info!(snapshots, kernels_per_layer = ifa.kernels_per_layer, "IFA head enabled");
            return Ok(Self {
                cfg,
                patch_embed,
                tokens,
                norm_pre,
                blocks,
                norm: None,
                fc_norm: None,
                attn_pool: None,
                head: None,
                ifa_head: Some(ifa_head),
                engine,
            });
        }

        let use_fc_norm = cfg.use_fc_norm();
        let norm = (!use_fc_norm)
            .then(|| Norm::new(cfg.norm, dim, cfg.norm_eps, vb.pp("norm")))
            .transpose()?;
        let fc_norm = use_fc_norm
            .then(|| Norm::new(cfg.norm, dim, cfg.norm_eps, vb.pp("fc_norm")))
            .transpose()?;
        let attn_pool = (cfg.global_pool == GlobalPool::Map)
            .then(|| LatentPool::new(&cfg, vb.pp("attn_pool")))
            .transpose()?;
        let head = (cfg.num_classes > 0)
            .then(|| candle_nn::linear(dim, cfg.num_classes, vb.pp("head")))
            .transpose()?;

        Ok(Self {
            cfg,
            patch_embed,
            tokens,
            norm_pre,
            blocks,
            norm,
            fc_norm,
            attn_pool,
            head,
            ifa_head: None,
            engine,
        })
    }

    /// Build the engine from raw settings, then the model.
    pub fn with_settings(
        cfg: VitConfig,
        reduction: &ReductionSettings,
        cache: &CacheSettings,
        vb: VarBuilder,
    ) -> Result<Self> {
        let engine = ReductionEngine::new(cfg.depth, cfg.num_prefix_tokens(), reduction, cache)?;
        Self::new(cfg, engine, vb)
    }

    /// Freshly initialized weights, for benchmarking and shape checks.
    pub fn random(
        cfg: VitConfig,
        engine: ReductionEngine,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        Self::new(cfg, engine, vb)
    }

    /// Load weights from a safetensors file.
    pub fn from_safetensors(
        cfg: VitConfig,
        engine: ReductionEngine,
        path: &Path,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        info!(path = %path.display(), "Loading safetensors weights");
        let tensors = candle_core::safetensors::load(path, device)?;
        let count = tensors.len();
        let vb = VarBuilder::from_tensors(tensors, dtype, device);
        let model = Self::new(cfg, engine, vb)?;
        info!(tensors = count, "Weights loaded");
        Ok(model)
    }

    pub fn config(&self) -> &VitConfig {
        &self.cfg
    }

    pub fn engine(&self) -> &ReductionEngine {
        &self.engine
    }

    /// `images [B, C, H, W]` → embedded sequence `[B, N, D]`.
    pub fn embed(&self, images: &Tensor) -> Result<Tensor> {
        let patches = self.patch_embed.forward(images)?;
        let tokens = self.tokens.forward(&patches)?;
        match &self.norm_pre {
            Some(norm) => Ok(norm.forward(&tokens)?),
            None => Ok(tokens),
        }
    }

    /// Run the trunk and the final norm, without pooling.
    pub fn forward_features(&self, images: &Tensor) -> Result<ForwardOutput> {
        let tokens = self.embed(images)?;
        let mut trunk = self.engine.forward(&self.blocks, tokens)?;
        if let Some(norm) = &self.norm {
            trunk.tokens = norm.forward(&trunk.tokens)?;
        }
        Ok(trunk)
    }

    /// Full classification pass.
    pub fn forward(&self, images: &Tensor) -> Result<VitOutput> {
        let trunk = self.forward_features(images)?;
        if let Some(ifa) = &self.ifa_head {
            let snapshots = trunk
                .stacked_snapshots()?
                .ok_or_else(|| Error::invalid("the ifa head ran without class-token snapshots"))?;
            let logits = ifa.forward(&snapshots)?;
            return Ok(VitOutput {
                logits,
                pooled: snapshots,
                trunk,
            });
        }
        let pooled = self.pool(&trunk.tokens)?;
        let pooled = match &self.fc_norm {
            Some(norm) => norm.forward(&pooled)?,
            None => pooled,
        };
        let logits = match &self.head {
            Some(head) => head.forward(&pooled)?,
            None => pooled.clone(),
        };
        Ok(VitOutput {
            logits,
            pooled,
            trunk,
        })
    }

    fn pool(&self, tokens: &Tensor) -> Result<Tensor> {
        let prefix = self.cfg.num_prefix_tokens();
        match self.cfg.global_pool {
            GlobalPool::Token => Ok(tokens.narrow(1, 0, 1)?.squeeze(1)?),
            GlobalPool::Avg => {
                let len = tokens.dim(1)?;
                if len <= prefix {
                    return Err(Error::shape(
                        "average pool",
                        format!("more than {prefix} tokens"),
                        tokens.dims(),
                    ));
                }
                Ok(tokens.narrow(1, prefix, len - prefix)?.mean(1)?)
            }
            GlobalPool::Map => match &self.attn_pool {
                Some(pool) => pool.forward(tokens),
                None => Err(Error::invalid("map pooling has no attention pool")),
            },
            GlobalPool::None => Ok(tokens.clone()),
        }
    }
}

fn check_engine(cfg: &VitConfig, engine: &ReductionEngine) -> Result<()> {
    if engine.depth() != cfg.depth {
        return Err(Error::invalid(format!(
            "engine covers {} stages, model has depth {}",
            engine.depth(),
            cfg.depth
        )));
    }
    if engine.num_prefix() != cfg.num_prefix_tokens() {
        return Err(Error::invalid(format!(
            "engine expects {} prefix tokens, model has {}",
            engine.num_prefix(),
            cfg.num_prefix_tokens()
        )));
    }
    let cache = engine.cache_policy();
    if cache.is_enabled() && cache.mode().carrier_count() != cfg.carrier_tokens {
        return Err(Error::invalid(format!(
            "cache slices {} carrier tokens, model has {}",
            cache.mode().carrier_count(),
            cfg.carrier_tokens
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenfold_core::IfaHeadConfig;

    fn small() -> VitConfig {
        VitConfig {
            image_size: 16,
            patch_size: 4,
            num_classes: 10,
            embed_dim: 32,
            depth: 4,
            num_heads: 4,
            ..VitConfig::default()
        }
    }

    fn reduction(loc: Vec<usize>, rate: f64) -> ReductionSettings {
        ReductionSettings {
            reduction_loc: loc,
            keep_rate: vec![rate],
            ..ReductionSettings::default()
        }
    }

    fn images(batch: usize) -> Tensor {
        Tensor::randn(0f32, 1.0, (batch, 3, 16, 16), &Device::Cpu).unwrap()
    }

    fn build(cfg: VitConfig, reduction: &ReductionSettings, cache: &CacheSettings) -> TokenFoldVit {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TokenFoldVit::with_settings(cfg, reduction, cache, vb).unwrap()
    }

    #[test]
    fn classifies_with_reduced_trunk() {
        let model = build(small(), &reduction(vec![1, 2], 0.5), &CacheSettings::default());
        let out = model.forward(&images(2)).unwrap();
        assert_eq!(out.logits.dims(), &[2, 10]);
        // 17 → 1 + 8 + 1 = 10 → 1 + 5 + 1 = 7
        assert_eq!(out.trunk.trajectory(), vec![17, 10, 7, 7]);
    }

    #[test]
    fn full_keep_matches_unreduced_model() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let reduced = TokenFoldVit::with_settings(
            small(),
            &reduction(vec![1, 2], 1.0),
            &CacheSettings::default(),
            vb.clone(),
        )
        .unwrap();
        let plain = TokenFoldVit::new(small(), ReductionEngine::passthrough(4, 1), vb).unwrap();

        let images = images(1);
        let a = reduced.forward(&images).unwrap().logits.to_vec2::<f32>().unwrap();
        let b = plain.forward(&images).unwrap().logits.to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn registers_with_average_pooling() {
        let cfg = VitConfig {
            reg_tokens: 2,
            no_embed_class: true,
            global_pool: GlobalPool::Avg,
            ..small()
        };
        let model = build(cfg, &reduction(vec![2], 0.25), &CacheSettings::default());
        let out = model.forward(&images(1)).unwrap();
        assert_eq!(out.logits.dims(), &[1, 10]);
        // 19 tokens, 3 prefix: 3 + 4 + 1 = 8
        assert_eq!(out.trunk.trajectory()[2], 8);
    }

    #[test]
    fn carrier_cache_round_trip() {
        let cfg = VitConfig {
            carrier_tokens: 1,
            ..small()
        };
        let cache = CacheSettings {
            enabled: true,
            include_global_pool: true,
            carrier_tokens: 1,
            ..CacheSettings::default()
        };
        let model = build(cfg, &reduction(vec![2], 0.5), &cache);
        let out = model.forward(&images(2)).unwrap();
        // 18 tokens; stages 0-1 buffer 2 tokens each; stage 2 reduces 17
        // candidates to 9 + fused = 11, then recovers 4.
        assert_eq!(out.trunk.trajectory(), vec![18, 18, 15, 15]);
        assert_eq!(out.logits.dims(), &[2, 10]);
    }

    #[test]
    fn carrier_count_mismatch_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cache = CacheSettings {
            enabled: true,
            carrier_tokens: 2,
            ..CacheSettings::default()
        };
        let err = TokenFoldVit::with_settings(small(), &reduction(vec![1], 0.5), &cache, vb);
        assert!(err.unwrap_err().to_string().contains("carrier"));
    }

    #[test]
    fn headless_model_returns_features() {
        let cfg = VitConfig {
            num_classes: 0,
            global_pool: GlobalPool::None,
            ..small()
        };
        let model = build(cfg, &reduction(vec![0], 0.5), &CacheSettings::default());
        let out = model.forward(&images(1)).unwrap();
        assert_eq!(out.logits.dims(), &[1, 10, 32]);
    }

    #[test]
    fn ifa_head_classifies_stage_snapshots() {
        let cfg = VitConfig {
            ifa_head: Some(IfaHeadConfig {
                kernels_per_layer: 0,
            }),
            ..small()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let settings = reduction(vec![1, 2], 0.5);
        assert!(!settings.record_prefix_snapshots);
        let model =
            TokenFoldVit::with_settings(cfg.clone(), &settings, &CacheSettings::default(), vb.clone())
                .unwrap();
        let out = model.forward(&images(2)).unwrap();

        // Stages 1, 2 and the last one.
        assert_eq!(out.trunk.prefix_snapshots.len(), 3);
        assert_eq!(out.pooled.dims(), &[2, 32, 3]);
        assert_eq!(out.logits.dims(), &[2, 10]);

        let head = IfaHead::new(&cfg, &IfaHeadConfig { kernels_per_layer: 0 }, 3, vb.pp("ifa_head"))
            .unwrap();
        let expected = head.forward(&out.pooled).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out.logits.to_vec2::<f32>().unwrap(), expected);
    }

    #[test]
    fn grouped_ifa_head_replaces_norm_and_head() {
        let cfg = VitConfig {
            ifa_head: Some(IfaHeadConfig::default()),
            ..small()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = TokenFoldVit::with_settings(
            cfg,
            &reduction(vec![1, 3], 0.5),
            &CacheSettings::default(),
            vb,
        )
        .unwrap();
        assert_eq!(model.engine().snapshot_count(), 2);
        let out = model.forward(&images(2)).unwrap();
        assert_eq!(out.pooled.dims(), &[2, 32, 2]);
        assert_eq!(out.logits.dims(), &[2, 10]);

        let names = varmap.data().lock().unwrap();
        assert!(names.contains_key("ifa_head.0.1.weight"));
        assert!(!names.contains_key("norm.weight"));
        assert!(!names.contains_key("head.weight"));
    }

    #[test]
    fn map_pool_without_class_token() {
        let cfg = VitConfig {
            class_token: false,
            global_pool: GlobalPool::Map,
            ..small()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model =
            TokenFoldVit::with_settings(cfg, &ReductionSettings::none(), &CacheSettings::default(), vb)
                .unwrap();
        let out = model.forward(&images(2)).unwrap();
        assert_eq!(out.pooled.dims(), &[2, 32]);
        assert_eq!(out.logits.dims(), &[2, 10]);
        assert!(varmap.data().lock().unwrap().contains_key("attn_pool.latent"));
    }

    #[test]
    fn map_pool_over_reduced_sequence() {
        let cfg = VitConfig {
            global_pool: GlobalPool::Map,
            ..small()
        };
        let model = build(cfg, &reduction(vec![1], 0.5), &CacheSettings::default());
        let out = model.forward(&images(1)).unwrap();
        assert_eq!(out.trunk.trajectory(), vec![17, 10, 10, 10]);
        assert_eq!(out.logits.dims(), &[1, 10]);
    }

    #[test]
    fn safetensors_round_trip() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let engine = ReductionEngine::new(4, 1, &reduction(vec![1], 0.5), &CacheSettings::default())
            .unwrap();
        let model = TokenFoldVit::new(small(), engine.clone(), vb).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vit.safetensors");
        varmap.save(&path).unwrap();
        let loaded =
            TokenFoldVit::from_safetensors(small(), engine, &path, DType::F32, &Device::Cpu).unwrap();

        let images = images(1);
        let a = model.forward(&images).unwrap().logits.to_vec2::<f32>().unwrap();
        let b = loaded.forward(&images).unwrap().logits.to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
