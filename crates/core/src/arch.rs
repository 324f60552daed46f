//! Architecture descriptors for the vision-transformer trunk.
//!
//! Plain data: the `tokenfold-vit` crate turns a [`VitConfig`] into candle
//! modules, the config crate reads it from TOML, and the CLI prints it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Normalization layer variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    #[default]
    LayerNorm,
    RmsNorm,
}

/// MLP activation variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Exact (erf) GELU.
    #[default]
    Gelu,
    /// Tanh-approximated GELU.
    GeluTanh,
    QuickGelu,
    Relu,
    Silu,
}

/// Feed-forward variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MlpKind {
    /// `fc1 → act → fc2`.
    #[default]
    Standard,
    /// Packed SwiGLU: `fc1` emits both gate and value halves.
    SwiGlu,
}

/// How the final sequence is pooled before the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalPool {
    /// Take the class token.
    #[default]
    Token,
    /// Average the non-prefix tokens.
    Avg,
    /// Attend over the whole sequence with one learned latent query.
    Map,
    /// Return the full normalized sequence, no head.
    None,
}

impl std::fmt::Display for GlobalPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token => write!(f, "token"),
            Self::Avg => write!(f, "avg"),
            Self::Map => write!(f, "map"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Classifier over the class-token snapshots taken at every reduction
/// stage and the last stage.
///
/// With `kernels_per_layer > 0` the snapshots are mixed per channel by a
/// grouped convolution; with zero they are collapsed by a single linear
/// weight per snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaHeadConfig {
    #[serde(default = "default_kernels_per_layer")]
    pub kernels_per_layer: usize,
}

fn default_kernels_per_layer() -> usize {
    2
}

impl Default for IfaHeadConfig {
    fn default() -> Self {
        Self {
            kernels_per_layer: default_kernels_per_layer(),
        }
    }
}

/// Vision-transformer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitConfig {
    #[serde(default = "default_image_size")]
    pub image_size: usize,

    #[serde(default = "default_patch_size")]
    pub patch_size: usize,

    #[serde(default = "default_in_chans")]
    pub in_chans: usize,

    /// Classifier width; 0 disables the head.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,

    #[serde(default = "default_depth")]
    pub depth: usize,

    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,

    #[serde(default = "default_true")]
    pub qkv_bias: bool,

    #[serde(default)]
    pub qk_norm: bool,

    /// Layer-scale init value; layer scale is disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_values: Option<f64>,

    #[serde(default = "default_true")]
    pub class_token: bool,

    #[serde(default)]
    pub reg_tokens: usize,

    /// Persistent carrier tokens appended after the patch tokens.
    #[serde(default)]
    pub carrier_tokens: usize,

    /// Seed the carrier tokens with copies of the class token when the
    /// weights do not provide them.
    #[serde(default)]
    pub init_carriers_from_cls: bool,

    /// Position embeddings skip the prefix (and carrier) tokens.
    #[serde(default)]
    pub no_embed_class: bool,

    #[serde(default)]
    pub pre_norm: bool,

    /// Norm after pooling instead of before; defaults to `global_pool == avg`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fc_norm: Option<bool>,

    #[serde(default)]
    pub global_pool: GlobalPool,

    /// Replaces pooling, the final norm and the linear head.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifa_head: Option<IfaHeadConfig>,

    #[serde(default)]
    pub norm: NormKind,

    #[serde(default)]
    pub act: Activation,

    #[serde(default)]
    pub mlp: MlpKind,

    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
}

fn default_image_size() -> usize {
    224
}
fn default_patch_size() -> usize {
    16
}
fn default_in_chans() -> usize {
    3
}
fn default_num_classes() -> usize {
    1000
}
fn default_embed_dim() -> usize {
    768
}
fn default_depth() -> usize {
    12
}
fn default_num_heads() -> usize {
    12
}
fn default_mlp_ratio() -> f64 {
    4.0
}
fn default_norm_eps() -> f64 {
    1e-6
}
fn default_true() -> bool {
    true
}

impl Default for VitConfig {
    fn default() -> Self {
        Self {
            image_size: default_image_size(),
            patch_size: default_patch_size(),
            in_chans: default_in_chans(),
            num_classes: default_num_classes(),
            embed_dim: default_embed_dim(),
            depth: default_depth(),
            num_heads: default_num_heads(),
            mlp_ratio: default_mlp_ratio(),
            qkv_bias: true,
            qk_norm: false,
            init_values: None,
            class_token: true,
            reg_tokens: 0,
            carrier_tokens: 0,
            init_carriers_from_cls: false,
            no_embed_class: false,
            pre_norm: false,
            fc_norm: None,
            global_pool: GlobalPool::Token,
            ifa_head: None,
            norm: NormKind::LayerNorm,
            act: Activation::Gelu,
            mlp: MlpKind::Standard,
            norm_eps: default_norm_eps(),
        }
    }
}

impl VitConfig {
    /// Patches per side.
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Class token plus register tokens.
    pub fn num_prefix_tokens(&self) -> usize {
        usize::from(self.class_token) + self.reg_tokens
    }

    /// Sequence length entering the first stage.
    pub fn initial_len(&self) -> usize {
        self.num_prefix_tokens() + self.num_patches() + self.carrier_tokens
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    pub fn mlp_hidden(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    pub fn use_fc_norm(&self) -> bool {
        self.fc_norm.unwrap_or(self.global_pool == GlobalPool::Avg)
    }

    /// Number of position-embedding rows.
    pub fn embed_len(&self) -> usize {
        if self.no_embed_class {
            self.num_patches()
        } else {
            self.num_patches() + self.num_prefix_tokens() + self.carrier_tokens
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::invalid("depth must be > 0"));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(Error::invalid(format!(
                "embed_dim {} must be divisible by num_heads {}",
                self.embed_dim, self.num_heads
            )));
        }
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(Error::invalid(format!(
                "image_size {} must be a multiple of patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.mlp_ratio <= 0.0 {
            return Err(Error::invalid("mlp_ratio must be > 0"));
        }
        if self.global_pool == GlobalPool::Token && !self.class_token {
            return Err(Error::invalid("token pooling requires a class token"));
        }
        if self.init_carriers_from_cls && self.carrier_tokens > 0 && !self.class_token {
            return Err(Error::invalid(
                "carriers seeded from the class token require a class token",
            ));
        }
        if self.ifa_head.is_some() {
            if !self.class_token {
                return Err(Error::invalid("the ifa head reads class-token snapshots"));
            }
            if self.num_classes == 0 {
                return Err(Error::invalid("the ifa head needs num_classes > 0"));
            }
        }
        if self.mlp == MlpKind::SwiGlu && self.mlp_hidden() % 2 != 0 {
            return Err(Error::invalid("packed SwiGLU needs an even hidden width"));
        }
        Ok(())
    }
}
