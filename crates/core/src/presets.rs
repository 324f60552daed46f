//! Named model presets.
//!
//! Friendly aliases that resolve to a full [`VitConfig`]. Lookup is
//! case-insensitive and accepts a few spellings per preset.

use crate::arch::{GlobalPool, VitConfig};

/// Canonical preset names, in display order.
pub const PRESET_NAMES: &[&str] = &[
    "vit-tiny",
    "vit-small",
    "vit-small-p8",
    "vit-base",
    "vit-large",
    "vit-base-gap",
    "vit-medium-reg4",
    "vit-small-reg4-dinov2",
    "deit-tiny",
    "deit-small",
    "deit-base",
    "deit3-small",
];

fn dims(patch_size: usize, embed_dim: usize, depth: usize, num_heads: usize) -> VitConfig {
    VitConfig {
        patch_size,
        embed_dim,
        depth,
        num_heads,
        ..VitConfig::default()
    }
}

/// Resolve a preset alias to its configuration.
pub fn resolve_preset(alias: &str) -> Option<VitConfig> {
    let alias_lower = alias.to_lowercase();
    let cfg = match alias_lower.as_str() {
        "vit-tiny" | "tiny" | "vit_tiny_patch16_224" => dims(16, 192, 12, 3),
        "vit-small" | "small" | "vit_small_patch16_224" => dims(16, 384, 12, 6),
        "vit-small-p8" | "vit_small_patch8_224" => dims(8, 384, 12, 6),
        "vit-base" | "base" | "vit_base_patch16_224" => dims(16, 768, 12, 12),
        "vit-large" | "large" | "vit_large_patch16_224" => dims(16, 1024, 24, 16),
        "vit-base-gap" | "vit_base_patch16_gap_224" => VitConfig {
            class_token: false,
            global_pool: GlobalPool::Avg,
            fc_norm: Some(false),
            ..dims(16, 768, 12, 16)
        },
        "vit-medium-reg4" | "vit_medium_patch16_reg4_256" => VitConfig {
            image_size: 256,
            no_embed_class: true,
            reg_tokens: 4,
            ..dims(16, 512, 12, 8)
        },
        "vit-small-reg4-dinov2" | "vit_small_patch14_reg4_dinov2" => VitConfig {
            image_size: 518,
            init_values: Some(1e-5),
            reg_tokens: 4,
            no_embed_class: true,
            ..dims(14, 384, 12, 6)
        },
        "deit-tiny" | "deit_tiny_patch16_224" => dims(16, 192, 12, 3),
        "deit-small" | "deit_small_patch16_224" => dims(16, 384, 12, 6),
        "deit-base" | "deit_base_patch16_224" => dims(16, 768, 12, 12),
        "deit3-small" | "deit3_small_patch16_224" => VitConfig {
            no_embed_class: true,
            init_values: Some(1e-6),
            ..dims(16, 384, 12, 6)
        },
        _ => return None,
    };
    Some(cfg)
}
