//! `tokenfold models` — List the preset catalog.

use tokenfold_core::{resolve_preset, PRESET_NAMES};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "{:<24} {:>6} {:>6} {:>6} {:>7} {:>7} {:>6}",
        "Preset", "Patch", "Dim", "Depth", "Heads", "Tokens", "Prefix"
    );
    println!("{}", "─".repeat(68));

    for name in PRESET_NAMES {
        let Some(cfg) = resolve_preset(name) else {
            continue;
        };
        println!(
            "{:<24} {:>6} {:>6} {:>6} {:>7} {:>7} {:>6}",
            name,
            cfg.patch_size,
            cfg.embed_dim,
            cfg.depth,
            cfg.num_heads,
            cfg.initial_len(),
            cfg.num_prefix_tokens(),
        );
    }
    Ok(())
}
