//! `tokenfold plan` — Shape-only walk of the configured trunk.

use std::path::Path;
use tokenfold_reduce::ReductionEngine;
use tokenfold_telemetry::{gmacs, CostModel};

pub async fn run(path: Option<&Path>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(path)?;
    let vit = config.vit_config()?;
    let engine = ReductionEngine::new(
        vit.depth,
        vit.num_prefix_tokens(),
        &config.reduction,
        &config.cache,
    )?;
    let initial_len = vit.initial_len();
    let plan = engine.plan(initial_len)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let cost = CostModel::new(vit.embed_dim, vit.mlp_ratio);
    println!(
        "📐 {} — {} tokens in, {} prefix",
        config.model.preset,
        initial_len,
        vit.num_prefix_tokens()
    );
    println!(
        "{:>5} {:>6} {:>7} {:>8} {:>7} {:>6} {:>8}",
        "Stage", "Keep", "Input", "Reduced", "Output", "Cache", "GMACs"
    );
    println!("{}", "─".repeat(54));

    let mut total = 0u64;
    for stage in &plan {
        let macs = cost.stage_macs(stage.input_len, stage.reduced_len);
        total += macs;
        let marker = if stage.fused { "*" } else { " " };
        println!(
            "{:>5} {:>6.2} {:>7} {:>7}{} {:>7} {:>6} {:>8.3}",
            stage.stage,
            stage.keep_rate,
            stage.input_len,
            stage.reduced_len,
            marker,
            stage.output_len,
            stage.cached_tokens,
            gmacs(macs),
        );
    }

    let baseline = cost.dense_stage_macs(initial_len) * vit.depth as u64;
    println!("{}", "─".repeat(54));
    println!(
        "  Trunk: {:.3} GMACs vs {:.3} dense ({:.1}% saved)",
        gmacs(total),
        gmacs(baseline),
        if baseline == 0 {
            0.0
        } else {
            (1.0 - total as f64 / baseline as f64) * 100.0
        }
    );
    println!("  * stage appends a fused token");
    Ok(())
}
