//! `tokenfold run` — One forward pass with a per-stage report.

use std::path::Path;
use std::time::Instant;

pub async fn run(
    path: Option<&Path>,
    batch: Option<usize>,
    trace: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(path)?;
    if let Some(batch) = batch {
        config.runtime.batch_size = batch;
    }
    if trace {
        config.reduction.capture_diagnostics = true;
    }
    config.validate()?;

    let model = super::build_model(&config)?;
    let telemetry = super::build_telemetry(&config, &model);
    let dtype = super::dtype(config.runtime.dtype);
    let batch = config.runtime.batch_size;
    let images = super::random_batch(&model, batch, dtype)?;

    let started = Instant::now();
    let output = super::traced_forward(
        &model,
        config.telemetry.enabled.then_some(&telemetry),
        &config.model.preset,
        &images,
    )?;
    let elapsed = started.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&output.trunk.stages)?);
        return Ok(());
    }

    println!(
        "🚀 {} — batch {}, {} in {:.1} ms",
        config.model.preset,
        batch,
        config.runtime.dtype,
        elapsed.as_secs_f64() * 1000.0
    );
    println!(
        "{:>5} {:>6} {:>7} {:>8} {:>7} {:>6}",
        "Stage", "Keep", "Input", "Reduced", "Output", "Cache"
    );
    println!("{}", "─".repeat(44));
    for report in &output.trunk.stages {
        println!(
            "{:>5} {:>6.2} {:>7} {:>8} {:>7} {:>6}",
            report.stage,
            report.keep_rate,
            report.input_len,
            report.reduced_len,
            report.output_len,
            report.cache_entries,
        );
        if let Some(kept) = report.kept_trace.as_ref().and_then(|rows| rows.first()) {
            println!("        kept (row 0): {kept:?}");
        }
    }

    println!();
    println!("  Output:     {:?}", output.logits.dims());
    if model.config().num_classes > 0 {
        let predictions = output.logits.argmax(1)?.to_vec1::<u32>()?;
        println!("  Top class:  {predictions:?}");
    }

    if config.telemetry.enabled {
        let summary = telemetry.summary();
        println!(
            "  Compute:    {:.3} GMACs vs {:.3} dense ({:.1}% saved)",
            summary.gmacs,
            summary.baseline_gmacs,
            summary.compute_saved * 100.0
        );
        super::export_traces(&config, &telemetry)?;
    }
    Ok(())
}
