//! `tokenfold bench` — Concurrent passes and a compute-savings summary.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub async fn run(path: Option<&Path>, passes: usize) -> Result<(), Box<dyn std::error::Error>> {
    if passes == 0 {
        return Err("--passes must be > 0".into());
    }
    let config = super::load_config(path)?;
    let model = Arc::new(super::build_model(&config)?);
    let telemetry = Arc::new(super::build_telemetry(&config, &model));
    let dtype = super::dtype(config.runtime.dtype);
    let batch = config.runtime.batch_size;
    let workers = config.runtime.concurrency.min(passes);
    let label = config.model.preset.clone();

    println!(
        "⏱️  {label}: {passes} passes, batch {batch}, {workers} workers, {}",
        config.runtime.dtype
    );

    let started = Instant::now();
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        // Spread the remainder over the first workers.
        let share = passes / workers + usize::from(worker < passes % workers);
        let model = Arc::clone(&model);
        let telemetry = Arc::clone(&telemetry);
        let label = label.clone();
        handles.push(tokio::task::spawn_blocking(move || -> Result<usize, String> {
            for _ in 0..share {
                let images =
                    super::random_batch(&model, batch, dtype).map_err(|e| e.to_string())?;
                super::traced_forward(&model, Some(&*telemetry), &label, &images)
                    .map_err(|e| e.to_string())?;
            }
            Ok(share)
        }));
    }

    let mut completed = 0;
    for handle in handles {
        completed += handle.await??;
    }
    let elapsed = started.elapsed().as_secs_f64();
    tracing::debug!(completed, elapsed, "Benchmark finished");

    let summary = telemetry.summary();
    println!("─────────────────────────────────────");
    println!("  Passes:           {}", summary.trace_count);
    println!("  Images:           {}", summary.images);
    println!(
        "  Throughput:       {:.1} images/s",
        summary.images as f64 / elapsed.max(f64::EPSILON)
    );
    println!("  Mean pass:        {:.1} ms", summary.mean_duration_ms);
    println!(
        "  Tokens processed: {} ({} dense)",
        summary.tokens_processed, summary.baseline_tokens
    );
    println!(
        "  Compute:          {:.2} GMACs ({:.2} dense)",
        summary.gmacs, summary.baseline_gmacs
    );
    println!("  Saved:            {:.1}%", summary.compute_saved * 100.0);

    super::export_traces(&config, &telemetry)?;
    Ok(())
}
