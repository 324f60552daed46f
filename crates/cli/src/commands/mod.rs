//! Subcommand implementations and the helpers they share.

pub mod bench;
pub mod config_cmd;
pub mod models;
pub mod onboard;
pub mod plan;
pub mod run;

use candle_core::{DType, Device, Tensor};
use std::path::Path;
use tokenfold_config::{AppConfig, Precision};
use tokenfold_reduce::ReductionEngine;
use tokenfold_telemetry::{CostModel, TelemetryEngine};
use tokenfold_vit::{TokenFoldVit, VitOutput};

/// Load the config from `path`, or the default location.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    Ok(config)
}

pub fn dtype(precision: Precision) -> DType {
    match precision {
        Precision::F32 => DType::F32,
        Precision::F16 => DType::F16,
        Precision::Bf16 => DType::BF16,
    }
}

/// Build the model the config describes, on the CPU.
pub fn build_model(config: &AppConfig) -> Result<TokenFoldVit, Box<dyn std::error::Error>> {
    let vit = config.vit_config()?;
    let engine = ReductionEngine::new(
        vit.depth,
        vit.num_prefix_tokens(),
        &config.reduction,
        &config.cache,
    )?;
    let device = Device::Cpu;
    let dtype = dtype(config.runtime.dtype);
    let model = match &config.model.weights {
        Some(path) => TokenFoldVit::from_safetensors(vit, engine, path, dtype, &device)?,
        None => {
            tracing::warn!("No weights configured; using random initialization");
            TokenFoldVit::random(vit, engine, dtype, &device)?
        }
    };
    Ok(model)
}

pub fn build_telemetry(config: &AppConfig, model: &TokenFoldVit) -> TelemetryEngine {
    let vit = model.config();
    TelemetryEngine::new(
        CostModel::new(vit.embed_dim, vit.mlp_ratio),
        config.telemetry.max_traces,
    )
}

/// A standard-normal batch shaped for `model`.
pub fn random_batch(
    model: &TokenFoldVit,
    batch: usize,
    dtype: DType,
) -> Result<Tensor, Box<dyn std::error::Error>> {
    let vit = model.config();
    let images = Tensor::randn(
        0f32,
        1f32,
        (batch, vit.in_chans, vit.image_size, vit.image_size),
        &Device::Cpu,
    )?
    .to_dtype(dtype)?;
    Ok(images)
}

/// Run `model` on `images`, tracing the pass into `telemetry` when given.
pub fn traced_forward(
    model: &TokenFoldVit,
    telemetry: Option<&TelemetryEngine>,
    label: &str,
    images: &Tensor,
) -> tokenfold_core::Result<VitOutput> {
    let Some(telemetry) = telemetry else {
        return model.forward(images);
    };

    let batch = images.dim(0)?;
    let id = telemetry.start_trace(label, batch, model.config().initial_len());
    let result = model.forward(images);
    if let Ok(output) = &result {
        for report in &output.trunk.stages {
            if let Err(e) = telemetry.record_stage(
                &id,
                report.stage,
                report.keep_rate,
                report.input_len,
                report.reduced_len,
                report.output_len,
            ) {
                tracing::warn!(error = %e, "Failed to record stage");
            }
        }
    }
    if let Err(e) = telemetry.end_trace(&id, result.is_ok()) {
        tracing::warn!(error = %e, "Failed to close pass trace");
    }
    result
}

/// Write every trace to the configured export path, if any.
pub fn export_traces(
    config: &AppConfig,
    telemetry: &TelemetryEngine,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(path) = &config.telemetry.export_path {
        std::fs::write(path, telemetry.export_json()?)?;
        println!("  Traces written to {}", path.display());
    }
    Ok(())
}
