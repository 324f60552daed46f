//! End-to-end tests for the TokenFold pipeline.
//!
//! These exercise the full path from a TOML config file through engine and
//! model construction, a forward pass, and telemetry accounting.

use std::io::Write;

use candle_core::{DType, Device, Tensor};
use tokenfold_config::AppConfig;
use tokenfold_reduce::ReductionEngine;
use tokenfold_telemetry::{CostModel, TelemetryEngine};
use tokenfold_vit::TokenFoldVit;

// ── Helpers ──────────────────────────────────────────────────────────────

fn config_from(toml_str: &str) -> AppConfig {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(toml_str.as_bytes()).unwrap();
    AppConfig::load_from(file.path()).unwrap()
}

/// vit-tiny on 64px images: 16 patches plus the class token.
const SMALL_TRUNK: &str = r#"
[model]
preset = "vit-tiny"
image_size = 64
depth = 4
num_classes = 10

[reduction]
reduction_loc = [1, 2]
keep_rate = [0.5]
"#;

fn build(config: &AppConfig) -> TokenFoldVit {
    let vit = config.vit_config().unwrap();
    let engine = ReductionEngine::new(
        vit.depth,
        vit.num_prefix_tokens(),
        &config.reduction,
        &config.cache,
    )
    .unwrap();
    TokenFoldVit::random(vit, engine, DType::F32, &Device::Cpu).unwrap()
}

fn images(model: &TokenFoldVit, batch: usize) -> Tensor {
    let vit = model.config();
    Tensor::randn(
        0f32,
        1f32,
        (batch, vit.in_chans, vit.image_size, vit.image_size),
        &Device::Cpu,
    )
    .unwrap()
}

fn record(telemetry: &TelemetryEngine, model: &TokenFoldVit, batch: usize) -> String {
    let output = model.forward(&images(model, batch)).unwrap();
    let id = telemetry.start_trace("vit-tiny", batch, model.config().initial_len());
    for report in &output.trunk.stages {
        telemetry
            .record_stage(
                &id,
                report.stage,
                report.keep_rate,
                report.input_len,
                report.reduced_len,
                report.output_len,
            )
            .unwrap();
    }
    telemetry.end_trace(&id, true).unwrap();
    id
}

// ═══════════════════════════════════════════════════════════════════════════
// Forward passes
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn e2e_config_to_logits() {
    let config = config_from(SMALL_TRUNK);
    let model = build(&config);
    let output = model.forward(&images(&model, 2)).unwrap();

    assert_eq!(output.logits.dims(), &[2, 10]);
    // 17 → (1 + 8 + 1) → (1 + 5 + 1)
    assert_eq!(output.trunk.trajectory(), vec![17, 10, 7, 7]);
    assert_eq!(output.trunk.tokens.dims(), &[2, 7, 192]);
}

#[test]
fn e2e_plan_matches_forward() {
    let config = config_from(SMALL_TRUNK);
    let model = build(&config);
    let plan = model.engine().plan(model.config().initial_len()).unwrap();
    let output = model.forward(&images(&model, 1)).unwrap();

    let planned: Vec<usize> = plan.iter().map(|s| s.output_len).collect();
    assert_eq!(planned, output.trunk.trajectory());
    let fused: Vec<bool> = plan.iter().map(|s| s.fused).collect();
    assert_eq!(fused, vec![false, true, true, false]);
}

#[test]
fn e2e_cache_recovers_at_reduction_stage() {
    let config = config_from(
        r#"
[model]
preset = "vit-tiny"
image_size = 64
depth = 4
num_classes = 10

[reduction]
reduction_loc = [2]
keep_rate = [0.5]

[cache]
enabled = true
include_global_pool = true
carrier_tokens = 1
"#,
    );
    // Carriers follow the cache when the model does not override them.
    assert_eq!(config.vit_config().unwrap().carrier_tokens, 1);

    let model = build(&config);
    let output = model.forward(&images(&model, 1)).unwrap();
    // Stages 0 and 1 buffer (pool + carrier) each; stage 2 reduces 18 → 11 and recovers 4.
    assert_eq!(output.trunk.trajectory(), vec![18, 18, 15, 15]);
    let entries: Vec<usize> = output.trunk.stages.iter().map(|s| s.cache_entries).collect();
    assert_eq!(entries, vec![1, 2, 0, 0]);

    let plan = model.engine().plan(18).unwrap();
    assert_eq!(plan.iter().map(|s| s.output_len).collect::<Vec<_>>(), vec![18, 18, 15, 15]);
}

#[test]
fn e2e_diagnostics_trace_each_reducing_stage() {
    let mut config = config_from(SMALL_TRUNK);
    config.reduction.capture_diagnostics = true;
    config.reduction.record_prefix_snapshots = true;
    let model = build(&config);
    let output = model.forward(&images(&model, 1)).unwrap();

    let traced: Vec<usize> = output
        .trunk
        .stages
        .iter()
        .filter(|s| s.kept_trace.is_some())
        .map(|s| s.stage)
        .collect();
    assert_eq!(traced, vec![1, 2]);

    let trace = &output.trunk.stages[1].kept_trace.as_ref().unwrap()[0];
    assert_eq!(trace.len(), 9);
    assert_eq!(trace.last(), Some(&-1));

    // Snapshots after stages 1, 2 and the last stage.
    let snapshots = output.trunk.stacked_snapshots().unwrap().unwrap();
    assert_eq!(snapshots.dims(), &[1, 192, 3]);

    let json = serde_json::to_value(&output.trunk.stages).unwrap();
    assert_eq!(json[1]["reduced_len"], 10);
    assert!(json[0].get("kept_trace").is_none());
}

#[test]
fn e2e_no_reduction_keeps_every_token() {
    let config = config_from(
        r#"
[model]
preset = "vit-tiny"
image_size = 64
depth = 3
num_classes = 0

[reduction]
reduction_loc = []
keep_rate = []
"#,
    );
    let model = build(&config);
    let output = model.forward(&images(&model, 1)).unwrap();
    assert_eq!(output.trunk.trajectory(), vec![17, 17, 17]);
    // Headless: logits are the pooled features.
    assert_eq!(output.logits.dims(), &[1, 192]);
}

// ═══════════════════════════════════════════════════════════════════════════
// Config rejection
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn e2e_out_of_range_schedule_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[model]
preset = "vit-tiny"
depth = 4

[reduction]
reduction_loc = [1, 7]
keep_rate = [0.5]
"#,
    )
    .unwrap();
    assert!(AppConfig::load_from(file.path()).is_err());
}

// ═══════════════════════════════════════════════════════════════════════════
// Telemetry
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn e2e_telemetry_reports_savings() {
    let config = config_from(SMALL_TRUNK);
    let model = build(&config);
    let vit = model.config();
    let telemetry = TelemetryEngine::new(CostModel::new(vit.embed_dim, vit.mlp_ratio), 16);

    let id = record(&telemetry, &model, 2);
    record(&telemetry, &model, 1);

    let trace = telemetry.get_trace(&id).unwrap();
    assert_eq!(trace.final_len(), 7);
    assert_eq!(trace.stages.iter().filter(|s| s.reduced()).count(), 2);

    let summary = telemetry.summary();
    assert_eq!(summary.trace_count, 2);
    assert_eq!(summary.images, 3);
    // Stage inputs: 17 + 17 + 10 + 7 per image.
    assert_eq!(summary.tokens_processed, 3 * 51);
    assert_eq!(summary.baseline_tokens, 3 * 4 * 17);
    assert!(summary.compute_saved > 0.0);
}

#[test]
fn e2e_dense_trunk_saves_nothing() {
    let mut config = config_from(SMALL_TRUNK);
    config.reduction.reduction_loc.clear();
    config.reduction.keep_rate.clear();
    let model = build(&config);
    let vit = model.config();
    let telemetry = TelemetryEngine::new(CostModel::new(vit.embed_dim, vit.mlp_ratio), 16);

    record(&telemetry, &model, 1);
    let summary = telemetry.summary();
    assert_eq!(summary.gmacs, summary.baseline_gmacs);
    assert_eq!(summary.compute_saved, 0.0);
}
