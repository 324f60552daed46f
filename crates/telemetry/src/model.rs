//! Data model for pass traces, stage spans and savings summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Stage span ────────────────────────────────────────────────────────────

/// One stage of a traced pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpan {
    /// Stage index in the trunk.
    pub stage: usize,
    /// Configured keep rate.
    pub keep_rate: f64,
    /// Tokens entering the stage.
    pub input_len: usize,
    /// Tokens after reduction.
    pub reduced_len: usize,
    /// Tokens leaving the stage (after cache recovery).
    pub output_len: usize,
    /// Estimated MACs per image.
    pub macs: u64,
    /// Estimated MACs per image without any reduction.
    pub baseline_macs: u64,
}

impl StageSpan {
    /// Whether tokens were dropped at this stage.
    pub fn reduced(&self) -> bool {
        self.reduced_len < self.input_len
    }
}

// ── Trace ─────────────────────────────────────────────────────────────────

/// All stages of one forward pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassTrace {
    /// Unique trace id.
    pub id: String,
    /// Model label (preset name).
    pub label: String,
    /// Images in the batch.
    pub batch_size: usize,
    /// Sequence length entering the trunk.
    pub initial_len: usize,
    /// Stages in order.
    pub stages: Vec<StageSpan>,
    /// When the pass started.
    pub started_at: DateTime<Utc>,
    /// When the pass ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall time in milliseconds (computed on end).
    pub duration_ms: Option<u64>,
    /// Whether the pass completed.
    pub success: Option<bool>,
}

impl PassTrace {
    pub fn new(label: impl Into<String>, batch_size: usize, initial_len: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            batch_size,
            initial_len,
            stages: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            success: None,
        }
    }

    pub fn add_stage(&mut self, span: StageSpan) {
        self.stages.push(span);
    }

    /// Mark the trace as complete.
    pub fn end(&mut self, success: bool) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.success = Some(success);
    }

    /// Estimated MACs for the whole batch.
    pub fn total_macs(&self) -> u64 {
        self.stages.iter().map(|s| s.macs).sum::<u64>() * self.batch_size as u64
    }

    /// Estimated MACs for the whole batch without reduction.
    pub fn baseline_macs(&self) -> u64 {
        self.stages.iter().map(|s| s.baseline_macs).sum::<u64>() * self.batch_size as u64
    }

    /// Token-stage visits: Σ input length over stages, times batch.
    pub fn tokens_processed(&self) -> u64 {
        self.stages.iter().map(|s| s.input_len as u64).sum::<u64>() * self.batch_size as u64
    }

    /// Token-stage visits without reduction.
    pub fn baseline_tokens(&self) -> u64 {
        (self.initial_len * self.stages.len() * self.batch_size) as u64
    }

    /// Final sequence length.
    pub fn final_len(&self) -> usize {
        self.stages.last().map_or(self.initial_len, |s| s.output_len)
    }
}

// ── Aggregated views ──────────────────────────────────────────────────────

/// Savings aggregated over completed traces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavingsSummary {
    /// Completed traces counted.
    pub trace_count: u64,
    /// Images across those traces.
    pub images: u64,
    pub tokens_processed: u64,
    pub baseline_tokens: u64,
    /// Estimated GMACs with reduction.
    pub gmacs: f64,
    /// Estimated GMACs without reduction.
    pub baseline_gmacs: f64,
    /// `1 - gmacs / baseline_gmacs`.
    pub compute_saved: f64,
    /// Mean wall time per pass.
    pub mean_duration_ms: f64,
    /// Time window start.
    pub from: Option<DateTime<Utc>>,
    /// Time window end.
    pub to: Option<DateTime<Utc>>,
}
