//! Thread-safe telemetry engine: collects pass traces, prices every stage
//! with the [`CostModel`], and summarizes the compute saved by reduction.

use crate::TelemetryError;
use crate::cost::{gmacs, CostModel};
use crate::model::*;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The core telemetry engine.
///
/// Thread-safe via `RwLock`; concurrent passes can record into one engine.
pub struct TelemetryEngine {
    /// Cost model for MAC estimates.
    cost: CostModel,
    /// Recorded traces (most recent last).
    traces: RwLock<Vec<PassTrace>>,
    /// Completed traces kept before the oldest are pruned.
    max_traces: usize,
}

impl TelemetryEngine {
    pub fn new(cost: CostModel, max_traces: usize) -> Self {
        Self {
            cost,
            traces: RwLock::new(Vec::new()),
            max_traces: max_traces.max(1),
        }
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<PassTrace>> {
        self.traces.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<PassTrace>> {
        self.traces.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Trace management ──────────────────────────────────────────────

    /// Start a trace for one forward pass.
    pub fn start_trace(&self, label: impl Into<String>, batch_size: usize, initial_len: usize) -> String {
        let trace = PassTrace::new(label, batch_size, initial_len);
        let id = trace.id.clone();
        let mut traces = self.write();

        if traces.len() >= self.max_traces {
            // Oldest completed traces go first
            let drain_count = (self.max_traces / 10).max(1);
            let mut removed = 0;
            traces.retain(|t| {
                if removed >= drain_count || t.ended_at.is_none() {
                    return true;
                }
                removed += 1;
                false
            });
        }

        traces.push(trace);
        id
    }

    /// Record one stage of a running trace, pricing it against the dense trunk.
    pub fn record_stage(
        &self,
        trace_id: &str,
        stage: usize,
        keep_rate: f64,
        input_len: usize,
        reduced_len: usize,
        output_len: usize,
    ) -> Result<(), TelemetryError> {
        let mut traces = self.write();
        let trace = traces
            .iter_mut()
            .find(|t| t.id == trace_id)
            .ok_or_else(|| TelemetryError::UnknownTrace(trace_id.to_string()))?;
        let span = StageSpan {
            stage,
            keep_rate,
            input_len,
            reduced_len,
            output_len,
            macs: self.cost.stage_macs(input_len, reduced_len),
            baseline_macs: self.cost.dense_stage_macs(trace.initial_len),
        };
        trace.add_stage(span);
        Ok(())
    }

    /// End a trace.
    pub fn end_trace(&self, trace_id: &str, success: bool) -> Result<(), TelemetryError> {
        let mut traces = self.write();
        let trace = traces
            .iter_mut()
            .find(|t| t.id == trace_id)
            .ok_or_else(|| TelemetryError::UnknownTrace(trace_id.to_string()))?;
        trace.end(success);
        tracing::debug!(
            trace_id,
            stages = trace.stages.len(),
            final_len = trace.final_len(),
            duration_ms = trace.duration_ms,
            "Pass trace closed"
        );
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn get_trace(&self, trace_id: &str) -> Option<PassTrace> {
        self.read().iter().find(|t| t.id == trace_id).cloned()
    }

    /// Most recent traces first.
    pub fn recent_traces(&self, limit: usize) -> Vec<PassTrace> {
        self.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn trace_count(&self) -> usize {
        self.read().len()
    }

    /// Aggregate every successfully completed trace.
    pub fn summary(&self) -> SavingsSummary {
        let traces = self.read();
        let done: Vec<&PassTrace> = traces
            .iter()
            .filter(|t| t.success == Some(true))
            .collect();

        let macs: u64 = done.iter().map(|t| t.total_macs()).sum();
        let baseline: u64 = done.iter().map(|t| t.baseline_macs()).sum();
        let duration: u64 = done.iter().filter_map(|t| t.duration_ms).sum();
        let count = done.len() as u64;

        SavingsSummary {
            trace_count: count,
            images: done.iter().map(|t| t.batch_size as u64).sum(),
            tokens_processed: done.iter().map(|t| t.tokens_processed()).sum(),
            baseline_tokens: done.iter().map(|t| t.baseline_tokens()).sum(),
            gmacs: gmacs(macs),
            baseline_gmacs: gmacs(baseline),
            compute_saved: if baseline == 0 {
                0.0
            } else {
                1.0 - macs as f64 / baseline as f64
            },
            mean_duration_ms: if count == 0 {
                0.0
            } else {
                duration as f64 / count as f64
            },
            from: done.iter().map(|t| t.started_at).min(),
            to: done.iter().filter_map(|t| t.ended_at).max(),
        }
    }

    /// All traces as pretty JSON.
    pub fn export_json(&self) -> Result<String, TelemetryError> {
        Ok(serde_json::to_string_pretty(&*self.read())?)
    }

    /// Drop every trace.
    pub fn clear(&self) -> usize {
        let mut traces = self.write();
        let count = traces.len();
        traces.clear();
        count
    }
}
