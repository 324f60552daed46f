//! The stage controller: drives a trunk of stages and applies reduction
//! and caching between them.

use crate::cache::CrossStageCache;
use crate::reduction::reduce;
use candle_core::Tensor;
use serde::Serialize;
use tokenfold_core::{
    keep_count, CacheMode, CachePolicy, CacheSettings, Error, ReductionSchedule,
    ReductionSettings, Result, SequenceStage,
};
use tracing::{debug, info, warn};

/// Immutable reduction configuration, validated once and shared across passes.
#[derive(Debug, Clone)]
pub struct ReductionEngine {
    /// Per-stage keep rates
    schedule: ReductionSchedule,

    /// Cross-stage cache mode and recovery layers
    cache: CachePolicy,

    /// Class token plus register tokens; never discarded
    num_prefix: usize,

    /// Capture selection traces and features per stage
    capture_diagnostics: bool,

    /// Record the summary token after reducing stages and the last stage
    record_prefix_snapshots: bool,
}

impl ReductionEngine {
    /// Build an engine for a trunk of `depth` stages.
    pub fn new(
        depth: usize,
        num_prefix: usize,
        reduction: &ReductionSettings,
        cache: &CacheSettings,
    ) -> Result<Self> {
        let schedule = ReductionSchedule::new(depth, &reduction.reduction_loc, &reduction.keep_rate)?;

        let mode = CacheMode::resolve(cache.enabled, cache.include_global_pool, cache.carrier_tokens)?;
        let recovery_layers = cache.recovery_layers.clone().unwrap_or_else(|| {
            CachePolicy::derive_recovery_layers(
                schedule.reduction_loc(),
                depth,
                cache.recover_at_last,
            )
        });
        let policy = CachePolicy::new(mode, recovery_layers, depth)?
            .with_pool_prefix(cache.pool_prefix)
            .with_pool_carriers(cache.pool_carriers);

        let engine = Self::from_parts(schedule, policy, num_prefix)?
            .with_diagnostics(reduction.capture_diagnostics)
            .with_prefix_snapshots(reduction.record_prefix_snapshots);

        info!(
            depth,
            num_prefix,
            reduction_loc = ?engine.schedule.reduction_loc(),
            keep_rate = ?engine.schedule.keep_rates(),
            cache = %engine.cache.mode(),
            recovery_layers = ?engine.cache.recovery_layers(),
            "Reduction engine ready"
        );
        Ok(engine)
    }

    /// Assemble an engine from already-validated parts.
    pub fn from_parts(
        schedule: ReductionSchedule,
        cache: CachePolicy,
        num_prefix: usize,
    ) -> Result<Self> {
        if !schedule.is_empty() && num_prefix == 0 {
            return Err(Error::invalid(
                "token reduction needs at least one prefix token to score against",
            ));
        }
        if let Some(last) = cache.last_recovery().filter(|last| *last >= schedule.depth()) {
            return Err(Error::invalid(format!(
                "recovery layer {last} is out of range for depth {}",
                schedule.depth()
            )));
        }
        if schedule.is_empty() && !cache.is_enabled() {
            warn!("No reduction locations configured; every stage keeps all tokens");
        }
        Ok(Self {
            schedule,
            cache,
            num_prefix,
            capture_diagnostics: false,
            record_prefix_snapshots: false,
        })
    }

    /// An engine that never reduces or caches.
    pub fn passthrough(depth: usize, num_prefix: usize) -> Self {
        Self {
            schedule: ReductionSchedule::disabled(depth),
            cache: CachePolicy::disabled(),
            num_prefix,
            capture_diagnostics: false,
            record_prefix_snapshots: false,
        }
    }

    /// Capture per-stage selection traces and features.
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.capture_diagnostics = enabled;
        self
    }

    /// Record prefix-token snapshots during the pass.
    pub fn with_prefix_snapshots(mut self, enabled: bool) -> Self {
        self.record_prefix_snapshots = enabled;
        self
    }

    pub fn schedule(&self) -> &ReductionSchedule {
        &self.schedule
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.cache
    }

    pub fn num_prefix(&self) -> usize {
        self.num_prefix
    }

    pub fn depth(&self) -> usize {
        self.schedule.depth()
    }

    /// Stages whose output is snapshotted: every reduction stage plus the last.
    pub fn snapshot_count(&self) -> usize {
        let last = self.depth().saturating_sub(1);
        (0..self.depth())
            .filter(|stage| self.schedule.reduction_loc().contains(stage) || *stage == last)
            .count()
    }

    /// Reduce the output of `stage` according to the schedule.
    pub fn reduce(
        &self,
        tokens: &Tensor,
        attention: &Tensor,
        stage: usize,
    ) -> Result<crate::Reduction> {
        reduce(tokens, attention, self.schedule.keep_rate(stage), self.num_prefix)
    }

    /// Run `tokens [B, N, C]` through every stage.
    ///
    /// Each stage runs its token-mixing half, the scheduled reduction, its
    /// feed-forward half and then the cache step. Any failure aborts the pass.
    pub fn forward<S: SequenceStage>(&self, stages: &[S], tokens: Tensor) -> Result<ForwardOutput> {
        if stages.len() != self.depth() {
            return Err(Error::invalid(format!(
                "engine configured for {} stages, trunk has {}",
                self.depth(),
                stages.len()
            )));
        }
        let (_, initial_len, _) = tokens.dims3()?;
        if !self.schedule.is_empty() && initial_len <= self.num_prefix {
            return Err(Error::shape(
                "token sequence",
                format!("more than {} tokens", self.num_prefix),
                tokens.dims(),
            ));
        }

        let mut cache = CrossStageCache::new(&self.cache, self.num_prefix, initial_len);
        let mut reports = Vec::with_capacity(stages.len());
        let mut snapshots = Vec::new();
        let last = stages.len().saturating_sub(1);
        let mut tokens = tokens;

        for (index, stage) in stages.iter().enumerate() {
            let input_len = tokens.dim(1)?;
            let mixed = stage.transform(&tokens)?;
            let keep_rate = self.schedule.keep_rate(index);
            let reduction = reduce(&mixed.tokens, &mixed.attention, keep_rate, self.num_prefix)?;
            let reduced_len = reduction.len;

            tokens = stage.refine(&reduction.tokens)?;
            tokens = cache.step(tokens, index)?;
            let output_len = tokens.dim(1)?;

            debug!(stage = index, input_len, reduced_len, output_len, "Stage complete");

            let mut report = StageReport {
                stage: index,
                keep_rate,
                input_len,
                reduced_len,
                output_len,
                cache_entries: cache.entries().len(),
                kept_trace: None,
                discarded: None,
                features: None,
            };
            if self.capture_diagnostics {
                if let Some(selection) = &reduction.selection {
                    report.kept_trace = reduction.kept_trace();
                    report.discarded = Some(selection.discarded().to_vec());
                    report.features = Some(tokens.clone());
                } else if index == last {
                    report.features = Some(tokens.clone());
                }
            }
            reports.push(report);

            let snapshot_stage = self.schedule.reduction_loc().contains(&index) || index == last;
            if self.record_prefix_snapshots && snapshot_stage && self.num_prefix > 0 {
                snapshots.push(tokens.narrow(1, 0, 1)?.squeeze(1)?);
            }
        }

        Ok(ForwardOutput {
            tokens,
            stages: reports,
            prefix_snapshots: snapshots,
        })
    }

    /// Shape-only walk of the trunk for an input of `initial_len` tokens.
    pub fn plan(&self, initial_len: usize) -> Result<Vec<StagePlan>> {
        let carriers = self.cache.mode().carrier_count();
        let entry_width = self.cache.mode().entry_width();
        let mut len = initial_len;
        let mut buffered = 0usize;
        let mut plan = Vec::with_capacity(self.depth());

        for stage in 0..self.depth() {
            let keep_rate = self.schedule.keep_rate(stage);
            let input_len = len;
            let mut fused = false;
            if self.schedule.is_reducing(stage) {
                let candidates = len.checked_sub(self.num_prefix).filter(|c| *c > 0).ok_or_else(
                    || Error::invalid(format!("stage {stage} has no candidate tokens to reduce")),
                )?;
                let left = keep_count(keep_rate, candidates)?;
                if left < candidates {
                    len = self.num_prefix + left + 1;
                    fused = true;
                }
            }
            let reduced_len = len;

            if self.cache.is_enabled() {
                if self.cache.is_recovery(stage) {
                    len += buffered;
                    buffered = 0;
                } else if self.cache.last_recovery().is_some_and(|l| stage < l) {
                    if carriers > len {
                        return Err(Error::invalid(format!(
                            "stage {stage} has {len} tokens, fewer than {carriers} carriers"
                        )));
                    }
                    buffered += entry_width;
                }
            }

            plan.push(StagePlan {
                stage,
                keep_rate,
                input_len,
                reduced_len,
                output_len: len,
                fused,
                cached_tokens: buffered,
            });
        }
        Ok(plan)
    }
}

/// Shape-only description of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagePlan {
    pub stage: usize,
    pub keep_rate: f64,
    pub input_len: usize,
    pub reduced_len: usize,
    pub output_len: usize,
    /// A fused token was appended.
    pub fused: bool,
    /// Tokens waiting in the cache after this stage.
    pub cached_tokens: usize,
}

/// What happened at one stage of a pass.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: usize,
    pub keep_rate: f64,
    /// Sequence length entering the stage.
    pub input_len: usize,
    /// Length right after reduction.
    pub reduced_len: usize,
    /// Length after the feed-forward half and the cache step.
    pub output_len: usize,
    /// Entries buffered in the cross-stage cache after this stage.
    pub cache_entries: usize,
    /// Kept candidate indices per row, then `-1` for the fused slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kept_trace: Option<Vec<Vec<i64>>>,
    /// Discarded candidate indices per row, ascending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discarded: Option<Vec<Vec<u32>>>,
    /// Sequence leaving the stage.
    #[serde(skip)]
    pub features: Option<Tensor>,
}

/// Result of [`ReductionEngine::forward`].
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Final sequence, `[B, N_final, C]`.
    pub tokens: Tensor,
    pub stages: Vec<StageReport>,
    /// `[B, C]` summary-token snapshots, in stage order.
    pub prefix_snapshots: Vec<Tensor>,
}

impl ForwardOutput {
    /// Output length of every stage.
    pub fn trajectory(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.output_len).collect()
    }

    /// Snapshots stacked along a trailing axis, `[B, C, K]`.
    pub fn stacked_snapshots(&self) -> Result<Option<Tensor>> {
        if self.prefix_snapshots.is_empty() {
            return Ok(None);
        }
        Ok(Some(Tensor::stack(&self.prefix_snapshots, 2)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{attention_from_scores, ramp_tokens, UniformStage};
    use candle_core::Device;

    fn engine(reduction: ReductionSettings, cache: CacheSettings) -> ReductionEngine {
        ReductionEngine::new(12, 1, &reduction, &cache).unwrap()
    }

    fn settings(loc: Vec<usize>, rate: Vec<f64>) -> ReductionSettings {
        ReductionSettings {
            reduction_loc: loc,
            keep_rate: rate,
            ..ReductionSettings::default()
        }
    }

    #[test]
    fn trajectory_for_three_stage_schedule() {
        let device = Device::Cpu;
        let engine = engine(settings(vec![3, 6, 9], vec![0.9]), CacheSettings::default());
        let stages: Vec<_> = (0..12).map(|_| UniformStage::new(2)).collect();
        let out = engine.forward(&stages, ramp_tokens(1, 197, 4, &device)).unwrap();

        let trajectory = out.trajectory();
        assert_eq!(trajectory[2], 197);
        assert_eq!(trajectory[3], 179);
        assert_eq!(trajectory[6], 163);
        assert_eq!(trajectory[9], 148);
        assert_eq!(trajectory[11], 148);
        assert_eq!(out.tokens.dims(), &[1, 148, 4]);
    }

    #[test]
    fn plan_matches_forward() {
        let device = Device::Cpu;
        let cache = CacheSettings {
            enabled: true,
            include_global_pool: true,
            ..CacheSettings::default()
        };
        let engine = engine(settings(vec![3, 6, 9], vec![0.7, 0.7, 0.5]), cache);
        let stages: Vec<_> = (0..12).map(|_| UniformStage::new(1)).collect();
        let out = engine.forward(&stages, ramp_tokens(2, 50, 3, &device)).unwrap();
        let plan = engine.plan(50).unwrap();
        assert_eq!(
            plan.iter().map(|p| p.output_len).collect::<Vec<_>>(),
            out.trajectory()
        );
    }

    #[test]
    fn empty_schedule_is_identity() {
        let device = Device::Cpu;
        let engine = engine(ReductionSettings::none(), CacheSettings::default());
        let stages: Vec<_> = (0..12).map(|_| UniformStage::new(1)).collect();
        let tokens = ramp_tokens(1, 10, 2, &device);
        let out = engine.forward(&stages, tokens.clone()).unwrap();
        assert_eq!(
            out.tokens.to_vec3::<f32>().unwrap(),
            tokens.to_vec3::<f32>().unwrap()
        );
        assert!(out.stages.iter().all(|s| s.output_len == 10));
    }

    #[test]
    fn reduce_applies_the_stage_keep_rate() {
        let device = Device::Cpu;
        let engine = engine(settings(vec![3, 6], vec![0.6, 0.3]), CacheSettings::default());
        let tokens = ramp_tokens(1, 6, 2, &device);
        let attention = attention_from_scores(&[vec![0.1, 0.4, 0.05, 0.3, 0.15]], 2, &device);

        let idle = engine.reduce(&tokens, &attention, 0).unwrap();
        assert!(!idle.fired());
        assert_eq!(idle.len, 6);
        assert_eq!(
            idle.tokens.to_vec3::<f32>().unwrap(),
            tokens.to_vec3::<f32>().unwrap()
        );

        // ceil(0.6 * 5) = 3 kept
        let first = engine.reduce(&tokens, &attention, 3).unwrap();
        assert!(first.fired());
        assert_eq!(first.len, 1 + 3 + 1);
        assert_eq!(first.selection.unwrap().kept()[0], vec![1, 3, 4]);

        // ceil(0.3 * 5) = 2 kept
        let second = engine.reduce(&tokens, &attention, 6).unwrap();
        assert_eq!(second.len, 1 + 2 + 1);
        assert_eq!(second.selection.unwrap().kept()[0], vec![1, 3]);
    }

    #[test]
    fn snapshot_count_covers_reduction_and_last_stages() {
        let spread = engine(settings(vec![3, 6, 9], vec![0.7]), CacheSettings::default());
        assert_eq!(spread.snapshot_count(), 4);
        let ends_on_last = engine(settings(vec![5, 11], vec![0.7]), CacheSettings::default());
        assert_eq!(ends_on_last.snapshot_count(), 2);
        assert_eq!(ReductionEngine::passthrough(12, 1).snapshot_count(), 1);
    }

    #[test]
    fn keep_rate_length_mismatch_rejected() {
        let err = ReductionEngine::new(
            12,
            1,
            &settings(vec![3, 6, 9], vec![0.7, 0.7]),
            &CacheSettings::default(),
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn reduction_without_prefix_rejected() {
        assert!(ReductionEngine::new(
            12,
            0,
            &ReductionSettings::default(),
            &CacheSettings::default()
        )
        .is_err());
        assert!(ReductionEngine::new(12, 0, &ReductionSettings::none(), &CacheSettings::default()).is_ok());
    }

    #[test]
    fn enabled_cache_without_source_rejected() {
        let cache = CacheSettings {
            enabled: true,
            ..CacheSettings::default()
        };
        assert!(ReductionEngine::new(12, 1, &ReductionSettings::default(), &cache).is_err());
    }

    #[test]
    fn stage_count_must_match_depth() {
        let device = Device::Cpu;
        let engine = engine(ReductionSettings::default(), CacheSettings::default());
        let stages: Vec<_> = (0..4).map(|_| UniformStage::new(1)).collect();
        assert!(engine.forward(&stages, ramp_tokens(1, 10, 2, &device)).is_err());
    }

    #[test]
    fn recover_at_last_extends_recovery_layers() {
        let cache = CacheSettings {
            enabled: true,
            carrier_tokens: 2,
            recover_at_last: true,
            ..CacheSettings::default()
        };
        let engine = engine(ReductionSettings::default(), cache);
        assert_eq!(engine.cache_policy().recovery_layers(), &[3, 6, 9, 10]);
    }

    #[test]
    fn diagnostics_capture_traces() {
        let device = Device::Cpu;
        let mut reduction = settings(vec![1], vec![0.5]);
        reduction.capture_diagnostics = true;
        reduction.record_prefix_snapshots = true;
        let engine = ReductionEngine::new(3, 1, &reduction, &CacheSettings::default()).unwrap();
        let stages: Vec<_> = (0..3).map(|_| UniformStage::new(1)).collect();
        let out = engine.forward(&stages, ramp_tokens(2, 9, 2, &device)).unwrap();

        let reduced = &out.stages[1];
        let trace = reduced.kept_trace.as_ref().unwrap();
        assert_eq!(trace.len(), 2);
        // Uniform attention: ties resolve by index.
        assert_eq!(trace[0], vec![0, 1, 2, 3, -1]);
        assert_eq!(reduced.discarded.as_ref().unwrap()[0], vec![4, 5, 6, 7]);
        assert!(reduced.features.is_some());
        assert!(out.stages[0].features.is_none());
        assert!(out.stages[2].features.is_some());

        let snapshots = out.stacked_snapshots().unwrap().unwrap();
        assert_eq!(snapshots.dims(), &[2, 2, 2]);
        let json = serde_json::to_value(reduced).unwrap();
        assert_eq!(json["reduced_len"], 6);
        assert!(json.get("features").is_none());
    }

    #[test]
    fn cache_recovery_lengthens_sequence() {
        let device = Device::Cpu;
        let cache = CacheSettings {
            enabled: true,
            include_global_pool: true,
            carrier_tokens: 1,
            ..CacheSettings::default()
        };
        let engine = engine(settings(vec![3], vec![0.5]), cache);
        let stages: Vec<_> = (0..12).map(|_| UniformStage::new(1)).collect();
        let out = engine.forward(&stages, ramp_tokens(1, 21, 2, &device)).unwrap();
        // Stages 0-2 buffer [pool, carrier]; stage 3 reduces 21 → 12 then recovers 6.
        assert_eq!(out.stages[2].cache_entries, 3);
        assert_eq!(out.stages[3].reduced_len, 12);
        assert_eq!(out.stages[3].output_len, 18);
        assert_eq!(out.stages[3].cache_entries, 0);
        assert_eq!(out.trajectory()[11], 18);
    }
}
