//! Reduction schedule — which stages reduce, and by how much.
//!
//! Built once from a sparse `(reduction_loc, keep_rate)` description. Every
//! stage that is not listed keeps all of its tokens (rate `1.0`).

use crate::error::{Error, Result};

/// Keep rate used by stages that do not reduce.
pub const FULL_KEEP: f64 = 1.0;

/// Immutable per-stage keep-rate table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionSchedule {
    reduction_loc: Vec<usize>,
    keep_rates: Vec<f64>,
    per_stage: Vec<f64>,
}

impl ReductionSchedule {
    /// Build and validate a schedule for a trunk of `depth` stages.
    ///
    /// `keep_rate` is either aligned with `reduction_loc` or a single value
    /// broadcast to every location. Locations must be strictly ascending and
    /// below `depth`; rates must lie in `(0, 1]`.
    pub fn new(depth: usize, reduction_loc: &[usize], keep_rate: &[f64]) -> Result<Self> {
        let keep_rates: Vec<f64> = if keep_rate.len() == 1 {
            vec![keep_rate[0]; reduction_loc.len()]
        } else if keep_rate.len() == reduction_loc.len() {
            keep_rate.to_vec()
        } else {
            return Err(Error::invalid(format!(
                "mismatch between reduction locations {reduction_loc:?} and keep rates {keep_rate:?}"
            )));
        };

        for rate in &keep_rates {
            validate_keep_rate(*rate)?;
        }

        for pair in reduction_loc.windows(2) {
            if pair[0] >= pair[1] {
                return Err(Error::invalid(format!(
                    "reduction locations must be strictly ascending, got {reduction_loc:?}"
                )));
            }
        }

        let mut per_stage = vec![FULL_KEEP; depth];
        for (loc, rate) in reduction_loc.iter().zip(&keep_rates) {
            let slot = per_stage.get_mut(*loc).ok_or_else(|| {
                Error::invalid(format!(
                    "reduction location {loc} is out of range for depth {depth}"
                ))
            })?;
            *slot = *rate;
        }

        Ok(Self {
            reduction_loc: reduction_loc.to_vec(),
            keep_rates,
            per_stage,
        })
    }

    /// A schedule that never reduces.
    pub fn disabled(depth: usize) -> Self {
        Self {
            reduction_loc: vec![],
            keep_rates: vec![],
            per_stage: vec![FULL_KEEP; depth],
        }
    }

    /// Number of stages this schedule covers.
    pub fn depth(&self) -> usize {
        self.per_stage.len()
    }

    /// Keep rate for `stage` (`1.0` outside the schedule).
    pub fn keep_rate(&self, stage: usize) -> f64 {
        self.per_stage.get(stage).copied().unwrap_or(FULL_KEEP)
    }

    /// Whether `stage` is configured to reduce.
    pub fn is_reducing(&self, stage: usize) -> bool {
        self.keep_rate(stage) < FULL_KEEP
    }

    /// Stage indices that reduce, ascending.
    pub fn reduction_loc(&self) -> &[usize] {
        &self.reduction_loc
    }

    /// Keep rates aligned with [`reduction_loc`](Self::reduction_loc).
    pub fn keep_rates(&self) -> &[f64] {
        &self.keep_rates
    }

    /// Dense per-stage table.
    pub fn per_stage(&self) -> &[f64] {
        &self.per_stage
    }

    /// True when no stage reduces.
    pub fn is_empty(&self) -> bool {
        self.reduction_loc.is_empty()
    }
}

/// Reject keep rates outside `(0, 1]` (NaN included).
pub fn validate_keep_rate(rate: f64) -> Result<()> {
    if rate > 0.0 && rate <= FULL_KEEP {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "keep_rate must be in (0, 1], got {rate}"
        )))
    }
}

/// Number of tokens kept out of `candidates`: `ceil(keep_rate * candidates)`.
///
/// Fails when fewer than one token would survive.
pub fn keep_count(keep_rate: f64, candidates: usize) -> Result<usize> {
    validate_keep_rate(keep_rate)?;
    let left = (keep_rate * candidates as f64).ceil() as usize;
    if left < 1 {
        return Err(Error::invalid(format!(
            "keep_rate {keep_rate} keeps no tokens out of {candidates}"
        )));
    }
    Ok(left)
}
