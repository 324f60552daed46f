//! Raw reduction and cache settings, as they appear in configuration files.
//!
//! These are unvalidated; the reduction engine turns them into a
//! [`ReductionSchedule`](crate::ReductionSchedule) and a
//! [`CachePolicy`](crate::CachePolicy) once, at construction.

use serde::{Deserialize, Serialize};

/// Where and how much to reduce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionSettings {
    /// Stage indices that reduce, ascending.
    #[serde(default = "default_reduction_loc")]
    pub reduction_loc: Vec<usize>,

    /// One rate per location, or a single rate for all of them.
    #[serde(default = "default_keep_rate")]
    pub keep_rate: Vec<f64>,

    /// Keep per-stage selection traces and post-stage features.
    #[serde(default)]
    pub capture_diagnostics: bool,

    /// Record the summary token after every reducing stage and the last stage.
    #[serde(default)]
    pub record_prefix_snapshots: bool,
}

fn default_reduction_loc() -> Vec<usize> {
    vec![3, 6, 9]
}
fn default_keep_rate() -> Vec<f64> {
    vec![0.7]
}

impl Default for ReductionSettings {
    fn default() -> Self {
        Self {
            reduction_loc: default_reduction_loc(),
            keep_rate: default_keep_rate(),
            capture_diagnostics: false,
            record_prefix_snapshots: false,
        }
    }
}

impl ReductionSettings {
    /// Settings that never reduce.
    pub fn none() -> Self {
        Self {
            reduction_loc: vec![],
            keep_rate: vec![],
            ..Self::default()
        }
    }
}

/// Cross-stage cache flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Carry a global average pool of the current tokens.
    #[serde(default)]
    pub include_global_pool: bool,

    /// Persistent carrier tokens sliced from the sequence tail.
    #[serde(default)]
    pub carrier_tokens: usize,

    /// Explicit recovery stages; derived from the reduction locations when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_layers: Option<Vec<usize>>,

    /// Also recover at stage `depth - 2` (derived recovery layers only).
    #[serde(default)]
    pub recover_at_last: bool,

    /// Include prefix tokens in the global pool.
    #[serde(default)]
    pub pool_prefix: bool,

    /// Include carrier tokens in the initial pooling range.
    #[serde(default)]
    pub pool_carriers: bool,
}
