//! Cross-stage cache policy.
//!
//! The cache carries summary signals past reduction boundaries: a global
//! average pool of the current tokens, persistent carrier tokens sliced from
//! the sequence tail, or both. Which of these is active is resolved once into
//! a [`CacheMode`] so the forward pass only ever matches on it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// What each cache entry is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheMode {
    /// No cross-stage cache.
    Disabled,
    /// One pooled token per entry.
    GlobalPoolOnly,
    /// `count` carrier tokens per entry.
    CarrierTokensOnly { count: usize },
    /// One pooled token followed by `count` carrier tokens per entry.
    Both { count: usize },
}

impl CacheMode {
    /// Resolve the mode from the raw configuration flags.
    ///
    /// An enabled cache with neither a pooled carrier nor carrier tokens has
    /// nothing to carry and is rejected.
    pub fn resolve(enabled: bool, include_global_pool: bool, carrier_tokens: usize) -> Result<Self> {
        if !enabled {
            return Ok(Self::Disabled);
        }
        match (include_global_pool, carrier_tokens) {
            (false, 0) => Err(Error::invalid(
                "cross-stage cache needs carrier tokens or the global-pool carrier",
            )),
            (true, 0) => Ok(Self::GlobalPoolOnly),
            (false, count) => Ok(Self::CarrierTokensOnly { count }),
            (true, count) => Ok(Self::Both { count }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn includes_global_pool(&self) -> bool {
        matches!(self, Self::GlobalPoolOnly | Self::Both { .. })
    }

    /// Carrier tokens sliced from the sequence tail per entry.
    pub fn carrier_count(&self) -> usize {
        match self {
            Self::CarrierTokensOnly { count } | Self::Both { count } => *count,
            Self::Disabled | Self::GlobalPoolOnly => 0,
        }
    }

    /// Tokens contributed by one cache entry.
    pub fn entry_width(&self) -> usize {
        usize::from(self.includes_global_pool()) + self.carrier_count()
    }
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::GlobalPoolOnly => write!(f, "global_pool"),
            Self::CarrierTokensOnly { count } => write!(f, "carriers({count})"),
            Self::Both { count } => write!(f, "global_pool+carriers({count})"),
        }
    }
}

/// Validated cache policy: mode plus the stages that consume the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    mode: CacheMode,
    recovery_layers: Vec<usize>,
    pool_prefix: bool,
    pool_carriers: bool,
}

impl CachePolicy {
    /// A policy that never caches.
    pub fn disabled() -> Self {
        Self {
            mode: CacheMode::Disabled,
            recovery_layers: vec![],
            pool_prefix: false,
            pool_carriers: false,
        }
    }

    /// Build a policy for a trunk of `depth` stages.
    ///
    /// `recovery_layers` must be strictly ascending, below `depth`, and
    /// non-empty whenever the cache is enabled.
    pub fn new(mode: CacheMode, recovery_layers: Vec<usize>, depth: usize) -> Result<Self> {
        if !mode.is_enabled() {
            return Ok(Self::disabled());
        }
        if recovery_layers.is_empty() {
            return Err(Error::invalid(
                "cross-stage cache is enabled but no recovery layer consumes it",
            ));
        }
        for pair in recovery_layers.windows(2) {
            if pair[0] >= pair[1] {
                return Err(Error::invalid(format!(
                    "recovery layers must be strictly ascending, got {recovery_layers:?}"
                )));
            }
        }
        if let Some(last) = recovery_layers.last().filter(|last| **last >= depth) {
            return Err(Error::invalid(format!(
                "recovery layer {last} is out of range for depth {depth}"
            )));
        }
        Ok(Self {
            mode,
            recovery_layers,
            pool_prefix: false,
            pool_carriers: false,
        })
    }

    /// Include the prefix tokens in the global average pool.
    pub fn with_pool_prefix(mut self, pool_prefix: bool) -> Self {
        self.pool_prefix = pool_prefix;
        self
    }

    /// Include the persistent carrier tokens in the initial pooling range.
    pub fn with_pool_carriers(mut self, pool_carriers: bool) -> Self {
        self.pool_carriers = pool_carriers;
        self
    }

    /// Recovery layers implied by a reduction schedule: every reduction
    /// location, plus stage `depth - 2` when `recover_at_last` is set.
    pub fn derive_recovery_layers(
        reduction_loc: &[usize],
        depth: usize,
        recover_at_last: bool,
    ) -> Vec<usize> {
        let mut layers = reduction_loc.to_vec();
        if recover_at_last && depth >= 2 {
            layers.push(depth - 2);
        }
        layers.sort_unstable();
        layers.dedup();
        layers
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.mode.is_enabled()
    }

    pub fn recovery_layers(&self) -> &[usize] {
        &self.recovery_layers
    }

    pub fn is_recovery(&self, stage: usize) -> bool {
        self.recovery_layers.binary_search(&stage).is_ok()
    }

    pub fn last_recovery(&self) -> Option<usize> {
        self.recovery_layers.last().copied()
    }

    pub fn pool_prefix(&self) -> bool {
        self.pool_prefix
    }

    pub fn pool_carriers(&self) -> bool {
        self.pool_carriers
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_resolution() {
        assert_eq!(CacheMode::resolve(false, true, 4).unwrap(), CacheMode::Disabled);
        assert_eq!(CacheMode::resolve(true, true, 0).unwrap(), CacheMode::GlobalPoolOnly);
        assert_eq!(
            CacheMode::resolve(true, false, 2).unwrap(),
            CacheMode::CarrierTokensOnly { count: 2 }
        );
        assert_eq!(CacheMode::resolve(true, true, 3).unwrap(), CacheMode::Both { count: 3 });
    }

    #[test]
    fn enabled_cache_without_source_rejected() {
        let err = CacheMode::resolve(true, false, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn entry_width_counts_pool_and_carriers() {
        assert_eq!(CacheMode::Disabled.entry_width(), 0);
        assert_eq!(CacheMode::GlobalPoolOnly.entry_width(), 1);
        assert_eq!(CacheMode::CarrierTokensOnly { count: 2 }.entry_width(), 2);
        assert_eq!(CacheMode::Both { count: 2 }.entry_width(), 3);
    }

    #[test]
    fn policy_requires_recovery_layers() {
        assert!(CachePolicy::new(CacheMode::GlobalPoolOnly, vec![], 12).is_err());
        assert!(CachePolicy::new(CacheMode::GlobalPoolOnly, vec![6, 3], 12).is_err());
        assert!(CachePolicy::new(CacheMode::GlobalPoolOnly, vec![3, 12], 12).is_err());
        let policy = CachePolicy::new(CacheMode::GlobalPoolOnly, vec![3, 6, 9], 12).unwrap();
        assert!(policy.is_recovery(6));
        assert!(!policy.is_recovery(7));
        assert_eq!(policy.last_recovery(), Some(9));
    }

    #[test]
    fn disabled_policy_ignores_layers() {
        let policy = CachePolicy::new(CacheMode::Disabled, vec![], 12).unwrap();
        assert!(!policy.is_enabled());
        assert_eq!(policy.last_recovery(), None);
    }

    #[test]
    fn recover_at_last_appends_penultimate_stage() {
        assert_eq!(
            CachePolicy::derive_recovery_layers(&[3, 6, 9], 12, true),
            vec![3, 6, 9, 10]
        );
        assert_eq!(
            CachePolicy::derive_recovery_layers(&[3, 10], 12, true),
            vec![3, 10]
        );
        assert_eq!(CachePolicy::derive_recovery_layers(&[3], 12, false), vec![3]);
    }

    #[test]
    fn mode_serializes_tagged() {
        let json = serde_json::to_string(&CacheMode::Both { count: 2 }).unwrap();
        assert!(json.contains("\"kind\":\"both\""));
        assert_eq!(CacheMode::Both { count: 2 }.to_string(), "global_pool+carriers(2)");
    }
}
