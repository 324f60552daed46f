//! Cross-stage cache — carries summary signals forward between stages.
//!
//! Per pass, the cache alternates between two phases driven by the policy's
//! sorted recovery list:
//!
//! - at a recovery stage, buffered entries are appended to the sequence tail
//!   and the buffer is cleared;
//! - at any other stage before the last recovery stage, one entry is buffered:
//!   the global average pool of the current tokens and/or the persistent
//!   carrier tokens sliced from the tail.
//!
//! The buffer never outlives the pass that created it.

use candle_core::Tensor;
use tokenfold_core::{CacheMode, CachePolicy, Error, Result};
use tracing::trace;

/// Per-call cache state.
#[derive(Debug)]
pub struct CrossStageCache<'a> {
    policy: &'a CachePolicy,
    num_prefix: usize,
    buffer: Vec<Tensor>,
    pool_end: usize,
}

impl<'a> CrossStageCache<'a> {
    /// Start a pass over a sequence of `initial_len` tokens.
    pub fn new(policy: &'a CachePolicy, num_prefix: usize, initial_len: usize) -> Self {
        let carriers = policy.mode().carrier_count();
        let pool_end = if policy.pool_carriers() {
            initial_len
        } else {
            initial_len.saturating_sub(carriers)
        };
        Self {
            policy,
            num_prefix,
            buffer: Vec::new(),
            pool_end,
        }
    }

    /// Buffered entries, in accumulation order.
    pub fn entries(&self) -> &[Tensor] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current end of the pooling range.
    pub fn pool_end(&self) -> usize {
        self.pool_end
    }

    /// Apply the cache to the sequence leaving `stage`.
    pub fn step(&mut self, tokens: Tensor, stage: usize) -> Result<Tensor> {
        if !self.policy.is_enabled() {
            return Ok(tokens);
        }

        if self.policy.is_recovery(stage) {
            return self.recover(tokens, stage);
        }

        let accumulating = self
            .policy
            .last_recovery()
            .is_some_and(|last| stage < last);
        if accumulating {
            let entry = self.entry(&tokens)?;
            self.buffer.push(entry);
            trace!(stage, entries = self.buffer.len(), "cache accumulated");
        }
        Ok(tokens)
    }

    fn recover(&mut self, tokens: Tensor, stage: usize) -> Result<Tensor> {
        let (_, len, _) = tokens.dims3()?;
        self.pool_end = len;
        if self.buffer.is_empty() {
            return Ok(tokens);
        }

        let mut parts = Vec::with_capacity(self.buffer.len() + 1);
        parts.push(tokens);
        parts.append(&mut self.buffer);
        let tokens = Tensor::cat(&parts, 1)?;
        trace!(
            stage,
            recovered = parts.len() - 1,
            len = tokens.dim(1)?,
            "cache recovered"
        );
        Ok(tokens)
    }

    fn entry(&self, tokens: &Tensor) -> Result<Tensor> {
        match self.policy.mode() {
            CacheMode::Disabled => Err(Error::invalid("cache entry requested while disabled")),
            CacheMode::GlobalPoolOnly => self.global_pool(tokens),
            CacheMode::CarrierTokensOnly { count } => carriers(tokens, count),
            CacheMode::Both { count } => {
                let pool = self.global_pool(tokens)?;
                let carriers = carriers(tokens, count)?;
                Ok(Tensor::cat(&[&pool, &carriers], 1)?)
            }
        }
    }

    /// Mean over `[start, min(pool_end, N))` → `[B, 1, C]`.
    fn global_pool(&self, tokens: &Tensor) -> Result<Tensor> {
        let (_, len, _) = tokens.dims3()?;
        let start = if self.policy.pool_prefix() {
            0
        } else {
            self.num_prefix
        };
        let end = self.pool_end.min(len);
        if end <= start {
            return Err(Error::invalid(format!(
                "global pool range [{start}, {end}) is empty for a sequence of {len} tokens"
            )));
        }
        Ok(tokens.narrow(1, start, end - start)?.mean_keepdim(1)?)
    }
}

fn carriers(tokens: &Tensor, count: usize) -> Result<Tensor> {
    let (_, len, _) = tokens.dims3()?;
    if count > len {
        return Err(Error::shape(
            "carrier tokens",
            format!("at least {count} tokens"),
            tokens.dims(),
        ));
    }
    Ok(tokens.narrow(1, len - count, count)?)
}
