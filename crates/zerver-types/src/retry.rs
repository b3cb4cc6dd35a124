//! Retry Policy
//!
//! Per-effect retry configuration: bounded attempts with multiplicative
//! backoff, an upper cap, and optional full jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy attached to an effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Retry {
    /// Additional attempts after the first (0 = never retry).
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Full jitter: sleep a uniform duration in `0..=backoff`.
    pub jitter: bool,
}

impl Retry {
    /// No retries: the effect is attempted exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// `attempts` retries with exponential backoff starting at `initial_ms`.
    pub fn exponential(attempts: u32, initial_ms: u64) -> Self {
        Self {
            max_attempts: attempts,
            initial_backoff_ms: initial_ms,
            max_backoff_ms: initial_ms.saturating_mul(32),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn with_max_backoff(mut self, max_ms: u64) -> Self {
        self.max_backoff_ms = max_ms;
        self
    }

    /// Backoff before re-dispatching retry number `attempt` (0-based),
    /// before jitter. Capped at `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> u64 {
        if self.initial_backoff_ms == 0 {
            return 0;
        }
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let raw = (self.initial_backoff_ms as f64 * factor) as u64;
        raw.min(self.max_backoff_ms.max(self.initial_backoff_ms))
    }

    /// Backoff with full jitter applied when enabled.
    pub fn jittered_backoff(&self, attempt: u32) -> u64 {
        let base = self.backoff_for(attempt);
        if self.jitter && base > 0 {
            rand::thread_rng().gen_range(0..=base)
        } else {
            base
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::none()
    }
}
