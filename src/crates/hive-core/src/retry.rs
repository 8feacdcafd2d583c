//! Exponential backoff for transient failures.
//!
//! Used in two places with distinct budgets: LLM-level retries inside the
//! event loop (a failed streaming turn is retried in place, emitting
//! `node_retry`), and node-level retries in the graph executor (a failed
//! node re-enters from scratch with a fresh conversation). Jitter is on by
//! default so synchronized failures do not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Default retry budget for transient LLM errors.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry budget plus backoff curve.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// First delay in seconds.
    pub initial_interval: f64,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
    /// Delay ceiling in seconds.
    pub max_interval: f64,
    /// Randomize each delay by 0.5x-1.5x.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl BackoffPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 60.0,
            jitter: true,
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// True while `retry_count` (1-indexed) is within budget.
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retries
    }

    /// Delay before the given retry (1-indexed):
    /// `initial * factor^(retry - 1)`, capped, with optional jitter.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_interval);
        let delayed = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(delayed.max(0.0))
    }
}
