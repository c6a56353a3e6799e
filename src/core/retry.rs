//! Retry policy applied to every pipeline step.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::domain::ActivityError;

/// Bounded backoff for failed activity attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_first_retry_delay")]
    pub first_retry_delay_ms: u64,

    /// Growth factor per subsequent retry (1.0 = fixed delay)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_first_retry_delay() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    1.0
}
fn default_max_delay() -> u64 {
    300_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            first_retry_delay_ms: default_first_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Fixed-delay policy
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            first_retry_delay_ms: delay.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            );
        }
        Ok(())
    }

    /// Delay to wait after `failed_attempt` (1-indexed) before the next one:
    /// `first_retry_delay * multiplier^(failed_attempt - 1)`, capped.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1) as i32;
        let delay = self.first_retry_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Whether another attempt may follow `failed_attempt`
    pub fn should_retry(&self, failed_attempt: u32, error: &ActivityError) -> bool {
        error.is_retryable() && failed_attempt < self.max_attempts
    }
}
