use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Exponential back-off parameters for redelivering a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total handler invocations allowed for one logical message.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1000, 2.0, 60_000)
    }
}

impl RetryPolicy {
    pub const fn new(
        max_attempts: u32,
        initial_delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            multiplier,
            max_delay_ms,
        }
    }

    /// Delay before redelivery number `attempt` (1-based):
    /// `min(initial * multiplier^(attempt - 1), max)`.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);

        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            raw.round() as u64
        }
    }

    /// Whether a message that has now been handled `attempts` times may be retried.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_attempts == 0 {
            return Err(DispatchError::Config(
                "retry max attempts must be at least 1".to_string(),
            ));
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(DispatchError::Config(format!(
                "retry multiplier {} must be >= 1.0",
                self.multiplier
            )));
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(DispatchError::Config(format!(
                "retry initial delay {}ms exceeds max delay {}ms",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }

        Ok(())
    }
}
