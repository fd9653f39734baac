use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::DispatchError, models::retry::RetryPolicy};

/// Resolved binding of one listener name to one notification type.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerDescriptor {
    pub notification_type: String,
    pub listener_name: String,
    pub concurrency: usize,
    pub retry_policy: RetryPolicy,
    pub debounce: Option<DebounceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceConfig {
    pub wait_for_ms: u64,
    pub max_wait_for_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            wait_for_ms: 5000,
            max_wait_for_ms: 60_000,
        }
    }
}

impl DebounceConfig {
    pub fn new(wait_for_ms: u64, max_wait_for_ms: u64) -> Self {
        Self {
            wait_for_ms,
            max_wait_for_ms,
        }
    }

    pub fn wait_for(&self) -> Duration {
        Duration::from_millis(self.wait_for_ms)
    }

    pub fn max_wait_for(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_ms)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.wait_for_ms > self.max_wait_for_ms {
            return Err(DispatchError::Config(format!(
                "debounce waitFor {}ms exceeds maxWaitFor {}ms",
                self.wait_for_ms, self.max_wait_for_ms
            )));
        }

        Ok(())
    }
}

/// What a handler learns about the delivery it is processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerContext {
    pub notification_type: String,
    pub listener_name: String,
    pub concurrency: usize,
    /// Previous failed attempts; 0 on first delivery.
    pub attempt: u32,
    pub first_seen_ms: i64,
    pub delay_ms: Option<u64>,
}
